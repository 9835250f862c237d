//! Gemini API 客户端
//!
//! 调用 Google Generative Language REST 接口 (`models/{model}:generateContent`)。
//! 图片以 `inline_data` 内嵌传输，标注指令放在 `systemInstruction`。

use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{BackendError, GenerationParams, USER_TRIGGER_PROMPT};
use crate::imaging::EncodedImage;

/// Gemini 接口地址
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini 视觉模型（2025 更新）
pub const GEMINI_MODELS: &[&str] = &["gemini-2.5-flash", "gemini-2.5-pro", "gemini-2.0-flash"];

/// Gemini API 客户端
#[derive(Debug, Clone)]
pub struct GeminiClient {
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self::with_base_url(GEMINI_BASE_URL, api_key, model)
    }

    pub fn with_base_url(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client must build"),
        }
    }

    /// 是否配置了非空 API 密钥
    pub fn has_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// 校验密钥可用（GET /models）
    pub async fn check_endpoint(&self) -> Result<(), BackendError> {
        let url = format!("{}/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            debug!("Gemini endpoint is reachable");
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(BackendError::Api {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// 组装 generateContent 请求体
    fn build_request_body(
        &self,
        image: &EncodedImage,
        system_prompt: &str,
        params: &GenerationParams,
    ) -> serde_json::Value {
        let mut body = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {"inline_data": {"mime_type": image.mime, "data": image.base64}},
                    {"text": USER_TRIGGER_PROMPT}
                ]
            }],
            "generationConfig": {
                "temperature": params.temperature,
                "topK": params.top_k,
                "topP": params.top_p,
                "maxOutputTokens": params.max_tokens,
            }
        });

        if !system_prompt.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system_prompt}]});
        }

        body
    }

    /// 为一张图片生成标注文本
    pub async fn generate(
        &self,
        image: &EncodedImage,
        system_prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, BackendError> {
        if self.api_key.is_empty() {
            return Err(BackendError::NotConfigured(
                "Gemini API key is empty".to_string(),
            ));
        }

        let body = self.build_request_body(image, system_prompt, params);
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        info!(
            "Gemini API request: model={}, max_tokens={}, temperature={}, payload={}KB",
            self.model,
            params.max_tokens,
            params.temperature,
            image.base64.len() / 1024
        );

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        info!(
            "Gemini API response: status={}, elapsed={:.2}s",
            status,
            start.elapsed().as_secs_f64()
        );

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Gemini API error: status={}, body={}", status, body);
            return Err(BackendError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let result: serde_json::Value = response.json().await?;

        if let Some(usage) = result.get("usageMetadata") {
            debug!(
                "Gemini API usage: prompt_tokens={}, output_tokens={}",
                usage.get("promptTokenCount").and_then(|v| v.as_i64()).unwrap_or(0),
                usage.get("candidatesTokenCount").and_then(|v| v.as_i64()).unwrap_or(0),
            );
        }

        Self::extract_text(&result)
    }

    /// 从响应中取出候选文本（多 part 拼接）
    fn extract_text(value: &serde_json::Value) -> Result<String, BackendError> {
        let parts = value["candidates"][0]["content"]["parts"]
            .as_array()
            .ok_or_else(|| {
                BackendError::EmptyCompletion(
                    value["candidates"][0]["finishReason"]
                        .as_str()
                        .unwrap_or("no candidates in response")
                        .to_string(),
                )
            })?;

        let text: String = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        let text = text.trim().to_string();

        if text.is_empty() {
            return Err(BackendError::EmptyCompletion(
                "candidate contained no text parts".to_string(),
            ));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded() -> EncodedImage {
        EncodedImage {
            mime: "image/jpeg",
            base64: "AAAA".to_string(),
        }
    }

    #[test]
    fn test_build_request_body() {
        let client = GeminiClient::new("key", "gemini-2.5-flash");
        let body = client.build_request_body(&encoded(), "Tag this.", &GenerationParams::default());

        assert_eq!(
            body["contents"][0]["parts"][0]["inline_data"]["mime_type"],
            "image/jpeg"
        );
        assert_eq!(body["contents"][0]["parts"][1]["text"], USER_TRIGGER_PROMPT);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Tag this.");
        assert_eq!(body["generationConfig"]["topK"], 40);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 512);
    }

    #[test]
    fn test_empty_system_prompt_omitted() {
        let client = GeminiClient::new("key", "gemini-2.5-flash");
        let body = client.build_request_body(&encoded(), "", &GenerationParams::default());
        assert!(body.get("systemInstruction").is_none());
    }

    #[test]
    fn test_extract_text_joins_parts() {
        let value = serde_json::json!({
            "candidates": [{"content": {"parts": [
                {"text": "1girl, "},
                {"text": "solo"}
            ]}}]
        });
        assert_eq!(GeminiClient::extract_text(&value).unwrap(), "1girl, solo");
    }

    #[test]
    fn test_extract_text_blocked_candidate() {
        let value = serde_json::json!({
            "candidates": [{"finishReason": "SAFETY"}]
        });
        let err = GeminiClient::extract_text(&value).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }
}
