//! OpenAI 兼容 API 客户端
//!
//! xAI 和 OpenRouter 都使用 OpenAI chat completion 格式；
//! 本地 llama-server 同样暴露该接口，三者共用这一个客户端。

use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{extract_chat_text, BackendError, GenerationParams, USER_TRIGGER_PROMPT};

/// xAI 接口地址
pub const XAI_BASE_URL: &str = "https://api.x.ai/v1";

/// OpenRouter 接口地址
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// xAI 视觉模型（2025 更新）
pub const XAI_MODELS: &[&str] = &[
    "grok-4",
    "grok-4-fast",
    "grok-4.1",
    "grok-4.1-fast",
    "grok-3",
];

/// OpenRouter 视觉模型（精选）
pub const OPENROUTER_MODELS: &[&str] = &[
    "qwen/qwen-2.5-vl-72b-instruct",
    "x-ai/grok-4",
    "mistralai/pixtral-large-latest",
    "google/gemini-2.5-flash",
    "openai/gpt-4o",
    "meta-llama/llama-4-scout",
];

/// OpenAI 兼容端点客户端
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    /// 是否附带扩展采样参数 (top_k/min_p/repeat_penalty)。
    /// llama-server 支持这些字段，云端接口会拒绝未知参数。
    extended_sampling: bool,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(base_url: &str, model: &str, api_key: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.map(|s| s.to_string()),
            extended_sampling: false,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client must build"),
        }
    }

    /// xAI 客户端
    pub fn xai(api_key: &str, model: &str) -> Self {
        Self::new(XAI_BASE_URL, model, Some(api_key))
    }

    /// OpenRouter 客户端
    pub fn openrouter(api_key: &str, model: &str) -> Self {
        Self::new(OPENROUTER_BASE_URL, model, Some(api_key))
    }

    /// 本地 llama-server 客户端（无密钥，开启扩展采样参数）
    pub fn local(base_url: &str, model: &str) -> Self {
        let mut client = Self::new(base_url, model, None);
        client.extended_sampling = true;
        client
    }

    /// 是否配置了非空 API 密钥
    pub fn has_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// 探测端点是否可达（GET /models）
    pub async fn check_endpoint(&self) -> Result<(), BackendError> {
        let url = format!("{}/models", self.base_url);
        let mut req = self.client.get(&url).timeout(Duration::from_secs(10));
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            debug!("Endpoint {} is reachable", self.base_url);
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(BackendError::Api {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// 组装 chat completion 请求体
    fn build_request_body(
        &self,
        image_data_uri: &str,
        system_prompt: &str,
        params: &GenerationParams,
    ) -> serde_json::Value {
        let mut messages = Vec::new();
        if !system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": system_prompt}));
        }
        messages.push(json!({
            "role": "user",
            "content": [
                {"type": "image_url", "image_url": {"url": image_data_uri}},
                {"type": "text", "text": USER_TRIGGER_PROMPT}
            ]
        }));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "max_tokens": params.max_tokens,
        });

        if self.extended_sampling {
            body["top_k"] = json!(params.top_k);
            body["min_p"] = json!(params.min_p);
            body["repeat_penalty"] = json!(params.repeat_penalty);
        }

        // OpenRouter 推理控制：内部可以思考但不把思考过程混进标注输出
        if let Some(ref effort) = params.reasoning_effort {
            if effort != "auto" && !effort.is_empty() {
                body["reasoning"] = json!({"effort": effort, "exclude": true});
            }
        }

        body
    }

    /// 为一张图片生成标注文本
    pub async fn generate(
        &self,
        image_data_uri: &str,
        system_prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, BackendError> {
        let body = self.build_request_body(image_data_uri, system_prompt, params);
        let url = format!("{}/chat/completions", self.base_url);

        info!(
            "Chat API request: endpoint={}, model={}, max_tokens={}, temperature={}, payload={}KB",
            self.base_url,
            self.model,
            params.max_tokens,
            params.temperature,
            image_data_uri.len() / 1024
        );

        let start = Instant::now();
        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await?;
        let status = response.status();
        info!(
            "Chat API response: status={}, elapsed={:.2}s",
            status,
            start.elapsed().as_secs_f64()
        );

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Chat API error: status={}, body={}", status, body);
            return Err(BackendError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let result: serde_json::Value = response.json().await?;

        if let Some(usage) = result.get("usage") {
            debug!(
                "Chat API usage: prompt_tokens={}, completion_tokens={}",
                usage.get("prompt_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
                usage.get("completion_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
            );
        }

        extract_chat_text(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_uri() -> &'static str {
        "data:image/jpeg;base64,AAAA"
    }

    #[test]
    fn test_build_request_body_cloud() {
        let client = OpenAiCompatClient::xai("key", "grok-4");
        let body = client.build_request_body(data_uri(), "Tag this.", &GenerationParams::default());

        assert_eq!(body["model"], "grok-4");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(
            body["messages"][1]["content"][0]["image_url"]["url"],
            data_uri()
        );
        assert_eq!(body["messages"][1]["content"][1]["text"], USER_TRIGGER_PROMPT);
        // 云端请求不带扩展采样参数
        assert!(body.get("top_k").is_none());
        assert!(body.get("min_p").is_none());
        assert!(body.get("reasoning").is_none());
    }

    #[test]
    fn test_build_request_body_local_extended_sampling() {
        let client = OpenAiCompatClient::local("http://127.0.0.1:8080/v1", "local");
        let body = client.build_request_body(data_uri(), "Tag this.", &GenerationParams::default());
        assert_eq!(body["top_k"], 40);
        assert_eq!(body["min_p"], 0.05f32);
        assert_eq!(body["repeat_penalty"], 1.1f32);
    }

    #[test]
    fn test_build_request_body_reasoning() {
        let client = OpenAiCompatClient::openrouter("key", "x-ai/grok-4");
        let mut params = GenerationParams::default();
        params.reasoning_effort = Some("low".to_string());
        let body = client.build_request_body(data_uri(), "Tag this.", &params);
        assert_eq!(body["reasoning"]["effort"], "low");
        assert_eq!(body["reasoning"]["exclude"], true);

        // auto 表示交给服务端决定，不发送 reasoning 字段
        params.reasoning_effort = Some("auto".to_string());
        let body = client.build_request_body(data_uri(), "Tag this.", &params);
        assert!(body.get("reasoning").is_none());
    }

    #[test]
    fn test_empty_system_prompt_omits_system_message() {
        let client = OpenAiCompatClient::xai("key", "grok-4");
        let body = client.build_request_body(data_uri(), "", &GenerationParams::default());
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn test_trailing_slash_normalized() {
        let client = OpenAiCompatClient::new("https://api.x.ai/v1/", "grok-4", None);
        assert_eq!(client.base_url, "https://api.x.ai/v1");
    }
}
