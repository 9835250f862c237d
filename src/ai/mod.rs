//! 推理后端模块
//!
//! 四个可互换的视觉语言模型后端：
//! - 本地 GGUF 模型（llama-server 子进程，OpenAI 兼容接口）
//! - Gemini API
//! - xAI API
//! - OpenRouter API
//!
//! 对上层统一为"图片 + 提示词 + 采样参数 → 文本"。

pub mod gemini;
pub mod local;
pub mod openai_compat;

pub use gemini::{GeminiClient, GEMINI_MODELS};
pub use local::LocalVlmServer;
pub use openai_compat::{
    OpenAiCompatClient, OPENROUTER_BASE_URL, OPENROUTER_MODELS, XAI_BASE_URL, XAI_MODELS,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 固定的用户触发提示词，真正的标注指令放在系统提示词里
pub const USER_TRIGGER_PROMPT: &str = "Analyze this image and follow the instructions provided.";

/// 推理后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 本地 GGUF 模型
    Local,
    /// Google Gemini API
    Gemini,
    /// xAI Grok API
    Xai,
    /// OpenRouter API
    OpenRouter,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Gemini
    }
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Gemini => "gemini",
            Self::Xai => "xai",
            Self::OpenRouter => "openrouter",
        }
    }

    /// 显示名称（设置面板下拉框）
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Local => "Local VLM",
            Self::Gemini => "Gemini API",
            Self::Xai => "xAI Grok",
            Self::OpenRouter => "OpenRouter",
        }
    }
}

/// 采样参数，随每次生成请求传递
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    /// 仅本地后端生效
    pub min_p: f32,
    /// 仅本地后端生效
    pub repeat_penalty: f32,
    pub max_tokens: u32,
    /// 推理强度 (none/minimal/low/medium/high/auto)，仅 OpenRouter
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.4,
            top_k: 40,
            top_p: 0.9,
            min_p: 0.05,
            repeat_penalty: 1.1,
            max_tokens: 512,
            reasoning_effort: None,
        }
    }
}

impl GenerationParams {
    /// 从应用配置提取采样参数
    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            min_p: config.min_p,
            repeat_penalty: config.repeat_penalty,
            max_tokens: config.max_tokens,
            reasoning_effort: if config.reasoning_effort.is_empty() {
                None
            } else {
                Some(config.reasoning_effort.clone())
            },
        }
    }
}

/// 后端错误
#[derive(Debug, Error)]
pub enum BackendError {
    /// 后端未配置（缺密钥 / 未加载模型）
    #[error("Backend not configured: {0}")]
    NotConfigured(String),

    /// 网络/传输层错误
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// API 返回非 2xx 状态
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    /// 响应解析失败或内容为空
    #[error("Empty or malformed completion: {0}")]
    EmptyCompletion(String),

    /// 本地模型加载失败
    #[error("Model load failed: {0}")]
    ModelLoad(String),
}

/// 从 OpenAI 风格的 chat completion 响应中取出文本
pub(crate) fn extract_chat_text(value: &serde_json::Value) -> Result<String, BackendError> {
    let content = value["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or("")
        .trim();

    if content.is_empty() {
        return Err(BackendError::EmptyCompletion(
            value["choices"][0]["finish_reason"]
                .as_str()
                .unwrap_or("no choices in response")
                .to_string(),
        ));
    }
    Ok(content.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_serde_roundtrip() {
        for kind in [
            BackendKind::Local,
            BackendKind::Gemini,
            BackendKind::Xai,
            BackendKind::OpenRouter,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            let parsed: BackendKind = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, kind);
        }
        // 配置文件里的小写字符串
        assert_eq!(
            serde_json::from_str::<BackendKind>("\"openrouter\"").unwrap(),
            BackendKind::OpenRouter
        );
    }

    #[test]
    fn test_extract_chat_text() {
        let value = serde_json::json!({
            "choices": [{"message": {"content": "  1girl, solo, short hair  "}}]
        });
        assert_eq!(extract_chat_text(&value).unwrap(), "1girl, solo, short hair");
    }

    #[test]
    fn test_extract_chat_text_empty() {
        let value = serde_json::json!({
            "choices": [{"message": {"content": ""}, "finish_reason": "content_filter"}]
        });
        let err = extract_chat_text(&value).unwrap_err();
        assert!(matches!(err, BackendError::EmptyCompletion(_)));
        assert!(err.to_string().contains("content_filter"));
    }
}
