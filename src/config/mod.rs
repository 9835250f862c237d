//! 配置管理模块
//!
//! 使用 JSON 文件存储应用设置，遵循平台约定：
//! - Linux: ~/.config/tagflow/config.json
//! - macOS: ~/Library/Application Support/com.tagflow.TagFlow/config.json
//! - Windows: %APPDATA%\tagflow\TagFlow\config.json
//!
//! API 密钥以 base64 混淆形式落盘（非加密，仅避免明文出现在备份或粘贴里），
//! 加载时透明还原。

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::ai::BackendKind;

/// 应用设置（扁平结构，对应 config.json 的固定键集合）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上次打开的图片文件夹
    #[serde(default)]
    pub last_folder: String,
    /// 当前选择的推理后端
    #[serde(default)]
    pub backend: BackendKind,

    /// Gemini 模型名称
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,
    /// Gemini API 密钥
    #[serde(default)]
    pub gemini_api_key: String,

    /// xAI 模型名称
    #[serde(default = "default_xai_model")]
    pub xai_model: String,
    /// xAI API 密钥
    #[serde(default)]
    pub xai_api_key: String,

    /// OpenRouter 模型名称
    #[serde(default = "default_openrouter_model")]
    pub openrouter_model: String,
    /// OpenRouter API 密钥
    #[serde(default)]
    pub openrouter_api_key: String,
    /// 推理强度 (none/minimal/low/medium/high/auto，仅 OpenRouter)
    #[serde(default = "default_reasoning_effort")]
    pub reasoning_effort: String,

    /// 本地 GGUF 模型文件路径
    #[serde(default)]
    pub local_model_path: String,
    /// 本地多模态投影 (mmproj) 文件路径
    #[serde(default)]
    pub local_mmproj_path: String,
    /// 本地推理上下文窗口大小
    #[serde(default = "default_ctx_size")]
    pub local_ctx_size: u32,
    /// GPU 卸载层数（-1 表示全部）
    #[serde(default = "default_gpu_layers")]
    pub local_gpu_layers: i32,

    /// 采样温度
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Top-K 采样
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    /// Top-P (nucleus) 采样
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Min-P 采样（仅本地后端生效）
    #[serde(default = "default_min_p")]
    pub min_p: f32,
    /// 重复惩罚（仅本地后端生效）
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    /// 最大输出 tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// 当前选择的提示词模板名称
    #[serde(default = "default_template")]
    pub selected_template: String,
    /// 当前系统提示词（随模板编辑，关闭时保存）
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// 可选的标注输出目录（空表示与图片同目录）
    #[serde(default)]
    pub output_dir: String,

    /// 窗口宽度
    #[serde(default = "default_window_width")]
    pub window_width: u32,
    /// 窗口高度
    #[serde(default = "default_window_height")]
    pub window_height: u32,
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_xai_model() -> String {
    "grok-4".to_string()
}
fn default_openrouter_model() -> String {
    "qwen/qwen-2.5-vl-72b-instruct".to_string()
}
fn default_reasoning_effort() -> String {
    "none".to_string()
}
fn default_ctx_size() -> u32 {
    8192
}
fn default_gpu_layers() -> i32 {
    -1
}
fn default_temperature() -> f32 {
    0.4
}
fn default_top_k() -> u32 {
    40
}
fn default_top_p() -> f32 {
    0.9
}
fn default_min_p() -> f32 {
    0.05
}
fn default_repeat_penalty() -> f32 {
    1.1
}
fn default_max_tokens() -> u32 {
    512
}
fn default_template() -> String {
    "Danbooru Tag".to_string()
}
fn default_system_prompt() -> String {
    "You are an expert image tagger for anime, illustrations, and photographs.".to_string()
}
fn default_window_width() -> u32 {
    1400
}
fn default_window_height() -> u32 {
    900
}

impl Default for AppConfig {
    fn default() -> Self {
        // 字段级 serde 默认值即应用默认值，从空对象反序列化即可得到
        serde_json::from_str("{}").expect("default config must deserialize")
    }
}

impl AppConfig {
    /// 获取配置目录路径
    pub fn config_dir() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("com", "tagflow", "TagFlow") {
            Ok(proj_dirs.config_dir().to_path_buf())
        } else {
            // 回退到 ~/.tagflow
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot find home directory"))?;
            Ok(home.join(".tagflow"))
        }
    }

    /// 获取配置文件完整路径
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// 从文件加载配置
    ///
    /// 文件不存在时返回默认配置并创建文件。
    /// 未知键被忽略，缺失键取默认值，旧版本文件可以直接升级。
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// 从指定路径加载配置
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        debug!("Loading config from: {}", path.display());

        if path.exists() {
            let content = fs::read_to_string(path)?;
            let mut config: Self = serde_json::from_str(&content).map_err(|e| {
                warn!("Failed to parse config file: {}, using defaults", e);
                e
            })?;
            config.deobfuscate_keys();
            info!("Config loaded from: {}", path.display());
            Ok(config)
        } else {
            info!(
                "Config file not found, creating default at: {}",
                path.display()
            );
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// 保存配置到默认位置
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// 保存配置到指定路径
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        let dir = path.parent().ok_or_else(|| anyhow!("Invalid config path"))?;

        if !dir.exists() {
            fs::create_dir_all(dir)?;
            debug!("Created config directory: {}", dir.display());
        }

        // 落盘前混淆 API 密钥
        let mut to_save = self.clone();
        to_save.obfuscate_keys();
        let content = serde_json::to_string_pretty(&to_save)?;

        fs::write(path, &content)?;

        // 设置文件权限 (Unix only) - 仅用户可读写
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        info!("Config saved to: {}", path.display());
        Ok(())
    }

    /// 返回指定后端使用的 API 密钥（本地后端无密钥）
    pub fn api_key_for(&self, backend: BackendKind) -> &str {
        match backend {
            BackendKind::Gemini => &self.gemini_api_key,
            BackendKind::Xai => &self.xai_api_key,
            BackendKind::OpenRouter => &self.openrouter_api_key,
            BackendKind::Local => "",
        }
    }

    fn obfuscate_keys(&mut self) {
        for key in [
            &mut self.gemini_api_key,
            &mut self.xai_api_key,
            &mut self.openrouter_api_key,
        ] {
            if !key.is_empty() {
                *key = BASE64.encode(key.as_bytes());
            }
        }
    }

    fn deobfuscate_keys(&mut self) {
        for key in [
            &mut self.gemini_api_key,
            &mut self.xai_api_key,
            &mut self.openrouter_api_key,
        ] {
            if key.is_empty() {
                continue;
            }
            // 解码失败说明是手工编辑的明文密钥，原样保留
            if let Ok(decoded) = BASE64.decode(key.as_bytes()) {
                if let Ok(plain) = String::from_utf8(decoded) {
                    *key = plain;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.backend, BackendKind::Gemini);
        assert_eq!(config.gemini_model, "gemini-2.5-flash");
        assert_eq!(config.temperature, 0.4);
        assert_eq!(config.top_k, 40);
        assert_eq!(config.max_tokens, 512);
        assert!(config.last_folder.is_empty());
    }

    #[test]
    fn test_unknown_and_missing_keys() {
        // 旧版本文件可能缺键或带未知键，两者都不应报错
        let json = r#"{"last_folder": "/data/images", "some_future_key": 42}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.last_folder, "/data/images");
        assert_eq!(config.top_p, 0.9);
    }

    #[test]
    fn test_key_obfuscation_roundtrip() {
        let mut config = AppConfig::default();
        config.gemini_api_key = "AIzaSy-test-key".to_string();
        config.xai_api_key = "xai-secret".to_string();

        config.obfuscate_keys();
        assert_ne!(config.gemini_api_key, "AIzaSy-test-key");
        assert!(BASE64.decode(config.gemini_api_key.as_bytes()).is_ok());
        // 空密钥保持为空
        assert!(config.openrouter_api_key.is_empty());

        config.deobfuscate_keys();
        assert_eq!(config.gemini_api_key, "AIzaSy-test-key");
        assert_eq!(config.xai_api_key, "xai-secret");
    }

    #[test]
    fn test_plaintext_key_survives_deobfuscation() {
        let mut config = AppConfig::default();
        // '!' 不是合法 base64 字符，解码失败时应原样保留
        config.gemini_api_key = "not-base64!".to_string();
        config.deobfuscate_keys();
        assert_eq!(config.gemini_api_key, "not-base64!");
    }

    #[test]
    fn test_file_roundtrip_obfuscates_on_disk() {
        let dir = std::env::temp_dir().join(format!("tagflow-config-{}", std::process::id()));
        let path = dir.join("config.json");

        let mut config = AppConfig::default();
        config.gemini_api_key = "AIzaSy-test-key".to_string();
        config.last_folder = "/data/images".to_string();
        config.save_to(&path).unwrap();

        // 磁盘上不出现明文密钥
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("AIzaSy-test-key"));

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.gemini_api_key, "AIzaSy-test-key");
        assert_eq!(loaded.last_folder, "/data/images");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_config_serialization() {
        let config = AppConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"backend\""));
        assert!(json.contains("\"temperature\""));

        let parsed: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.selected_template, config.selected_template);
        assert_eq!(parsed.window_width, 1400);
    }
}
