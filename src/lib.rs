//! TagFlow - Batch image labeling tool for AI training datasets
//!
//! 核心库：文件夹浏览、提示词模板、四个可互换的 VLM 后端，
//! 以及把标注结果写入图片同名 .txt 的批量引擎。

pub mod ai;
pub mod commands;
pub mod config;
pub mod imaging;
pub mod tagger;
pub mod templates;

use std::sync::Arc;
use tokio::sync::RwLock;

pub use ai::{BackendKind, GeminiClient, GenerationParams, LocalVlmServer, OpenAiCompatClient};
pub use config::AppConfig;
pub use tagger::{TagJob, TagJobStatus};
pub use templates::{PromptTemplate, TagFormat, TemplateStore};

/// 应用全局状态
pub struct AppState {
    /// 应用设置（JSON 文件）
    pub config: Arc<RwLock<AppConfig>>,
    /// 提示词模板存储
    pub templates: Arc<RwLock<TemplateStore>>,
    /// 本地模型槽位（未加载时为 None）
    pub local_vlm: Arc<RwLock<Option<LocalVlmServer>>>,
    /// 批量标注任务句柄
    pub job: TagJob,
}

impl AppState {
    /// 创建新的应用状态：加载配置与模板，本地模型延迟加载
    pub fn new() -> anyhow::Result<Self> {
        let config = AppConfig::load()?;
        let templates = TemplateStore::open()?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            templates: Arc::new(RwLock::new(templates)),
            local_vlm: Arc::new(RwLock::new(None)),
            job: TagJob::new(),
        })
    }
}
