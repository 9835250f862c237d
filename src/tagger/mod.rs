//! 批量标注引擎
//!
//! 顺序遍历选中的图片：解码 → 编码 → 调用后端 → 写 sidecar。
//! 单张失败记账后继续（跳过该图），后端未就绪则在循环前中止。
//! 通过共享 AtomicBool 在两次迭代之间协作取消，
//! 进度以事件回调的方式逐张上报。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::ai::{
    BackendError, GeminiClient, GenerationParams, LocalVlmServer, OpenAiCompatClient,
};
use crate::imaging;

/// 进度事件名（前端监听）
pub const EVENT_PROGRESS: &str = "tagging://progress";
/// 单张完成事件名
pub const EVENT_TAGGED: &str = "tagging://tagged";
/// 单张失败事件名
pub const EVENT_ERROR: &str = "tagging://error";
/// 批次结束事件名
pub const EVENT_DONE: &str = "tagging://done";

/// 已配置好的标注后端
pub enum TagBackend {
    /// 本地 llama-server（共享槽位，复用已加载的模型）
    Local(Arc<RwLock<Option<LocalVlmServer>>>),
    Gemini(GeminiClient),
    /// xAI / OpenRouter
    OpenAiCompat(OpenAiCompatClient),
}

impl TagBackend {
    /// 批次开始前的就绪检查
    pub async fn check_ready(&self) -> Result<(), BackendError> {
        match self {
            Self::Local(slot) => {
                if slot.read().await.is_none() {
                    return Err(BackendError::NotConfigured(
                        "no local model loaded".to_string(),
                    ));
                }
                Ok(())
            }
            Self::Gemini(client) => {
                if !client.has_key() {
                    return Err(BackendError::NotConfigured(
                        "Gemini API key is empty".to_string(),
                    ));
                }
                Ok(())
            }
            Self::OpenAiCompat(client) => {
                if !client.has_key() {
                    return Err(BackendError::NotConfigured(
                        "API key is empty".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// 为一张已编码的图片生成标注
    async fn generate(
        &self,
        encoded: &imaging::EncodedImage,
        system_prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, BackendError> {
        match self {
            Self::Local(slot) => {
                let guard = slot.read().await;
                let server = guard.as_ref().ok_or_else(|| {
                    BackendError::NotConfigured("no local model loaded".to_string())
                })?;
                server
                    .generate(&encoded.data_uri(), system_prompt, params)
                    .await
            }
            Self::Gemini(client) => client.generate(encoded, system_prompt, params).await,
            Self::OpenAiCompat(client) => {
                client
                    .generate(&encoded.data_uri(), system_prompt, params)
                    .await
            }
        }
    }
}

/// 批次事件（由上层转成 Tauri 事件或在测试中直接收集）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    Progress {
        current: usize,
        total: usize,
        file_name: String,
    },
    Tagged {
        path: String,
        text: String,
        sidecar_path: String,
    },
    Error {
        file_name: String,
        message: String,
    },
    Done {
        processed: u64,
        failed: u64,
        cancelled: bool,
    },
}

/// 批次结果汇总
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub processed: u64,
    pub failed: u64,
    pub cancelled: bool,
}

/// 标注任务状态（状态查询命令返回）
#[derive(Debug, Clone, Serialize)]
pub struct TagJobStatus {
    pub is_running: bool,
    pub processed: u64,
    pub failed: u64,
    pub total: u64,
}

/// 批量标注任务句柄。
/// 同一时刻只允许一个批次在跑；取消在两张图之间生效。
#[derive(Clone, Default)]
pub struct TagJob {
    is_running: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl TagJob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// 在派发后台任务之前同步占用运行标记。
    /// 返回 false 表示已有批次在跑。占用成功后必须调用 `run()` 释放。
    pub fn try_start(&self) -> bool {
        self.is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// 请求停止当前批次
    pub fn request_stop(&self) {
        if self.is_running() {
            info!("Stop requested for tagging batch");
            self.cancel.store(true, Ordering::SeqCst);
        }
    }

    pub fn status(&self) -> TagJobStatus {
        TagJobStatus {
            is_running: self.is_running(),
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
        }
    }

    /// 执行一个批次。调用方负责放到后台任务里运行；
    /// 并发入口应先用 `try_start()` 同步占用运行标记，结束时由本方法释放。
    pub async fn run(
        &self,
        backend: TagBackend,
        images: Vec<PathBuf>,
        system_prompt: String,
        params: GenerationParams,
        output_dir: Option<PathBuf>,
        on_event: impl Fn(JobEvent),
    ) -> BatchSummary {
        self.is_running.store(true, Ordering::SeqCst);
        self.cancel.store(false, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.total.store(images.len() as u64, Ordering::SeqCst);

        let summary = self
            .run_inner(backend, images, &system_prompt, &params, output_dir.as_deref(), &on_event)
            .await;

        on_event(JobEvent::Done {
            processed: summary.processed,
            failed: summary.failed,
            cancelled: summary.cancelled,
        });
        self.is_running.store(false, Ordering::SeqCst);

        if summary.failed > 0 {
            warn!(
                "Tagging batch finished with {} failed of {} images",
                summary.failed,
                summary.processed + summary.failed
            );
        } else {
            info!("Tagging batch finished: {} images processed", summary.processed);
        }
        summary
    }

    async fn run_inner(
        &self,
        backend: TagBackend,
        images: Vec<PathBuf>,
        system_prompt: &str,
        params: &GenerationParams,
        output_dir: Option<&Path>,
        on_event: &impl Fn(JobEvent),
    ) -> BatchSummary {
        let total = images.len();
        info!("Starting tagging batch: {} images", total);

        // 后端未就绪时整批中止，而不是每张图失败一次
        if let Err(e) = backend.check_ready().await {
            warn!("Backend not ready: {}", e);
            on_event(JobEvent::Error {
                file_name: String::new(),
                message: e.to_string(),
            });
            return self.summary(false);
        }

        for (i, image_path) in images.iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                info!("Tagging batch cancelled after {} images", i);
                return self.summary(true);
            }

            let file_name = image_path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            on_event(JobEvent::Progress {
                current: i + 1,
                total,
                file_name: file_name.clone(),
            });

            match self
                .process_one(&backend, image_path, system_prompt, params, output_dir)
                .await
            {
                Ok((text, sidecar)) => {
                    self.processed.fetch_add(1, Ordering::SeqCst);
                    on_event(JobEvent::Tagged {
                        path: image_path.to_string_lossy().to_string(),
                        text,
                        sidecar_path: sidecar.to_string_lossy().to_string(),
                    });
                }
                Err(e) => {
                    // 单张失败不终止批次
                    warn!("Failed to tag {}: {}", file_name, e);
                    self.failed.fetch_add(1, Ordering::SeqCst);
                    on_event(JobEvent::Error {
                        file_name,
                        message: e.to_string(),
                    });
                }
            }
        }

        self.summary(false)
    }

    async fn process_one(
        &self,
        backend: &TagBackend,
        image_path: &Path,
        system_prompt: &str,
        params: &GenerationParams,
        output_dir: Option<&Path>,
    ) -> anyhow::Result<(String, PathBuf)> {
        let img = imaging::load_image(image_path)?;
        let encoded = imaging::encode_for_upload(&img)?;
        let text = backend.generate(&encoded, system_prompt, params).await?;
        let text = text.trim().to_string();
        let sidecar = imaging::write_sidecar(image_path, &text, output_dir)?;
        Ok((text, sidecar))
    }

    fn summary(&self, cancelled: bool) -> BatchSummary {
        BatchSummary {
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collect_events() -> (Arc<Mutex<Vec<JobEvent>>>, impl Fn(JobEvent)) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (events, move |e| sink.lock().unwrap().push(e))
    }

    fn temp_images(tag: &str, count: usize) -> (PathBuf, Vec<PathBuf>) {
        let dir = std::env::temp_dir().join(format!("tagflow-tagger-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let paths = (0..count)
            .map(|i| {
                let path = dir.join(format!("img{}.png", i));
                image::RgbImage::new(4, 4).save(&path).unwrap();
                path
            })
            .collect();
        (dir, paths)
    }

    #[tokio::test]
    async fn test_unready_backend_aborts_batch() {
        let (dir, images) = temp_images("unready", 2);
        let (events, on_event) = collect_events();

        let job = TagJob::new();
        let backend = TagBackend::Gemini(GeminiClient::new("", "gemini-2.5-flash"));
        let summary = job
            .run(
                backend,
                images,
                "prompt".to_string(),
                GenerationParams::default(),
                None,
                on_event,
            )
            .await;

        assert_eq!(summary.processed, 0);
        assert_eq!(summary.failed, 0);
        assert!(!job.is_running());

        // 一条后端级错误 + 结束事件，没有逐张的进度事件
        let events = events.lock().unwrap();
        assert!(matches!(events[0], JobEvent::Error { ref file_name, .. } if file_name.is_empty()));
        assert!(matches!(events.last(), Some(JobEvent::Done { .. })));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_cancel_before_first_image() {
        let (dir, images) = temp_images("cancel", 3);
        let (events, on_event) = collect_events();

        let job = TagJob::new();
        // 就绪检查能通过，但取消在第一张之前生效，不会发出任何网络请求
        job.cancel.store(true, Ordering::SeqCst);
        let backend = TagBackend::Gemini(GeminiClient::new("dummy-key", "gemini-2.5-flash"));

        // run() 会重置取消标记，这里直接驱动内层循环
        job.total.store(images.len() as u64, Ordering::SeqCst);
        let summary = job
            .run_inner(
                backend,
                images,
                "prompt",
                &GenerationParams::default(),
                None,
                &on_event,
            )
            .await;

        assert!(summary.cancelled);
        assert_eq!(summary.processed, 0);
        assert!(events.lock().unwrap().is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_try_start_claims_flag_before_task_polls() {
        let (dir, images) = temp_images("race", 1);
        let (_events, on_event) = collect_events();

        let job = TagJob::new();
        // 第一个调用方占用后，后台任务哪怕还没被轮询，
        // 第二个调用方也必须立刻看到"运行中"
        assert!(job.try_start());
        assert!(job.is_running());
        assert!(!job.try_start());

        // 批次结束后释放占用，可以再次启动
        let backend = TagBackend::Gemini(GeminiClient::new("", "gemini-2.5-flash"));
        job.run(
            backend,
            images,
            "prompt".to_string(),
            GenerationParams::default(),
            None,
            on_event,
        )
        .await;
        assert!(!job.is_running());
        assert!(job.try_start());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_undecodable_images_skipped_batch_continues() {
        // 单张解码失败记账后继续，不终止批次
        let dir = std::env::temp_dir().join(format!("tagflow-tagger-skip-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let images: Vec<PathBuf> = (0..3)
            .map(|i| {
                let path = dir.join(format!("broken{}.png", i));
                std::fs::write(&path, b"not a png").unwrap();
                path
            })
            .collect();
        let (events, on_event) = collect_events();

        let job = TagJob::new();
        // 密钥非空，就绪检查通过；失败发生在解码阶段，不走网络
        let backend = TagBackend::Gemini(GeminiClient::new("dummy-key", "gemini-2.5-flash"));
        let summary = job
            .run(
                backend,
                images,
                "prompt".to_string(),
                GenerationParams::default(),
                None,
                on_event,
            )
            .await;

        assert_eq!(summary.failed, 3);
        assert_eq!(summary.processed, 0);
        assert!(!summary.cancelled);

        let events = events.lock().unwrap();
        let errors = events
            .iter()
            .filter(|e| matches!(e, JobEvent::Error { file_name, .. } if !file_name.is_empty()))
            .count();
        assert_eq!(errors, 3);
        assert!(matches!(
            events.last(),
            Some(JobEvent::Done { failed: 3, processed: 0, .. })
        ));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_local_backend_without_model_not_ready() {
        let slot: Arc<RwLock<Option<LocalVlmServer>>> = Arc::new(RwLock::new(None));
        let backend = TagBackend::Local(slot);
        let err = backend.check_ready().await.unwrap_err();
        assert!(err.to_string().contains("no local model loaded"));
    }

    #[test]
    fn test_status_defaults() {
        let job = TagJob::new();
        let status = job.status();
        assert!(!status.is_running);
        assert_eq!(status.processed, 0);
        assert_eq!(status.failed, 0);
        assert_eq!(status.total, 0);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = JobEvent::Progress {
            current: 1,
            total: 10,
            file_name: "cat.png".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "progress");
        assert_eq!(json["total"], 10);
    }
}
