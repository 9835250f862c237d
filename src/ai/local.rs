//! 本地 GGUF 模型后端
//!
//! 通过托管一个 `llama-server` 子进程来加载 GGUF 模型与 mmproj 投影文件，
//! 然后复用 OpenAI 兼容客户端与其通信。加载失败（二进制缺失、架构不支持、
//! 投影文件缺失）通过子进程的 stderr 尾部内容上报。

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{BackendError, GenerationParams, OpenAiCompatClient};

/// llama-server 二进制名称，可用环境变量覆盖
const SERVER_BINARY: &str = "llama-server";
const SERVER_BINARY_ENV: &str = "TAGFLOW_LLAMA_SERVER";

/// 模型加载就绪超时（大模型冷启动可能很慢）
const READY_TIMEOUT: Duration = Duration::from_secs(180);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// 保留的 stderr 尾部行数，用于报错
const STDERR_TAIL_LINES: usize = 20;

/// 本地模型状态（返回给前端）
#[derive(Debug, Clone, Serialize)]
pub struct LocalModelStatus {
    pub loaded: bool,
    pub model_path: Option<String>,
    pub mmproj_path: Option<String>,
}

/// 托管的 llama-server 实例
#[derive(Debug)]
pub struct LocalVlmServer {
    child: Child,
    client: OpenAiCompatClient,
    model_path: PathBuf,
    mmproj_path: PathBuf,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl LocalVlmServer {
    /// 启动 llama-server 并等待模型加载完成
    pub async fn load(
        model_path: &Path,
        mmproj_path: &Path,
        ctx_size: u32,
        gpu_layers: i32,
    ) -> Result<Self, BackendError> {
        if !model_path.is_file() {
            return Err(BackendError::ModelLoad(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }
        if !mmproj_path.is_file() {
            return Err(BackendError::ModelLoad(format!(
                "projector file not found: {}",
                mmproj_path.display()
            )));
        }

        let binary =
            std::env::var(SERVER_BINARY_ENV).unwrap_or_else(|_| SERVER_BINARY.to_string());
        let port = pick_free_port()?;

        info!(
            "Starting {} on port {} (model: {}, mmproj: {})",
            binary,
            port,
            model_path.display(),
            mmproj_path.display()
        );

        let mut child = Command::new(&binary)
            .arg("-m")
            .arg(model_path)
            .arg("--mmproj")
            .arg(mmproj_path)
            .arg("-c")
            .arg(ctx_size.to_string())
            .arg("--n-gpu-layers")
            .arg(gpu_layers.to_string())
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--no-webui")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackendError::ModelLoad(format!(
                    "failed to launch '{}': {} (is llama.cpp installed and on PATH?)",
                    binary, e
                ))
            })?;

        // 持续收集 stderr 尾部，进程异常退出时作为错误信息
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = tail.lock().unwrap();
                    if tail.len() >= STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        let base_url = format!("http://127.0.0.1:{}/v1", port);
        let model_name = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "local-model".to_string());

        let mut server = Self {
            child,
            client: OpenAiCompatClient::local(&base_url, &model_name),
            model_path: model_path.to_path_buf(),
            mmproj_path: mmproj_path.to_path_buf(),
            stderr_tail,
        };

        server.wait_ready(port).await?;
        info!("Local VLM ready at {}", base_url);
        Ok(server)
    }

    /// 轮询 /health 直到模型加载完成或进程退出
    async fn wait_ready(&mut self, port: u16) -> Result<(), BackendError> {
        let health_url = format!("http://127.0.0.1:{}/health", port);
        let probe = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("reqwest client must build");

        let deadline = Instant::now() + READY_TIMEOUT;
        loop {
            // 进程已退出说明加载失败（架构不支持、文件损坏等）
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(BackendError::ModelLoad(format!(
                    "llama-server exited with {}: {}",
                    status,
                    self.stderr_summary()
                )));
            }

            match probe.get(&health_url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => debug!("llama-server not ready yet: {}", resp.status()),
                Err(e) => debug!("llama-server health probe failed: {}", e),
            }

            if Instant::now() >= deadline {
                self.shutdown().await;
                return Err(BackendError::ModelLoad(format!(
                    "model did not become ready within {}s: {}",
                    READY_TIMEOUT.as_secs(),
                    self.stderr_summary()
                )));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    fn stderr_summary(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap();
        if tail.is_empty() {
            "(no server output)".to_string()
        } else {
            tail.iter().cloned().collect::<Vec<_>>().join("\n")
        }
    }

    /// 为一张图片生成标注文本
    pub async fn generate(
        &self,
        image_data_uri: &str,
        system_prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, BackendError> {
        self.client
            .generate(image_data_uri, system_prompt, params)
            .await
    }

    /// 当前状态
    pub fn status(&self) -> LocalModelStatus {
        LocalModelStatus {
            loaded: true,
            model_path: Some(self.model_path.to_string_lossy().to_string()),
            mmproj_path: Some(self.mmproj_path.to_string_lossy().to_string()),
        }
    }

    /// 停止子进程，释放显存/内存
    pub async fn shutdown(&mut self) {
        info!("Stopping llama-server (model: {})", self.model_path.display());
        if let Err(e) = self.child.start_kill() {
            warn!("Failed to kill llama-server: {}", e);
        }
        let _ = self.child.wait().await;
    }
}

/// 让系统分配一个空闲端口
fn pick_free_port() -> Result<u16, BackendError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| BackendError::ModelLoad(format!("cannot allocate local port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| BackendError::ModelLoad(format!("cannot read local port: {}", e)))?
        .port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_free_port() {
        let port = pick_free_port().unwrap();
        assert!(port > 0);
        // 端口释放后应当可以重新绑定
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[tokio::test]
    async fn test_load_rejects_missing_model_file() {
        let err = LocalVlmServer::load(
            Path::new("/nonexistent/model.gguf"),
            Path::new("/nonexistent/mmproj.gguf"),
            8192,
            -1,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackendError::ModelLoad(_)));
        assert!(err.to_string().contains("model file not found"));
    }

    #[tokio::test]
    async fn test_load_rejects_missing_projector_file() {
        // 模型文件存在但投影文件缺失
        let dir = std::env::temp_dir().join(format!("tagflow-local-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let model = dir.join("model.gguf");
        std::fs::write(&model, b"GGUF").unwrap();

        let err = LocalVlmServer::load(&model, &dir.join("missing-mmproj.gguf"), 8192, -1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("projector file not found"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
