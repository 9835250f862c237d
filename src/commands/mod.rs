//! Tauri 命令处理模块
//!
//! 提供前端调用的 API 接口：设置、模板、文件夹浏览、标注编辑、
//! 本地模型管理与批量标注控制。

use std::path::{Path, PathBuf};

use tauri::{AppHandle, Emitter, State};
use tracing::{debug, info, warn};

use crate::ai::local::LocalModelStatus;
use crate::ai::{
    BackendKind, GeminiClient, GenerationParams, LocalVlmServer, OpenAiCompatClient,
    GEMINI_MODELS, OPENROUTER_MODELS, XAI_MODELS,
};
use crate::config::AppConfig;
use crate::imaging::{self, ImageEntry};
use crate::tagger::{JobEvent, TagBackend, TagJobStatus, EVENT_DONE, EVENT_ERROR, EVENT_PROGRESS, EVENT_TAGGED};
use crate::templates::{PromptTemplate, TagFormat};
use crate::AppState;

fn output_dir_of(config: &AppConfig) -> Option<PathBuf> {
    if config.output_dir.is_empty() {
        None
    } else {
        Some(PathBuf::from(&config.output_dir))
    }
}

/// 由当前配置组装标注后端
fn build_backend(config: &AppConfig, state: &AppState) -> TagBackend {
    match config.backend {
        BackendKind::Local => TagBackend::Local(state.local_vlm.clone()),
        BackendKind::Gemini => TagBackend::Gemini(GeminiClient::new(
            &config.gemini_api_key,
            &config.gemini_model,
        )),
        BackendKind::Xai => TagBackend::OpenAiCompat(OpenAiCompatClient::xai(
            &config.xai_api_key,
            &config.xai_model,
        )),
        BackendKind::OpenRouter => TagBackend::OpenAiCompat(OpenAiCompatClient::openrouter(
            &config.openrouter_api_key,
            &config.openrouter_model,
        )),
    }
}

// ===== 设置 =====

/// 获取设置
#[tauri::command]
pub async fn get_settings(state: State<'_, AppState>) -> Result<AppConfig, String> {
    debug!("get_settings");
    Ok(state.config.read().await.clone())
}

/// 更新并保存设置
#[tauri::command]
pub async fn update_settings(
    state: State<'_, AppState>,
    settings: AppConfig,
) -> Result<(), String> {
    info!("update_settings: backend={}", settings.backend.as_str());
    settings.save().map_err(|e| e.to_string())?;
    *state.config.write().await = settings;
    Ok(())
}

// ===== 模板 =====

/// 获取所有提示词模板
#[tauri::command]
pub async fn list_templates(state: State<'_, AppState>) -> Result<Vec<PromptTemplate>, String> {
    Ok(state.templates.read().await.list())
}

/// 按名称获取模板
#[tauri::command]
pub async fn get_template(
    state: State<'_, AppState>,
    name: String,
) -> Result<PromptTemplate, String> {
    state
        .templates
        .read()
        .await
        .get(&name)
        .cloned()
        .ok_or_else(|| format!("template '{}' not found", name))
}

/// 新增或更新模板
#[tauri::command]
pub async fn save_template(
    state: State<'_, AppState>,
    name: String,
    prompt: String,
    format: Option<TagFormat>,
) -> Result<(), String> {
    state
        .templates
        .write()
        .await
        .upsert(&name, &prompt, format)
        .map_err(|e| e.to_string())
}

/// 删除模板（内置模板拒绝删除）
#[tauri::command]
pub async fn delete_template(state: State<'_, AppState>, name: String) -> Result<(), String> {
    state
        .templates
        .write()
        .await
        .delete(&name)
        .map_err(|e| e.to_string())
}

// ===== 文件夹与图片 =====

/// 列出文件夹中的图片及标注状态
#[tauri::command]
pub async fn list_images(
    state: State<'_, AppState>,
    folder: String,
) -> Result<Vec<ImageEntry>, String> {
    debug!("list_images: {}", folder);
    let output_dir = output_dir_of(&*state.config.read().await);
    imaging::list_entries(Path::new(&folder), output_dir.as_deref()).map_err(|e| e.to_string())
}

/// 获取缩略图 data URI
#[tauri::command]
pub async fn get_thumbnail(path: String) -> Result<String, String> {
    imaging::thumbnail_data_uri(Path::new(&path)).map_err(|e| e.to_string())
}

/// 获取原图 data URI（编辑器预览）
#[tauri::command]
pub async fn get_preview(path: String) -> Result<String, String> {
    imaging::preview_data_uri(Path::new(&path)).map_err(|e| e.to_string())
}

/// 读取图片的标注文本（无标注文件时返回 None）
#[tauri::command]
pub async fn read_tags(
    state: State<'_, AppState>,
    path: String,
) -> Result<Option<String>, String> {
    let output_dir = output_dir_of(&*state.config.read().await);
    imaging::read_sidecar(Path::new(&path), output_dir.as_deref()).map_err(|e| e.to_string())
}

/// 写入图片的标注文本（标注编辑器手工保存）
#[tauri::command]
pub async fn write_tags(
    state: State<'_, AppState>,
    path: String,
    text: String,
) -> Result<String, String> {
    let output_dir = output_dir_of(&*state.config.read().await);
    imaging::write_sidecar(Path::new(&path), &text, output_dir.as_deref())
        .map(|p| p.to_string_lossy().to_string())
        .map_err(|e| e.to_string())
}

// ===== 后端 =====

/// 某个后端的可选模型列表（本地后端自由填写路径，列表为空）
#[tauri::command]
pub fn list_models(backend: BackendKind) -> Vec<String> {
    let models: &[&str] = match backend {
        BackendKind::Gemini => GEMINI_MODELS,
        BackendKind::Xai => XAI_MODELS,
        BackendKind::OpenRouter => OPENROUTER_MODELS,
        BackendKind::Local => &[],
    };
    models.iter().map(|m| m.to_string()).collect()
}

/// 连通性检查：校验密钥/端点可用（本地后端检查模型是否已加载）
#[tauri::command]
pub async fn check_backend(
    state: State<'_, AppState>,
    backend: BackendKind,
) -> Result<(), String> {
    info!("check_backend: {}", backend.as_str());
    let config = state.config.read().await.clone();

    if backend == BackendKind::Local {
        if state.local_vlm.read().await.is_none() {
            return Err("no local model loaded".to_string());
        }
        return Ok(());
    }

    if config.api_key_for(backend).is_empty() {
        return Err(format!("{} API key is empty", backend.display_name()));
    }

    match backend {
        BackendKind::Gemini => {
            GeminiClient::new(&config.gemini_api_key, &config.gemini_model)
                .check_endpoint()
                .await
        }
        BackendKind::Xai => OpenAiCompatClient::xai(&config.xai_api_key, &config.xai_model)
            .check_endpoint()
            .await,
        BackendKind::OpenRouter => {
            OpenAiCompatClient::openrouter(&config.openrouter_api_key, &config.openrouter_model)
                .check_endpoint()
                .await
        }
        BackendKind::Local => unreachable!(),
    }
    .map_err(|e| e.to_string())
}

// ===== 本地模型 =====

/// 加载本地 GGUF 模型（路径取自当前设置）
#[tauri::command]
pub async fn load_local_model(state: State<'_, AppState>) -> Result<LocalModelStatus, String> {
    let config = state.config.read().await.clone();
    if config.local_model_path.is_empty() || config.local_mmproj_path.is_empty() {
        return Err("model and projector paths must both be set".to_string());
    }

    let mut slot = state.local_vlm.write().await;

    // 先卸载旧模型，避免两份权重同时占用内存
    if let Some(mut old) = slot.take() {
        old.shutdown().await;
    }

    let server = LocalVlmServer::load(
        Path::new(&config.local_model_path),
        Path::new(&config.local_mmproj_path),
        config.local_ctx_size,
        config.local_gpu_layers,
    )
    .await
    .map_err(|e| e.to_string())?;

    let status = server.status();
    *slot = Some(server);
    Ok(status)
}

/// 卸载本地模型，释放内存
#[tauri::command]
pub async fn unload_local_model(state: State<'_, AppState>) -> Result<(), String> {
    if let Some(mut server) = state.local_vlm.write().await.take() {
        server.shutdown().await;
    }
    Ok(())
}

/// 本地模型状态
#[tauri::command]
pub async fn get_local_model_status(
    state: State<'_, AppState>,
) -> Result<LocalModelStatus, String> {
    Ok(match &*state.local_vlm.read().await {
        Some(server) => server.status(),
        None => LocalModelStatus {
            loaded: false,
            model_path: None,
            mmproj_path: None,
        },
    })
}

// ===== 批量标注 =====

/// 启动批量标注。`images` 是前端勾选的图片路径列表。
/// 进度通过 `tagging://*` 事件上报。
#[tauri::command]
pub async fn start_tagging(
    app: AppHandle,
    state: State<'_, AppState>,
    images: Vec<String>,
) -> Result<(), String> {
    if images.is_empty() {
        return Err("no images selected for tagging".to_string());
    }
    // 在派发任务前同步占用运行标记，两个并发请求只有一个能拿到
    if !state.job.try_start() {
        return Err("a tagging batch is already running".to_string());
    }

    let config = state.config.read().await.clone();
    let backend = build_backend(&config, &state);
    let params = GenerationParams::from_config(&config);
    let output_dir = output_dir_of(&config);
    let paths: Vec<PathBuf> = images.into_iter().map(PathBuf::from).collect();

    info!(
        "start_tagging: {} images, backend={}, template={}",
        paths.len(),
        config.backend.as_str(),
        config.selected_template
    );

    let job = state.job.clone();
    tauri::async_runtime::spawn(async move {
        job.run(
            backend,
            paths,
            config.system_prompt,
            params,
            output_dir,
            move |event| {
                let channel = match &event {
                    JobEvent::Progress { .. } => EVENT_PROGRESS,
                    JobEvent::Tagged { .. } => EVENT_TAGGED,
                    JobEvent::Error { .. } => EVENT_ERROR,
                    JobEvent::Done { .. } => EVENT_DONE,
                };
                if let Err(e) = app.emit(channel, &event) {
                    warn!("Failed to emit {}: {}", channel, e);
                }
            },
        )
        .await;
    });

    Ok(())
}

/// 请求停止当前批次（当前这张图完成后生效）
#[tauri::command]
pub async fn stop_tagging(state: State<'_, AppState>) -> Result<(), String> {
    state.job.request_stop();
    Ok(())
}

/// 查询批次状态
#[tauri::command]
pub async fn get_tagging_status(state: State<'_, AppState>) -> Result<TagJobStatus, String> {
    Ok(state.job.status())
}

/// 内置模板名称列表（前端用来禁用删除按钮）
#[tauri::command]
pub fn builtin_template_names() -> Vec<String> {
    crate::templates::BUILTIN_NAMES
        .iter()
        .map(|n| n.to_string())
        .collect()
}
