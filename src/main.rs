//! TagFlow 主入口

#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

use tagflow_lib::{commands, AppState};
use tauri::{LogicalSize, Manager, RunEvent};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("tagflow=debug".parse().unwrap())
                .add_directive("tagflow_lib=debug".parse().unwrap()),
        )
        .init();

    info!("Starting TagFlow v{}", env!("CARGO_PKG_VERSION"));

    // 构建 Tauri 应用
    tauri::Builder::default()
        .plugin(tauri_plugin_dialog::init())
        .setup(|app| {
            // 初始化应用状态
            let state = AppState::new()?;

            // 恢复上次的窗口尺寸
            if let Some(window) = app.get_webview_window("main") {
                let config = state.config.blocking_read();
                let _ = window.set_size(LogicalSize::new(
                    config.window_width,
                    config.window_height,
                ));
            }

            app.manage(state);

            info!("TagFlow initialized successfully");
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            // 设置
            commands::get_settings,
            commands::update_settings,
            // 模板
            commands::list_templates,
            commands::get_template,
            commands::save_template,
            commands::delete_template,
            commands::builtin_template_names,
            // 文件夹与图片
            commands::list_images,
            commands::get_thumbnail,
            commands::get_preview,
            commands::read_tags,
            commands::write_tags,
            // 后端
            commands::list_models,
            commands::check_backend,
            // 本地模型
            commands::load_local_model,
            commands::unload_local_model,
            commands::get_local_model_status,
            // 批量标注
            commands::start_tagging,
            commands::stop_tagging,
            commands::get_tagging_status,
        ])
        .build(tauri::generate_context!())
        .expect("Failed to build Tauri application")
        .run(|app_handle, event| {
            if let RunEvent::ExitRequested { .. } = event {
                save_window_size(app_handle);
            }
        });
}

/// 退出前记住窗口尺寸，下次启动恢复
fn save_window_size(app_handle: &tauri::AppHandle) {
    let Some(window) = app_handle.get_webview_window("main") else {
        return;
    };
    let (Ok(size), Ok(scale)) = (window.inner_size(), window.scale_factor()) else {
        return;
    };
    let logical = size.to_logical::<u32>(scale);

    let state = app_handle.state::<AppState>();
    let mut config = state.config.blocking_write();
    config.window_width = logical.width;
    config.window_height = logical.height;
    if let Err(e) = config.save() {
        warn!("Failed to persist window size: {}", e);
    }
}
