//! 图像文件处理模块
//!
//! 负责文件夹扫描、图片解码、API 上传编码、缩略图生成，
//! 以及标注 sidecar 文件（与图片同名的 .txt）的读写。

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::Serialize;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 支持的图片扩展名
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// 上传给 API 前的最长边上限（像素）
const UPLOAD_MAX_SIDE: u32 = 1536;
/// 上传 JPEG 质量
const UPLOAD_JPEG_QUALITY: u8 = 90;

/// 缩略图边长
const THUMBNAIL_SIZE: u32 = 200;
/// 缩略图 JPEG 质量
const THUMBNAIL_QUALITY: u8 = 60;

/// base64 编码后的图片载荷
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub mime: &'static str,
    pub base64: String,
}

impl EncodedImage {
    /// data URI 形式（OpenAI 兼容接口使用）
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.base64)
    }
}

/// 文件夹里的一张图片（返回给前端的浏览条目）
#[derive(Debug, Clone, Serialize)]
pub struct ImageEntry {
    pub path: String,
    pub file_name: String,
    /// 是否已有标注文件
    pub has_sidecar: bool,
}

/// 判断路径是否是支持的图片文件
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// 扫描文件夹中的图片（不递归），按文件名排序
pub fn find_images(folder: &Path) -> Result<Vec<PathBuf>> {
    if !folder.is_dir() {
        return Err(anyhow!("not a directory: {}", folder.display()));
    }

    let mut images = Vec::new();
    for entry in fs::read_dir(folder)
        .with_context(|| format!("cannot read directory {}", folder.display()))?
    {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        if path.is_file() && is_image_file(&path) {
            images.push(path);
        }
    }

    images.sort_by(|a, b| {
        a.file_name()
            .unwrap_or_default()
            .to_ascii_lowercase()
            .cmp(&b.file_name().unwrap_or_default().to_ascii_lowercase())
    });

    debug!("Found {} images in {}", images.len(), folder.display());
    Ok(images)
}

/// 列出文件夹图片及其标注状态
pub fn list_entries(folder: &Path, output_dir: Option<&Path>) -> Result<Vec<ImageEntry>> {
    let images = find_images(folder)?;
    Ok(images
        .into_iter()
        .map(|path| {
            let has_sidecar = sidecar_path(&path, output_dir).is_file();
            ImageEntry {
                file_name: path
                    .file_name()
                    .unwrap_or_default()
                    .to_string_lossy()
                    .to_string(),
                path: path.to_string_lossy().to_string(),
                has_sidecar,
            }
        })
        .collect())
}

/// 解码图片文件
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).with_context(|| format!("cannot decode image {}", path.display()))
}

/// 编码为上传载荷：过大的图先缩小，再编成 JPEG + base64。
/// 标注质量对分辨率不敏感，但载荷大小直接影响请求耗时。
pub fn encode_for_upload(img: &DynamicImage) -> Result<EncodedImage> {
    let img = if img.width() > UPLOAD_MAX_SIDE || img.height() > UPLOAD_MAX_SIDE {
        img.resize(UPLOAD_MAX_SIDE, UPLOAD_MAX_SIDE, FilterType::Triangle)
    } else {
        img.clone()
    };

    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buffer = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buffer, UPLOAD_JPEG_QUALITY);
    rgb.write_with_encoder(encoder)
        .context("failed to encode upload payload")?;

    Ok(EncodedImage {
        mime: "image/jpeg",
        base64: BASE64.encode(buffer.into_inner()),
    })
}

/// 生成缩略图并返回 base64 data URI
pub fn thumbnail_data_uri(path: &Path) -> Result<String> {
    let img = load_image(path)?;
    let thumb = img.resize(THUMBNAIL_SIZE, THUMBNAIL_SIZE, FilterType::Triangle);

    let mut buffer = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buffer, THUMBNAIL_QUALITY);
    DynamicImage::ImageRgb8(thumb.to_rgb8())
        .write_with_encoder(encoder)
        .context("failed to encode thumbnail")?;

    Ok(format!(
        "data:image/jpeg;base64,{}",
        BASE64.encode(buffer.into_inner())
    ))
}

/// 读取原图字节并返回 data URI（编辑器预览用，不重编码）
pub fn preview_data_uri(path: &Path) -> Result<String> {
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    };
    let bytes =
        fs::read(path).with_context(|| format!("cannot read image {}", path.display()))?;
    Ok(format!("data:{};base64,{}", mime, BASE64.encode(bytes)))
}

/// 计算图片对应的标注文件路径。
/// 默认与图片同目录同名（扩展名换成 .txt）；指定输出目录时仅替换目录。
pub fn sidecar_path(image_path: &Path, output_dir: Option<&Path>) -> PathBuf {
    let txt_name = image_path.with_extension("txt");
    match output_dir {
        Some(dir) if !dir.as_os_str().is_empty() => {
            dir.join(txt_name.file_name().unwrap_or_default())
        }
        _ => txt_name,
    }
}

/// 写入标注文本（UTF-8，重跑时覆盖）
pub fn write_sidecar(image_path: &Path, text: &str, output_dir: Option<&Path>) -> Result<PathBuf> {
    let path = sidecar_path(image_path, output_dir);
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create output dir {}", dir.display()))?;
        }
    }
    fs::write(&path, text).with_context(|| format!("cannot write {}", path.display()))?;
    Ok(path)
}

/// 读取标注文本，文件不存在时返回 None
pub fn read_sidecar(image_path: &Path, output_dir: Option<&Path>) -> Result<Option<String>> {
    let path = sidecar_path(image_path, output_dir);
    if !path.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path).with_context(|| format!("cannot read {}", path.display()))?;
    Ok(Some(text))
}
