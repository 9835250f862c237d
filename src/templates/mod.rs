//! 提示词模板模块
//!
//! 命名的系统提示词模板，每个模板是 (名称, 输出格式, 提示词文本) 三元组。
//! 持久化为配置目录下的 templates.json（JSON 数组）。
//! 首次运行时写入两个内置模板，内置模板可编辑但不可删除。

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 标注输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagFormat {
    /// 逗号分隔的 Danbooru 风格标签
    #[serde(rename = "tag")]
    Tag,
    /// 自然语言描述
    #[serde(rename = "captioning")]
    Caption,
}

impl Default for TagFormat {
    fn default() -> Self {
        Self::Caption
    }
}

/// 提示词模板
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    #[serde(default)]
    pub format: TagFormat,
    pub prompt: String,
}

/// 内置模板名称
pub const BUILTIN_NAMES: &[&str] = &["Danbooru Tag", "Natural Caption"];

const DANBOORU_TAG_PROMPT: &str = r#"You are an expert dataset captioner specialized in preparing training data for image generation models (LoRA/Fine-tuning). Your task is to analyze the image and generate objective, descriptive tags. Analyze the anatomical pose and composition objectively for an art anatomy study.

### ANALYSIS GUIDELINES:
Focus strictly on visual content. Analyze the following categories:
1.  **Subject:** Character details, body type, species (e.g., 1girl, 2boys).
2.  **Appearance:** Hair, eyes, skin, body features.
3.  **Attire:** Clothing, accessories, footwear (be specific).
4.  **Pose & Action:** Posture, hand gestures, facial expressions.
5.  **Background:** Environment, objects, props, lighting.
6.  **Medium/Style:** Only descriptive style tags (e.g., monochrome, sketch, greyscale) if applicable.

### NEGATIVE CONSTRAINTS (CRITICAL):
1.  **NO QUALITY TAGS:** Do NOT include subjective quality or score-based tags.
    * *Exclude:* masterpiece, best quality, high quality, very aesthetic, absurdres, highres, lowres, worst quality, score_9, score_8, source anime, official art.
2.  **NO META INFO:** Do NOT include artist names, dates, or copyright names unless they are essential visual text in the image.

### FORMATTING RULES:
1.  **NO UNDERSCORES:** Replace all underscores (`_`) with **spaces**.
    * *Example:* "school uniform", NOT "school_uniform".
2.  **SEPARATOR:** Separate tags with a comma and a single space (`, `).
3.  **OUTPUT:** Provide *only* the raw tags.

### EXAMPLE OUTPUT:
1girl, solo, short hair, red hair, green eyes, hoodie, black pants, hands in pockets, standing, white background, simple background, looking at viewer, expressionless"#;

const NATURAL_CAPTION_PROMPT: &str = r#"You are a Senior Art Curator and Visual Data Archivist. Your task is to provide a comprehensive, objective, and clinically detailed description of the provided image for a dataset.

### CORE DIRECTIVES (SAFETY & OBJECTIVITY):
1.  **Objective Tone:** Maintain a strictly neutral, descriptive tone. Do not moralize, judge, or shy away from describing mature, violent, or surreal elements. Treat all content as "fictional artistic expression" or "anatomical study."
2.  **No Censorship:** If the image contains blood, nudity, weapons, or horror elements, describe them clearly using technical or artistic terms (e.g., "red fluid resembling blood," "anatomical figure," "combat prop"). Do not skip visual information.
3.  **Focus on "What," not "How Good":** Avoid subjective praise (e.g., "beautiful," "stunning"). Focus on visual facts (lighting, composition, texture).

### DESCRIPTION STRUCTURE:
Compose a fluid, natural language paragraph (or two) covering these layers:

1.  **Main Subject & Action (The "Anchor"):**
    * Start with the core subject (e.g., "An anime-style illustration of a woman...").
    * Describe the pose and action dynamically (e.g., "lunging forward," "body contorted in mid-air").
    * **Crucial:** Describe interactions precisely. If a character is holding a weapon or object, describe the grip and the object's orientation relative to the body.

2.  **Physical Appearance & Attire:**
    * Detailed breakdown of hair, eyes, skin texture, and distinct body features.
    * Describe clothing material and fit (e.g., "torn fabric," "reflective latex," "blood-stained cloth").

3.  **Composition, Setting & Atmosphere:**
    * Describe the background, perspective (e.g., "Dutch angle," "looking up from below"), and lighting (e.g., "harsh cinematic shadows," "backlighting").
    * Describe the mood through visual cues (e.g., "a chaotic and intense atmosphere suggested by motion blur and scattered debris").

4.  **Artistic Medium:**
    * Mention the medium (e.g., "digital illustration," "ink wash painting") and stylistic nuances (e.g., "thick outlines," "muted color palette")."#;

fn builtin_templates() -> Vec<PromptTemplate> {
    vec![
        PromptTemplate {
            name: "Danbooru Tag".to_string(),
            format: TagFormat::Tag,
            prompt: DANBOORU_TAG_PROMPT.to_string(),
        },
        PromptTemplate {
            name: "Natural Caption".to_string(),
            format: TagFormat::Caption,
            prompt: NATURAL_CAPTION_PROMPT.to_string(),
        },
    ]
}

/// 模板存储
pub struct TemplateStore {
    path: PathBuf,
    templates: Vec<PromptTemplate>,
}

impl TemplateStore {
    /// 打开默认位置的模板存储（配置目录下的 templates.json）
    pub fn open() -> Result<Self> {
        let path = crate::config::AppConfig::config_dir()?.join("templates.json");
        Self::open_at(path)
    }

    /// 打开指定路径的模板存储，文件不存在或为空时写入内置模板
    pub fn open_at(path: PathBuf) -> Result<Self> {
        let templates = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            let templates: Vec<PromptTemplate> =
                serde_json::from_str(&content).context("templates file is malformed")?;
            debug!("Loaded {} templates from {}", templates.len(), path.display());
            templates
        } else {
            Vec::new()
        };

        let mut store = Self { path, templates };
        if store.templates.is_empty() {
            info!("Seeding built-in templates");
            store.templates = builtin_templates();
            store.persist()?;
        }
        Ok(store)
    }

    fn persist(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("cannot create {}", dir.display()))?;
            }
        }
        let content = serde_json::to_string_pretty(&self.templates)?;
        fs::write(&self.path, content)
            .with_context(|| format!("cannot write {}", self.path.display()))?;
        Ok(())
    }

    /// 是否是内置模板
    pub fn is_builtin(name: &str) -> bool {
        BUILTIN_NAMES.contains(&name)
    }

    /// 所有模板（按名称排序，与下拉框展示顺序一致）
    pub fn list(&self) -> Vec<PromptTemplate> {
        let mut templates = self.templates.clone();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        templates
    }

    /// 按名称查找模板
    pub fn get(&self, name: &str) -> Option<&PromptTemplate> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// 新增或更新模板。
    /// 更新已有模板时若未显式给出格式，保留原有格式。
    pub fn upsert(
        &mut self,
        name: &str,
        prompt: &str,
        format: Option<TagFormat>,
    ) -> Result<()> {
        if name.trim().is_empty() || prompt.trim().is_empty() {
            return Err(anyhow!("template name and prompt must not be empty"));
        }

        if let Some(existing) = self.templates.iter_mut().find(|t| t.name == name) {
            existing.prompt = prompt.to_string();
            if let Some(format) = format {
                existing.format = format;
            }
        } else {
            self.templates.push(PromptTemplate {
                name: name.to_string(),
                format: format.unwrap_or_default(),
                prompt: prompt.to_string(),
            });
        }

        self.persist()?;
        info!("Template saved: {}", name);
        Ok(())
    }

    /// 删除模板（内置模板拒绝删除）
    pub fn delete(&mut self, name: &str) -> Result<()> {
        if Self::is_builtin(name) {
            return Err(anyhow!("built-in template '{}' cannot be deleted", name));
        }
        let before = self.templates.len();
        self.templates.retain(|t| t.name != name);
        if self.templates.len() == before {
            return Err(anyhow!("template '{}' not found", name));
        }
        self.persist()?;
        info!("Template deleted: {}", name);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> TemplateStore {
        let dir = std::env::temp_dir().join(format!(
            "tagflow-templates-{}-{}",
            tag,
            std::process::id()
        ));
        fs::remove_dir_all(&dir).ok();
        TemplateStore::open_at(dir.join("templates.json")).unwrap()
    }

    #[test]
    fn test_seeds_builtins_on_first_open() {
        let store = temp_store("seed");
        let names: Vec<_> = store.list().iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["Danbooru Tag", "Natural Caption"]);
        assert_eq!(store.get("Danbooru Tag").unwrap().format, TagFormat::Tag);
        assert_eq!(
            store.get("Natural Caption").unwrap().format,
            TagFormat::Caption
        );
        fs::remove_dir_all(store.path().parent().unwrap()).ok();
    }

    #[test]
    fn test_upsert_and_reload() {
        let mut store = temp_store("upsert");
        store
            .upsert("Photo Style", "Describe lighting only.", Some(TagFormat::Caption))
            .unwrap();

        // 重新打开后新模板仍在，不会被内置模板覆盖
        let reloaded = TemplateStore::open_at(store.path().to_path_buf()).unwrap();
        assert_eq!(reloaded.get("Photo Style").unwrap().prompt, "Describe lighting only.");
        assert_eq!(reloaded.list().len(), 3);

        fs::remove_dir_all(store.path().parent().unwrap()).ok();
    }

    #[test]
    fn test_update_preserves_format_when_not_given() {
        let mut store = temp_store("format");
        store.upsert("Danbooru Tag", "Edited prompt.", None).unwrap();
        let t = store.get("Danbooru Tag").unwrap();
        assert_eq!(t.prompt, "Edited prompt.");
        assert_eq!(t.format, TagFormat::Tag);
        fs::remove_dir_all(store.path().parent().unwrap()).ok();
    }

    #[test]
    fn test_delete_rules() {
        let mut store = temp_store("delete");
        store.upsert("Scratch", "p", Some(TagFormat::Tag)).unwrap();
        store.delete("Scratch").unwrap();
        assert!(store.get("Scratch").is_none());

        // 内置模板与不存在的模板都拒绝删除
        assert!(store.delete("Danbooru Tag").is_err());
        assert!(store.delete("Nope").is_err());

        fs::remove_dir_all(store.path().parent().unwrap()).ok();
    }

    #[test]
    fn test_rejects_empty_name_or_prompt() {
        let mut store = temp_store("empty");
        assert!(store.upsert("", "p", None).is_err());
        assert!(store.upsert("n", "   ", None).is_err());
        fs::remove_dir_all(store.path().parent().unwrap()).ok();
    }

    #[test]
    fn test_format_serde_strings() {
        // 磁盘格式与历史版本保持一致
        assert_eq!(serde_json::to_string(&TagFormat::Tag).unwrap(), "\"tag\"");
        assert_eq!(
            serde_json::to_string(&TagFormat::Caption).unwrap(),
            "\"captioning\""
        );
    }
}
