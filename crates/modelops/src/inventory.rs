use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{derive_key, normalize_id, ModelId, StateSnapshot};

const EMBEDDING_KEYWORDS: &[&str] = &["embed", "embedding", "bge", "e5-", "gte-", "jina"];

const VISION_KEYWORDS: &[&str] = &[
    "vision", "llava", "qwen-vl", "qwen2-vl", "qwen3-vl", "pixtral", "devstral", "magistral",
    "gemma-3", "bakllava", "obsidian", "moondream", "minicpm-v", "cogvlm", "glm-4v",
    "internlm-xcomposer", "internvl", "yi-vl", "phi-3-vision", "llama-3-vision", "mllama",
];

pub fn is_embedding_model(id: &str) -> bool {
    let lower = id.to_lowercase();
    EMBEDDING_KEYWORDS.iter().any(|k| lower.contains(k))
}

pub fn is_vision_model(id: &str) -> bool {
    let lower = id.to_lowercase();
    VISION_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// One selectable chat model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: ModelId,
    pub loaded: bool,
    pub vision: bool,
    pub quantization: Option<String>,
}

impl CatalogEntry {
    pub fn display_label(&self) -> String {
        let mut label = format!("{} {}", if self.loaded { "●" } else { "○" }, self.id);
        if self.vision {
            label.push_str(" [Vision]");
        }
        if let Some(q) = &self.quantization {
            label.push_str(&format!(" ({q})"));
        }
        label
    }
}

/// Selectable models: embeddings dropped, sorted by id, one entry per
/// model key, annotated from native state where the server exposes it.
pub fn build_catalog(ids: impl IntoIterator<Item = String>, states: &StateSnapshot) -> Vec<CatalogEntry> {
    let mut ids: Vec<ModelId> = ids
        .into_iter()
        .map(|id| normalize_id(&id))
        .filter(|id| !id.is_empty() && !is_embedding_model(id))
        .collect();
    ids.sort();

    let mut seen = HashSet::new();
    ids.into_iter()
        .filter(|id| seen.insert(derive_key(id)))
        .map(|id| {
            let ext = states.get(&id);
            CatalogEntry {
                loaded: ext.map_or(false, |e| e.is_loaded()),
                vision: is_vision_model(&id),
                quantization: ext.and_then(|e| e.quantization.clone()),
                id,
            }
        })
        .collect()
}
