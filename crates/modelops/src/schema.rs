use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-assigned model identifier, e.g. `qwen2.5:2`.
pub type ModelId = String;

/// Model identifier with the trailing `:<digits>` instance suffix removed.
pub type ModelKey = String;

/// Trimmed model id. An empty result means the input was not a usable id.
pub fn normalize_id(raw: &str) -> ModelId {
    raw.trim().to_string()
}

/// Model family key: `"m:2" -> "m"`, `"m" -> "m"`, `"m:q4" -> "m:q4"`.
pub fn derive_key(raw: &str) -> ModelKey {
    let id = raw.trim();
    if let Some(idx) = id.rfind(':') {
        let suffix = &id[idx + 1..];
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            return id[..idx].to_string();
        }
    }
    id.to_string()
}

/// Closed decode of the server's untyped `state` / `loaded` fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadState {
    Loaded,
    Loading,
    NotLoaded,
    Unknown,
}

impl LoadState {
    /// Case-insensitive, whitespace-trimmed. Unrecognised strings are `Unknown`.
    pub fn from_state_str(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "loaded" | "ready" | "running" => LoadState::Loaded,
            "loading" | "queued" | "initializing" | "downloading" | "pulling" => LoadState::Loading,
            "not-loaded" | "unloaded" | "error" | "failed" => LoadState::NotLoaded,
            _ => LoadState::Unknown,
        }
    }

    pub fn is_loaded(self) -> bool {
        matches!(self, LoadState::Loaded)
    }

    pub fn is_loading(self) -> bool {
        matches!(self, LoadState::Loading)
    }
}

/// One model record from the native listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelStateInfo {
    pub id: ModelId,
    pub loaded: Option<bool>,
    pub loading: Option<bool>,
    /// Decoded `state` string; `Unknown` for words outside the vocabulary.
    pub state: Option<LoadState>,
    pub quantization: Option<String>,
}

impl ModelStateInfo {
    /// Lenient decode of one listing entry: fields of the wrong JSON type are
    /// treated as absent. Entries without a usable id are dropped.
    pub fn from_value(v: &Value) -> Option<Self> {
        let id = normalize_id(v.get("id")?.as_str()?);
        if id.is_empty() {
            return None;
        }
        let quantization = match v.get("quantization") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Object(o)) => o.get("name").and_then(Value::as_str).map(str::to_string),
            _ => None,
        }
        .filter(|q| !q.is_empty());

        Some(Self {
            id,
            loaded: v.get("loaded").and_then(Value::as_bool),
            loading: v.get("loading").and_then(Value::as_bool),
            state: v.get("state").and_then(Value::as_str).map(LoadState::from_state_str),
            quantization,
        })
    }

    /// Explicit booleans win over the `state` string.
    pub fn is_loaded(&self) -> bool {
        match self.loaded {
            Some(b) => b,
            None => self.state.is_some_and(LoadState::is_loaded),
        }
    }

    pub fn is_loading(&self) -> bool {
        match self.loading {
            Some(b) => b,
            None => self.state.is_some_and(LoadState::is_loading),
        }
    }

    pub fn load_state(&self) -> LoadState {
        if self.is_loaded() {
            LoadState::Loaded
        } else if self.is_loading() {
            LoadState::Loading
        } else if self.loaded == Some(false) || self.state == Some(LoadState::NotLoaded) {
            LoadState::NotLoaded
        } else {
            LoadState::Unknown
        }
    }

    /// True when the record carries either extended field.
    pub fn has_native_fields(&self) -> bool {
        self.state.is_some() || self.loaded.is_some()
    }

    pub fn key(&self) -> ModelKey {
        derive_key(&self.id)
    }
}

/// Parsed `GET {lmRoot}/api/v1/models` body.
#[derive(Clone, Debug, Default)]
pub struct NativeListing {
    pub entries: Vec<ModelStateInfo>,
    /// False for an empty listing too: an empty list proves nothing about
    /// native support.
    pub has_native_fields: bool,
}

pub fn parse_native_listing(body: &Value) -> NativeListing {
    let raw = body.get("data").and_then(Value::as_array);
    let Some(raw) = raw else {
        return NativeListing::default();
    };
    let has_native_fields = raw.iter().any(|m| {
        m.get("state").map_or(false, Value::is_string) || m.get("loaded").map_or(false, Value::is_boolean)
    });
    NativeListing {
        entries: raw.iter().filter_map(ModelStateInfo::from_value).collect(),
        has_native_fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_derive_key_strips_numeric_suffix_only() {
        assert_eq!(derive_key("m:2"), "m");
        assert_eq!(derive_key("m"), "m");
        assert_eq!(derive_key("  qwen2.5:14 "), "qwen2.5");
        assert_eq!(derive_key("llama:q4"), "llama:q4");
        assert_eq!(derive_key("llama:"), "llama:");
        assert_eq!(derive_key("org/model:3:1"), "org/model:3");
        assert_eq!(derive_key(""), "");
    }

    #[test]
    fn test_derive_key_stable_across_instances() {
        for x in ["m", "m:1", "phi-3:12", "a:b", "x:y:7"] {
            let k = derive_key(x);
            assert_eq!(derive_key(&format!("{k}:3")), k);
            assert_eq!(derive_key(&k), k);
        }
    }

    #[test]
    fn test_normalize_id() {
        assert_eq!(normalize_id("  m:1\n"), "m:1");
        assert!(normalize_id("   ").is_empty());
    }

    #[test]
    fn test_load_state_is_total() {
        let cases = [
            ("loaded", LoadState::Loaded),
            (" READY ", LoadState::Loaded),
            ("Running", LoadState::Loaded),
            ("loading", LoadState::Loading),
            ("queued", LoadState::Loading),
            ("initializing", LoadState::Loading),
            ("downloading", LoadState::Loading),
            ("PULLING", LoadState::Loading),
            ("not-loaded", LoadState::NotLoaded),
            ("unloaded", LoadState::NotLoaded),
            ("error", LoadState::NotLoaded),
            ("failed", LoadState::NotLoaded),
            ("", LoadState::Unknown),
            ("warming-up", LoadState::Unknown),
        ];
        for (raw, expected) in cases {
            let s = LoadState::from_state_str(raw);
            assert_eq!(s, expected, "{raw:?}");
            assert!(!(s.is_loaded() && s.is_loading()));
        }
    }

    #[test]
    fn test_boolean_fields_win_over_state() {
        let info = ModelStateInfo::from_value(&json!({"id": "m", "loaded": false, "state": "loaded"})).unwrap();
        assert!(!info.is_loaded());
        assert_eq!(info.load_state(), LoadState::NotLoaded);

        let info = ModelStateInfo::from_value(&json!({"id": "m", "state": "queued"})).unwrap();
        assert_eq!(info.load_state(), LoadState::Loading);

        let info = ModelStateInfo::from_value(&json!({"id": "m", "state": "mystery"})).unwrap();
        assert_eq!(info.state, Some(LoadState::Unknown));
        assert!(info.has_native_fields());
        assert_eq!(info.load_state(), LoadState::Unknown);

        let info = ModelStateInfo::from_value(&json!({"id": "m", "state": " Loaded "})).unwrap();
        assert_eq!(info.state, Some(LoadState::Loaded));
        assert!(info.is_loaded());
        assert!(!info.is_loading());
    }

    #[test]
    fn test_lenient_entry_decode() {
        let info = ModelStateInfo::from_value(&json!({
            "id": " m:1 ",
            "loaded": "yes",
            "quantization": {"name": "Q4_K_M", "bits": 4}
        }))
        .unwrap();
        assert_eq!(info.id, "m:1");
        assert_eq!(info.loaded, None);
        assert!(!info.has_native_fields());
        assert_eq!(info.quantization.as_deref(), Some("Q4_K_M"));

        assert!(ModelStateInfo::from_value(&json!({"id": ""})).is_none());
        assert!(ModelStateInfo::from_value(&json!({"object": "model"})).is_none());
    }

    #[test]
    fn test_empty_listing_is_not_native() {
        let listing = parse_native_listing(&json!({"data": []}));
        assert!(!listing.has_native_fields);
        assert!(listing.entries.is_empty());

        let listing = parse_native_listing(&json!({"data": [{"id": "m", "object": "model"}]}));
        assert!(!listing.has_native_fields);
        assert_eq!(listing.entries.len(), 1);

        let listing = parse_native_listing(&json!({"data": [{"id": "m"}, {"id": "n", "state": "not-loaded"}]}));
        assert!(listing.has_native_fields);
    }
}
