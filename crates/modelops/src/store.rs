use std::collections::{BTreeMap, BTreeSet};

use crate::{derive_key, normalize_id, ModelId, ModelKey, ModelStateInfo};

/// Immutable view of one native listing, keyed by model id.
///
/// Snapshots are replaced wholesale on every successful fetch; nothing
/// merges into an existing one.
#[derive(Clone, Debug, Default)]
pub struct StateSnapshot {
    entries: BTreeMap<ModelId, ModelStateInfo>,
}

impl StateSnapshot {
    pub fn from_entries(entries: impl IntoIterator<Item = ModelStateInfo>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.id.clone(), e)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ModelStateInfo> {
        self.entries.get(id)
    }

    fn family<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a ModelStateInfo> + 'a {
        self.entries.values().filter(move |e| derive_key(&e.id) == key)
    }

    /// True if the exact id, or any instance of its family, satisfies `pred`.
    pub fn family_matches(&self, model: &str, pred: impl Fn(&ModelStateInfo) -> bool) -> bool {
        let model = normalize_id(model);
        if self.get(&model).map_or(false, &pred) {
            return true;
        }
        let key = derive_key(&model);
        let hit = self.family(&key).any(|e| pred(e));
        hit
    }

    /// Authoritative loaded verdict: the exact entry decides when present,
    /// otherwise any loaded family member counts. `None` means the listing
    /// says nothing either way.
    pub fn loaded_verdict(&self, model: &str) -> Option<bool> {
        let model = normalize_id(model);
        if let Some(exact) = self.get(&model) {
            return Some(exact.is_loaded());
        }
        let key = derive_key(&model);
        if self.family(&key).any(ModelStateInfo::is_loaded) {
            return Some(true);
        }
        None
    }

    /// Loaded ids of one family, in id order.
    pub fn loaded_in_family(&self, key: &str) -> Vec<ModelId> {
        self.family(key).filter(|e| e.is_loaded()).map(|e| e.id.clone()).collect()
    }

    pub fn loaded_ids(&self) -> BTreeSet<ModelId> {
        self.entries.values().filter(|e| e.is_loaded()).map(|e| e.id.clone()).collect()
    }

    pub fn loaded_keys(&self) -> BTreeSet<ModelKey> {
        self.entries.values().filter(|e| e.is_loaded()).map(ModelStateInfo::key).collect()
    }
}

/// Order in which duplicate instances are kept: the bare key first, then
/// lexicographic. The first element survives.
pub fn keep_order(key: &str, ids: &mut [ModelId]) {
    ids.sort_by(|a, b| (a != key).cmp(&(b != key)).then_with(|| a.cmp(b)));
}
