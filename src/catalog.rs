//! The channel catalog: named upstream endpoints plus a single "active" one.
//! Grounded on the host crate's `ServiceConfigManager::active_config` (lexicographically
//! first name wins when nothing is marked active) and `proxy::runtime_config::RuntimeConfig`
//! for the hot-reload/self-heal mechanics, generalized through [`crate::filecache::FileCache`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ServiceKind, atomic_write_json, proxy_home_dir};
use crate::filecache::{FileBacked, FileCache};

const CATALOG_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero_weight")]
    pub weight: f64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub active: bool,
}

fn is_zero_weight(w: &f64) -> bool {
    *w == 0.0
}

impl Channel {
    /// A (base_url, auth_token, api_key) signature used to detect pure renames.
    pub fn signature(&self) -> (String, Option<String>, Option<String>) {
        (
            self.base_url.trim_end_matches('/').to_string(),
            self.auth_token.clone(),
            self.api_key.clone(),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDoc(BTreeMap<String, Channel>);

impl FileBacked for CatalogDoc {
    fn parse(text: &str) -> anyhow::Result<Self> {
        let map: BTreeMap<String, Channel> = serde_json::from_str(text)?;
        Ok(CatalogDoc(map))
    }
}

/// Hot-reloaded, TTL+mtime cached view of a service's channel catalog file.
pub struct ChannelCatalog {
    cache: FileCache<CatalogDoc>,
}

impl ChannelCatalog {
    pub fn for_service(service: ServiceKind) -> Self {
        Self::at_path(catalog_path(service))
    }

    pub fn at_path(path: PathBuf) -> Self {
        Self {
            cache: FileCache::new(path, CATALOG_TTL),
        }
    }

    /// A defensive copy of the current name -> Channel map.
    pub fn configs(&self) -> BTreeMap<String, Channel> {
        self.cache.get().0.clone()
    }

    /// The currently active channel's name, if the catalog is non-empty.
    /// If no channel is explicitly marked active, the lexicographically-first
    /// name is treated as active (mirrors `ServiceConfigManager::active_config`).
    pub fn active(&self) -> Option<String> {
        let doc = self.cache.get();
        if let Some((name, _)) = doc.0.iter().find(|(_, c)| c.active) {
            return Some(name.clone());
        }
        doc.0.keys().next().cloned()
    }

    pub fn get(&self, name: &str) -> Option<Channel> {
        self.cache.get().0.get(name).cloned()
    }

    /// Mark `name` active (and only `name`), persist, and refresh the cache.
    pub fn activate(&self, name: &str) -> anyhow::Result<()> {
        let mut doc = (*self.cache.get()).clone();
        if !doc.0.contains_key(name) {
            anyhow::bail!("unknown channel: {name}");
        }
        for (n, c) in doc.0.iter_mut() {
            c.active = n == name;
        }
        atomic_write_json(self.cache.path(), &doc)?;
        self.cache.force_reload();
        Ok(())
    }

    pub fn path(&self) -> &std::path::Path {
        self.cache.path()
    }

    /// Insert or replace a channel's definition. When `set_active` is true, or
    /// the catalog was empty before this call, the new channel becomes the
    /// sole active one; otherwise its `active` flag is left clear so it does
    /// not silently displace an existing active channel.
    pub fn upsert(&self, name: &str, mut channel: Channel, set_active: bool) -> anyhow::Result<()> {
        let mut doc = (*self.cache.get()).clone();
        let was_empty = doc.0.is_empty();
        if set_active || was_empty {
            for c in doc.0.values_mut() {
                c.active = false;
            }
            channel.active = true;
        } else {
            channel.active = false;
        }
        doc.0.insert(name.to_string(), channel);
        atomic_write_json(self.cache.path(), &doc)?;
        self.cache.force_reload();
        Ok(())
    }

    /// Remove a channel by name; a no-op if it is not present.
    pub fn remove(&self, name: &str) -> anyhow::Result<()> {
        let mut doc = (*self.cache.get()).clone();
        doc.0.remove(name);
        atomic_write_json(self.cache.path(), &doc)?;
        self.cache.force_reload();
        Ok(())
    }
}

pub fn catalog_path(service: ServiceKind) -> PathBuf {
    proxy_home_dir().join(format!("{service}_channels.json"))
}

/// Selects a resolvable name from the catalog, falling back to the active
/// name and then catalog order if `preferred` is unknown. Never returns a name
/// absent from the catalog (§3 invariant: "channel selector never returns an
/// unknown name").
pub fn resolve_known_name(configs: &BTreeMap<String, Channel>, preferred: Option<&str>) -> Option<String> {
    if let Some(p) = preferred
        && configs.contains_key(p)
    {
        return Some(p.to_string());
    }
    configs
        .iter()
        .find(|(_, c)| c.active)
        .map(|(n, _)| n.clone())
        .or_else(|| configs.keys().next().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp_path() -> PathBuf {
        std::env::temp_dir().join(format!("catalog-test-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn empty_catalog_has_no_active_channel() {
        let path = tmp_path();
        let catalog = ChannelCatalog::at_path(path.clone());
        assert_eq!(catalog.active(), None);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn lexicographically_first_is_active_when_unmarked() {
        let path = tmp_path();
        fs::write(
            &path,
            r#"{"zeta": {"base_url": "https://z.example"}, "alpha": {"base_url": "https://a.example"}}"#,
        )
        .unwrap();
        let catalog = ChannelCatalog::at_path(path.clone());
        assert_eq!(catalog.active(), Some("alpha".to_string()));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn corrupt_catalog_self_heals_to_empty() {
        let path = tmp_path();
        fs::write(&path, "{not json").unwrap();
        let catalog = ChannelCatalog::at_path(path.clone());
        assert_eq!(catalog.configs().len(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
        let _ = fs::remove_file(path);
    }

    #[test]
    fn resolve_known_name_falls_back_to_active_then_first() {
        let mut map = BTreeMap::new();
        map.insert(
            "b".to_string(),
            Channel {
                base_url: "https://b".into(),
                auth_token: None,
                api_key: None,
                weight: 0.0,
                active: true,
            },
        );
        map.insert(
            "a".to_string(),
            Channel {
                base_url: "https://a".into(),
                auth_token: None,
                api_key: None,
                weight: 0.0,
                active: false,
            },
        );
        assert_eq!(
            resolve_known_name(&map, Some("missing")),
            Some("b".to_string())
        );
        assert_eq!(resolve_known_name(&map, Some("a")), Some("a".to_string()));
    }
}
