//! The routing layer (§4.3): rewrites the outbound JSON body's `model` field and/or
//! forces a channel override, driven by a small, hot-reloaded config file.
//!
//! Grounded on the host crate's model-routing concept (`model_routing.rs`) generalized
//! from wildcard matching to exact-match `model-mapping`/`config-mapping`
//! rules, and on `proxy::runtime_config`'s hot-reload idiom via [`crate::filecache`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ServiceKind, atomic_write_json, proxy_home_dir};
use crate::filecache::{FileBacked, FileCache};

const ROUTER_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    Default,
    ModelMapping,
    ConfigMapping,
}

impl Default for RoutingMode {
    fn default() -> Self {
        RoutingMode::Default
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Model,
    Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapping {
    pub source: String,
    pub source_type: SourceType,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMapping {
    pub model: String,
    pub config: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingDoc {
    #[serde(default)]
    pub mode: RoutingMode,
    #[serde(default, rename = "modelMappings")]
    pub model_mappings: HashMap<String, Vec<ModelMapping>>,
    #[serde(default, rename = "configMappings")]
    pub config_mappings: HashMap<String, Vec<ConfigMapping>>,
}

impl FileBacked for RoutingDoc {
    fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// §7 `router-parse-error`: log and continue as passthrough — unlike the
    /// catalog's `catalog-corrupt` self-heal, a bad `router.json` must not be
    /// overwritten with `{}`.
    fn truncate_on_parse_error() -> bool {
        false
    }
}

pub struct Router {
    cache: FileCache<RoutingDoc>,
    service: ServiceKind,
}

pub struct RouteResult {
    pub body: Vec<u8>,
    pub channel_override: Option<String>,
}

impl Router {
    pub fn for_service(service: ServiceKind) -> Self {
        Self::at_path(router_path(), service)
    }

    pub fn at_path(path: PathBuf, service: ServiceKind) -> Self {
        Self {
            cache: FileCache::new(path, ROUTER_DEBOUNCE),
            service,
        }
    }

    /// `current_channel` is the channel the LB selector would pick *before* any
    /// override from this call (needed for `source_type = config` matching).
    /// `known_channels` validates `config-mapping` targets against the catalog
    /// (§4.3: a mapping naming an unknown channel is ignored, not forwarded).
    pub fn route(
        &self,
        body: &[u8],
        current_channel: Option<&str>,
        known_channels: &HashSet<String>,
    ) -> RouteResult {
        let doc = self.cache.get();
        match doc.mode {
            RoutingMode::Default => RouteResult {
                body: body.to_vec(),
                channel_override: None,
            },
            RoutingMode::ModelMapping => {
                self.route_model_mapping(&doc, body, current_channel)
            }
            RoutingMode::ConfigMapping => {
                self.route_config_mapping(&doc, body, known_channels)
            }
        }
    }

    fn route_model_mapping(
        &self,
        doc: &RoutingDoc,
        body: &[u8],
        current_channel: Option<&str>,
    ) -> RouteResult {
        let Some(mappings) = doc.model_mappings.get(self.service.as_str()) else {
            return RouteResult {
                body: body.to_vec(),
                channel_override: None,
            };
        };
        let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
            return RouteResult {
                body: body.to_vec(),
                channel_override: None,
            };
        };
        let requested_model = value
            .get("model")
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        for mapping in mappings {
            let hit = match mapping.source_type {
                SourceType::Model => requested_model.as_deref() == Some(mapping.source.as_str()),
                SourceType::Config => current_channel == Some(mapping.source.as_str()),
            };
            if !hit {
                continue;
            }
            if let Some(obj) = value.as_object_mut() {
                obj.insert("model".to_string(), Value::String(mapping.target.clone()));
            }
            let new_body = serde_json::to_vec(&value).unwrap_or_else(|_| body.to_vec());
            return RouteResult {
                body: new_body,
                channel_override: None,
            };
        }

        RouteResult {
            body: body.to_vec(),
            channel_override: None,
        }
    }

    /// Rewrite every reference to `old` as `new` across this service's mapping
    /// rules (`source_type = config` sources and `config-mapping` targets), and
    /// persist (§4.1 rename propagation).
    pub fn rename_channel(&self, old: &str, new: &str) {
        let mut doc = (*self.cache.get()).clone();
        let mut changed = false;
        if let Some(mappings) = doc.model_mappings.get_mut(self.service.as_str()) {
            for mapping in mappings.iter_mut() {
                if mapping.source_type == SourceType::Config && mapping.source == old {
                    mapping.source = new.to_string();
                    changed = true;
                }
            }
        }
        if let Some(mappings) = doc.config_mappings.get_mut(self.service.as_str()) {
            for mapping in mappings.iter_mut() {
                if mapping.config == old {
                    mapping.config = new.to_string();
                    changed = true;
                }
            }
        }
        if changed {
            let _ = atomic_write_json(self.cache.path(), &doc);
            self.cache.force_reload();
        }
    }

    fn route_config_mapping(
        &self,
        doc: &RoutingDoc,
        body: &[u8],
        known_channels: &HashSet<String>,
    ) -> RouteResult {
        let Some(mappings) = doc.config_mappings.get(self.service.as_str()) else {
            return RouteResult {
                body: body.to_vec(),
                channel_override: None,
            };
        };
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            return RouteResult {
                body: body.to_vec(),
                channel_override: None,
            };
        };
        let requested_model = value.get("model").and_then(Value::as_str);

        for mapping in mappings {
            if requested_model == Some(mapping.model.as_str())
                && known_channels.contains(&mapping.config)
            {
                return RouteResult {
                    body: body.to_vec(),
                    channel_override: Some(mapping.config.clone()),
                };
            }
        }

        RouteResult {
            body: body.to_vec(),
            channel_override: None,
        }
    }
}

pub fn router_path() -> PathBuf {
    proxy_home_dir().join("router.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp_path() -> PathBuf {
        std::env::temp_dir().join(format!("router-test-{}.json", uuid::Uuid::new_v4()))
    }

    fn channels(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_mode_passes_through() {
        let path = tmp_path();
        let router = Router::at_path(path.clone(), ServiceKind::Claude);
        let result = router.route(br#"{"model":"m1"}"#, None, &channels(&[]));
        assert_eq!(result.body, br#"{"model":"m1"}"#);
        assert!(result.channel_override.is_none());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn model_mapping_rewrites_matching_model() {
        let path = tmp_path();
        fs::write(
            &path,
            r#"{"mode":"model-mapping","modelMappings":{"claude":[{"source":"m1","source_type":"model","target":"m2"}]}}"#,
        )
        .unwrap();
        let router = Router::at_path(path.clone(), ServiceKind::Claude);
        let result = router.route(br#"{"model":"m1","x":1}"#, None, &channels(&[]));
        let value: Value = serde_json::from_slice(&result.body).unwrap();
        assert_eq!(value["model"], "m2");
        assert_eq!(value["x"], 1);

        let result = router.route(br#"{"model":"m3"}"#, None, &channels(&[]));
        let value: Value = serde_json::from_slice(&result.body).unwrap();
        assert_eq!(value["model"], "m3");
        let _ = fs::remove_file(path);
    }

    #[test]
    fn config_mapping_overrides_channel_without_mutating_body() {
        let path = tmp_path();
        fs::write(
            &path,
            r#"{"mode":"config-mapping","configMappings":{"claude":[{"model":"m1","config":"p2"}]}}"#,
        )
        .unwrap();
        let router = Router::at_path(path.clone(), ServiceKind::Claude);
        let result = router.route(br#"{"model":"m1"}"#, None, &channels(&["p2"]));
        assert_eq!(result.channel_override, Some("p2".to_string()));
        assert_eq!(result.body, br#"{"model":"m1"}"#);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn config_mapping_ignores_unknown_channel() {
        let path = tmp_path();
        fs::write(
            &path,
            r#"{"mode":"config-mapping","configMappings":{"claude":[{"model":"m1","config":"ghost"}]}}"#,
        )
        .unwrap();
        let router = Router::at_path(path.clone(), ServiceKind::Claude);
        let result = router.route(br#"{"model":"m1"}"#, None, &channels(&["p2"]));
        assert!(result.channel_override.is_none());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn rename_channel_rewrites_config_references() {
        let path = tmp_path();
        fs::write(
            &path,
            r#"{"mode":"config-mapping","configMappings":{"claude":[{"model":"m1","config":"old"}]},"modelMappings":{"claude":[{"source":"old","source_type":"config","target":"m2"}]}}"#,
        )
        .unwrap();
        let router = Router::at_path(path.clone(), ServiceKind::Claude);
        router.rename_channel("old", "new");
        let result = router.route(br#"{"model":"m1"}"#, None, &channels(&["new"]));
        assert_eq!(result.channel_override, Some("new".to_string()));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn model_mapping_source_type_config_matches_current_channel() {
        let path = tmp_path();
        fs::write(
            &path,
            r#"{"mode":"model-mapping","modelMappings":{"claude":[{"source":"p1","source_type":"config","target":"m-forced"}]}}"#,
        )
        .unwrap();
        let router = Router::at_path(path.clone(), ServiceKind::Claude);
        let result = router.route(br#"{"model":"whatever"}"#, Some("p1"), &channels(&[]));
        let value: Value = serde_json::from_slice(&result.body).unwrap();
        assert_eq!(value["model"], "m-forced");
        let _ = fs::remove_file(path);
    }
}
