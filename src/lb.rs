//! Load-balance selector (§4.4): picks a channel name out of the catalog, either by
//! sticking to the active channel (`active-first`) or by weight with failure-driven
//! exclusion (`weight-based`).
//!
//! Grounded on the host crate's `lb.rs` (`LoadBalancer`/`LbState`, cooldown-on-failure,
//! sticky routing, atomic persistence), re-keyed from per-upstream-index state to
//! per-channel-name state to match this spec's flat channel catalog, and on
//! `ServiceConfigManager::active_config`'s "lexicographically first is active" rule
//! reused here as the weight-based tie-break via catalog iteration order.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::catalog::Channel;
use crate::config::{ServiceKind, atomic_write_json, proxy_home_dir};

const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Matches the catalog/router debounce idiom (§9 hot-reload note): a stat
/// within this window is skipped, so an external editor rewriting `lb.json`
/// (mode/threshold changes) is picked up without adding disk I/O per request.
const LB_DEBOUNCE: Duration = Duration::from_secs(2);

type FileSignature = (SystemTime, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LbMode {
    ActiveFirst,
    WeightBased,
}

impl Default for LbMode {
    fn default() -> Self {
        LbMode::ActiveFirst
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceLbState {
    #[serde(default = "default_threshold", rename = "failureThreshold")]
    pub failure_threshold: u32,
    #[serde(default, rename = "currentFailures")]
    pub current_failures: BTreeMap<String, u32>,
    #[serde(default, rename = "excludedConfigs")]
    pub excluded_configs: HashSet<String>,
}

fn default_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

impl Default for ServiceLbState {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            current_failures: BTreeMap::new(),
            excluded_configs: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LbDoc {
    #[serde(default)]
    pub mode: LbMode,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceLbState>,
}

/// Persisted, name-keyed load-balance state for one service family.
pub struct LoadBalancer {
    path: PathBuf,
    service: ServiceKind,
    doc: RwLock<LbDoc>,
    last_check: Mutex<Instant>,
    last_sig: Mutex<Option<FileSignature>>,
}

impl LoadBalancer {
    pub fn for_service(service: ServiceKind) -> Self {
        Self::at_path(lb_path(), service)
    }

    pub fn at_path(path: PathBuf, service: ServiceKind) -> Self {
        let doc = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        let last_sig = Self::signature_of(&path);
        Self {
            path,
            service,
            doc: RwLock::new(doc),
            last_check: Mutex::new(Instant::now()),
            last_sig: Mutex::new(last_sig),
        }
    }

    fn signature_of(path: &std::path::Path) -> Option<FileSignature> {
        let meta = std::fs::metadata(path).ok()?;
        Some((meta.modified().ok()?, meta.len()))
    }

    /// Re-read `lb.json` from disk if the debounce window has elapsed and the
    /// file's `(mtime, size)` signature changed since the last check (mirrors
    /// [`crate::filecache::FileCache`], reimplemented here because `LbDoc`
    /// also needs write access from [`Self::persist`], which `FileCache` does
    /// not expose). A corrupt file on reload is ignored, leaving the
    /// in-memory state as the last known-good value.
    fn maybe_reload(&self) {
        {
            let mut last_check = self.last_check.lock().unwrap();
            if last_check.elapsed() < LB_DEBOUNCE {
                return;
            }
            *last_check = Instant::now();
        }

        let sig = Self::signature_of(&self.path);
        {
            let mut last_sig = self.last_sig.lock().unwrap();
            if *last_sig == sig {
                return;
            }
            *last_sig = sig;
        }

        if let Ok(text) = std::fs::read_to_string(&self.path)
            && let Ok(parsed) = serde_json::from_str::<LbDoc>(&text)
        {
            *self.doc.write().unwrap() = parsed;
        }
    }

    fn persist(&self, doc: &LbDoc) {
        let mut pruned = doc.clone();
        if let Some(state) = pruned.services.get_mut(self.service.as_str()) {
            // Enforce currentFailures[c] >= threshold <=> c in excludedConfigs.
            for name in &state.excluded_configs {
                if state.current_failures.get(name).copied().unwrap_or(0) < state.failure_threshold
                {
                    state
                        .current_failures
                        .insert(name.clone(), state.failure_threshold);
                }
            }
        }
        let _ = atomic_write_json(&self.path, &pruned);
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ServiceLbState) -> R) -> R {
        let mut doc = self.doc.write().unwrap();
        let state = doc
            .services
            .entry(self.service.as_str().to_string())
            .or_default();
        let result = f(state);
        let snapshot = doc.clone();
        drop(doc);
        self.persist(&snapshot);
        result
    }

    pub fn mode(&self) -> LbMode {
        self.maybe_reload();
        self.doc.read().unwrap().mode
    }

    /// Remove catalog-unknown names from `excludedConfigs` (§4.1 rename/prune rule).
    pub fn prune_unknown(&self, known: &BTreeMap<String, Channel>) {
        self.with_state(|state| {
            state
                .excluded_configs
                .retain(|name| known.contains_key(name));
            state
                .current_failures
                .retain(|name, _| known.contains_key(name));
        });
    }

    /// Select a channel name from `configs` (map name -> Channel) and the catalog's
    /// active name.
    pub fn select(&self, configs: &BTreeMap<String, Channel>, active: Option<&str>) -> Option<String> {
        if configs.is_empty() {
            return None;
        }
        self.maybe_reload();
        match self.mode() {
            LbMode::ActiveFirst => active
                .filter(|a| configs.contains_key(*a))
                .map(|a| a.to_string())
                .or_else(|| configs.keys().next().cloned()),
            LbMode::WeightBased => {
                let doc = self.doc.read().unwrap();
                let state = doc
                    .services
                    .get(self.service.as_str())
                    .cloned()
                    .unwrap_or_default();
                drop(doc);

                let mut ranked: Vec<(&String, &Channel)> = configs.iter().collect();
                ranked.sort_by(|(name_a, a), (name_b, b)| {
                    b.weight
                        .partial_cmp(&a.weight)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| name_a.cmp(name_b))
                });

                ranked
                    .iter()
                    .find(|(name, _)| {
                        !state.excluded_configs.contains(name.as_str())
                            && state.current_failures.get(name.as_str()).copied().unwrap_or(0)
                                < state.failure_threshold
                    })
                    .map(|(name, _)| (*name).clone())
                    .or_else(|| {
                        active
                            .filter(|a| configs.contains_key(*a))
                            .map(|a| a.to_string())
                    })
                    .or_else(|| configs.keys().next().cloned())
            }
        }
    }

    /// Rename a channel's key across `currentFailures`/`excludedConfigs` in place
    /// (§4.1 rename propagation), preserving its failure count and exclusion state.
    pub fn rename_channel(&self, old: &str, new: &str) {
        self.with_state(|state| {
            if let Some(count) = state.current_failures.remove(old) {
                state.current_failures.insert(new.to_string(), count);
            }
            if state.excluded_configs.remove(old) {
                state.excluded_configs.insert(new.to_string());
            }
        });
    }

    /// Record the outcome of a request against `channel` (weight-based mode only;
    /// a no-op in active-first mode, matching §4.4).
    pub fn record_result(&self, channel: &str, success: bool) {
        if self.mode() != LbMode::WeightBased {
            return;
        }
        self.with_state(|state| {
            if success {
                state.current_failures.insert(channel.to_string(), 0);
                state.excluded_configs.remove(channel);
            } else {
                let count = state.current_failures.entry(channel.to_string()).or_insert(0);
                *count += 1;
                if *count >= state.failure_threshold {
                    state.excluded_configs.insert(channel.to_string());
                }
            }
        });
    }
}

pub fn lb_path() -> PathBuf {
    proxy_home_dir().join("lb.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(weight: f64) -> Channel {
        Channel {
            base_url: "https://example".into(),
            auth_token: None,
            api_key: None,
            weight,
            active: false,
        }
    }

    fn tmp_path() -> PathBuf {
        std::env::temp_dir().join(format!("lb-test-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn active_first_returns_active_name() {
        let lb = LoadBalancer::at_path(tmp_path(), ServiceKind::Claude);
        let mut configs = BTreeMap::new();
        configs.insert("a".to_string(), channel(1.0));
        configs.insert("b".to_string(), channel(2.0));
        assert_eq!(lb.select(&configs, Some("a")), Some("a".to_string()));
    }

    #[test]
    fn weight_based_failover_excludes_after_threshold() {
        let path = tmp_path();
        std::fs::write(
            &path,
            r#"{"mode":"weight-based","services":{"claude":{"failureThreshold":2,"currentFailures":{},"excludedConfigs":[]}}}"#,
        )
        .unwrap();
        let lb = LoadBalancer::at_path(path.clone(), ServiceKind::Claude);
        let mut configs = BTreeMap::new();
        configs.insert("a".to_string(), channel(3.0));
        configs.insert("b".to_string(), channel(1.0));

        assert_eq!(lb.select(&configs, Some("a")), Some("a".to_string()));
        lb.record_result("a", false);
        assert_eq!(lb.select(&configs, Some("a")), Some("a".to_string()));
        lb.record_result("a", false);
        // a now excluded, b takes over
        assert_eq!(lb.select(&configs, Some("a")), Some("b".to_string()));

        lb.record_result("b", true);
        assert_eq!(lb.select(&configs, Some("a")), Some("b".to_string()));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn picks_up_external_edits_once_debounce_elapses() {
        let path = tmp_path();
        std::fs::write(&path, r#"{"mode":"active-first","services":{}}"#).unwrap();
        let lb = LoadBalancer::at_path(path.clone(), ServiceKind::Claude);
        assert_eq!(lb.mode(), LbMode::ActiveFirst);

        std::fs::write(&path, r#"{"mode":"weight-based","services":{}}"#).unwrap();
        // Force the debounce window to have already elapsed, as if this call
        // landed long after the last stat rather than in the same instant.
        *lb.last_check.lock().unwrap() = Instant::now() - LB_DEBOUNCE - Duration::from_secs(1);
        assert_eq!(lb.mode(), LbMode::WeightBased);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn invariant_excluded_implies_failures_at_least_threshold() {
        let path = tmp_path();
        let lb = LoadBalancer::at_path(path.clone(), ServiceKind::Codex);
        lb.with_state(|s| {
            s.failure_threshold = 3;
            s.excluded_configs.insert("x".to_string());
        });
        let doc: LbDoc = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let state = &doc.services["codex"];
        assert!(state.current_failures.get("x").copied().unwrap_or(0) >= state.failure_threshold);
        let _ = std::fs::remove_file(path);
    }
}
