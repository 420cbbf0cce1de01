//! The traffic log (§3/§6): a bounded, rewritten-on-every-insert JSONL file per
//! service, with usage of evicted entries rolled into a monotonically
//! non-decreasing history file.
//!
//! Grounded on the host crate's `logging.rs` (`log_request_with_debug`'s
//! serialize-under-a-process-wide-lock pattern, atomic rotate-on-size helper) and
//! `state.rs`'s `UsageRollup`/`replay_usage_from_requests_log`, adapted from an
//! append-forever + separate rotation scheme to a fixed-size rewrite with
//! history spillover, and from four-key to six-key usage.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::{ServiceKind, atomic_write_text, proxy_home_dir};
use crate::live_hub::sanitize_headers;
use crate::usage::UsageMetrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficLogEntry {
    pub timestamp: String,
    pub service: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub target_headers: BTreeMap<String, String>,
    pub original_headers: BTreeMap<String, String>,
    pub original_body_b64: String,
    pub filtered_body_b64: String,
    pub usage: UsageMetrics,
    pub response_b64: String,
    pub response_bytes: u64,
    pub response_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, String>>,
}

pub const RESPONSE_CAPTURE_CAP: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryDoc(BTreeMap<String, BTreeMap<String, UsageMetrics>>);

impl HistoryDoc {
    pub fn add(&mut self, service: &str, channel: &str, usage: &UsageMetrics) {
        let per_channel = self.0.entry(service.to_string()).or_default();
        per_channel.entry(channel.to_string()).or_default().add_assign(usage);
    }

    pub fn rename_channel(&mut self, service: &str, old: &str, new: &str) {
        if let Some(per_channel) = self.0.get_mut(service)
            && let Some(metrics) = per_channel.remove(old)
        {
            per_channel.entry(new.to_string()).or_default().add_assign(&metrics);
        }
    }

    pub fn get(&self, service: &str, channel: &str) -> UsageMetrics {
        self.0
            .get(service)
            .and_then(|m| m.get(channel))
            .copied()
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

pub fn history_path() -> PathBuf {
    proxy_home_dir().join("history.json")
}

fn load_history() -> HistoryDoc {
    fs::read_to_string(history_path())
        .ok()
        .and_then(|t| serde_json::from_str(&t).ok())
        .unwrap_or_default()
}

fn save_history(doc: &HistoryDoc) {
    let _ = atomic_write_text(
        &history_path(),
        &serde_json::to_string_pretty(doc).unwrap_or_default(),
    );
}

/// Serializes writers so JSONL lines never interleave across concurrent requests,
/// and enforces the `logLimit` cap by rewriting the whole file on every insert
/// (acceptable at the default cap of 50; §9 notes a ring buffer as a future
/// option if the cap is raised materially — not needed here).
pub struct TrafficLog {
    service: ServiceKind,
    write_lock: Mutex<()>,
    entries: RwLock<Vec<TrafficLogEntry>>,
}

impl TrafficLog {
    pub fn for_service(service: ServiceKind) -> Self {
        let entries = Self::load_existing(service);
        Self {
            service,
            write_lock: Mutex::new(()),
            entries: RwLock::new(entries),
        }
    }

    fn load_existing(service: ServiceKind) -> Vec<TrafficLogEntry> {
        let path = traffic_log_path_for(service);
        let Ok(text) = fs::read_to_string(path) else {
            return Vec::new();
        };
        text.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn entries(&self) -> Vec<TrafficLogEntry> {
        self.entries.read().unwrap().clone()
    }

    /// Live (bounded-log) aggregation of usage for one channel.
    pub fn live_usage(&self, channel: &str) -> UsageMetrics {
        let mut total = UsageMetrics::default();
        for e in self.entries.read().unwrap().iter() {
            if e.channel.as_deref() == Some(channel) {
                total.add_assign(&e.usage);
            }
        }
        total
    }

    /// Sum of live + persisted-history usage for one channel (§4.6 two-tier read).
    pub fn total_usage(&self, channel: &str) -> UsageMetrics {
        let mut total = self.live_usage(channel);
        total.add_assign(&load_history().get(self.service.as_str(), channel));
        total
    }

    /// Insert a new entry, enforcing the bounded cap by spilling the oldest
    /// entry's usage into history when the log is already at capacity. Runs
    /// under the write-serializing lock, off the byte-forwarding path (callers
    /// should invoke this from a spawned task, not inline in the streaming loop).
    pub fn append(&self, entry: TrafficLogEntry, cap: u32) {
        let _guard = self.write_lock.lock().unwrap();
        let mut entries = self.entries.write().unwrap();
        entries.push(entry);

        let cap = cap as usize;
        while entries.len() > cap {
            let evicted = entries.remove(0);
            if let Some(channel) = &evicted.channel {
                let mut history = load_history();
                history.add(self.service.as_str(), channel, &evicted.usage);
                save_history(&history);
            }
        }

        let path = traffic_log_path_for(self.service);
        let mut text = String::new();
        for e in entries.iter() {
            if let Ok(line) = serde_json::to_string(e) {
                text.push_str(&line);
                text.push('\n');
            }
        }
        let _ = atomic_write_text(&path, &text);
    }

    /// Per-channel totals: live (bounded-log) usage plus persisted history,
    /// for every channel that appears in either tier (§4.6 two-tier read,
    /// applied across the whole catalog rather than a single channel).
    pub fn channel_totals(&self) -> BTreeMap<String, UsageMetrics> {
        let mut totals: BTreeMap<String, UsageMetrics> = BTreeMap::new();
        if let Some(per_channel) = load_history().0.get(self.service.as_str()) {
            for (channel, usage) in per_channel {
                totals.entry(channel.clone()).or_default().add_assign(usage);
            }
        }
        for entry in self.entries.read().unwrap().iter() {
            if let Some(channel) = &entry.channel {
                totals.entry(channel.clone()).or_default().add_assign(&entry.usage);
            }
        }
        totals
    }

    /// Explicit "clear usage" (§3 history invariant exception): drops this
    /// service's persisted history. Live (not-yet-evicted) traffic-log entries
    /// are untouched, since they are not history until they roll over.
    pub fn clear_history(&self) {
        let mut history = load_history();
        if let Some(per_channel) = history.0.get_mut(self.service.as_str()) {
            per_channel.clear();
        }
        save_history(&history);
    }

    pub fn rename_channel(&self, old: &str, new: &str) {
        {
            let mut entries = self.entries.write().unwrap();
            for e in entries.iter_mut() {
                if e.channel.as_deref() == Some(old) {
                    e.channel = Some(new.to_string());
                }
            }
        }
        let mut history = load_history();
        history.rename_channel(self.service.as_str(), old, new);
        save_history(&history);
    }
}

fn traffic_log_path_for(service: ServiceKind) -> PathBuf {
    proxy_home_dir().join(format!("{service}_traffic.jsonl"))
}

/// Builds a bounded base64 capture for the traffic log (≤1 MiB; §3).
pub fn cap_and_encode(bytes: &[u8]) -> (String, u64, bool) {
    let total = bytes.len() as u64;
    let truncated = bytes.len() > RESPONSE_CAPTURE_CAP;
    let slice = &bytes[..bytes.len().min(RESPONSE_CAPTURE_CAP)];
    (
        base64::engine::general_purpose::STANDARD.encode(slice),
        total,
        truncated,
    )
}

pub fn sanitize_header_map(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    sanitize_headers(&headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(channel: &str, usage: UsageMetrics) -> TrafficLogEntry {
        TrafficLogEntry {
            timestamp: "t".into(),
            service: "claude".into(),
            method: "POST".into(),
            path: "/messages".into(),
            status_code: 200,
            duration_ms: 1,
            channel: Some(channel.to_string()),
            target_headers: BTreeMap::new(),
            original_headers: BTreeMap::new(),
            original_body_b64: String::new(),
            filtered_body_b64: String::new(),
            usage,
            response_b64: String::new(),
            response_bytes: 0,
            response_truncated: false,
            response_headers: None,
        }
    }

    #[test]
    fn cap_and_encode_flags_truncation_past_one_mib() {
        let bytes = vec![b'x'; RESPONSE_CAPTURE_CAP + 1];
        let (_data, total, truncated) = cap_and_encode(&bytes);
        assert_eq!(total, (RESPONSE_CAPTURE_CAP + 1) as u64);
        assert!(truncated);
    }

    #[test]
    fn append_enforces_log_limit_and_spills_to_history() {
        let tmp = std::env::temp_dir().join(format!("traffic-test-{}", uuid::Uuid::new_v4()));
        unsafe {
            std::env::set_var("LLM_PROXY_HOME", tmp.to_str().unwrap());
        }
        let log = TrafficLog::for_service(ServiceKind::Claude);
        for i in 0..11 {
            log.append(
                entry(
                    "p1",
                    UsageMetrics {
                        input: 1,
                        ..Default::default()
                    },
                ),
                10,
            );
            let _ = i;
        }
        assert_eq!(log.entries().len(), 10);
        let total = log.total_usage("p1");
        assert_eq!(total.input, 11); // 10 live + 1 spilled into history
        let _ = fs::remove_dir_all(&tmp);
    }
}
