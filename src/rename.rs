//! Channel-rename propagation (§4.1): when an operator edits the catalog file and
//! changes a channel's key while its `(base_url, auth_token, api_key)` signature
//! stays the same, every other component that remembers the old name by string
//! (load-balancer failure counters, router mapping rules, traffic log / usage
//! history) is rewritten to the new name, so aggregate usage and LB state
//! survive the rename instead of silently resetting under the old key.
//!
//! Polled rather than event-driven, mirroring the hot-reload debounce idiom used
//! throughout [`crate::filecache`]: a [`RenameWatcher`] remembers the catalog
//! snapshot from its last tick and diffs it against the current one.

use std::collections::BTreeMap;

use crate::catalog::Channel;
use crate::lb::LoadBalancer;
use crate::router::Router;
use crate::traffic_log::TrafficLog;

pub struct RenameWatcher {
    last_seen: BTreeMap<String, Channel>,
}

impl RenameWatcher {
    pub fn new() -> Self {
        Self {
            last_seen: BTreeMap::new(),
        }
    }

    /// A rename is recognized only when exactly one name disappeared, exactly
    /// one name appeared, and the two carry an identical signature — anything
    /// else (add, remove, edit-in-place, simultaneous add+remove of unrelated
    /// channels) is left alone.
    fn detect_rename(&self, current: &BTreeMap<String, Channel>) -> Option<(String, String)> {
        if self.last_seen.len() != current.len() {
            return None;
        }
        let mut removed = self.last_seen.keys().filter(|k| !current.contains_key(*k));
        let old_name = removed.next()?;
        if removed.next().is_some() {
            return None;
        }
        let mut added = current.keys().filter(|k| !self.last_seen.contains_key(*k));
        let new_name = added.next()?;
        if added.next().is_some() {
            return None;
        }
        let old_sig = self.last_seen.get(old_name)?.signature();
        let new_sig = current.get(new_name)?.signature();
        (old_sig == new_sig).then(|| (old_name.clone(), new_name.clone()))
    }

    /// Diff `current` against the remembered snapshot, propagate a detected
    /// rename into `lb`/`router`/`traffic_log`, and remember `current` for the
    /// next tick regardless of outcome.
    pub fn reconcile(
        &mut self,
        current: BTreeMap<String, Channel>,
        lb: &LoadBalancer,
        router: &Router,
        traffic_log: &TrafficLog,
    ) {
        if let Some((old, new)) = self.detect_rename(&current) {
            lb.rename_channel(&old, &new);
            router.rename_channel(&old, &new);
            traffic_log.rename_channel(&old, &new);
        }
        self.last_seen = current;
    }
}

impl Default for RenameWatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(base_url: &str) -> Channel {
        Channel {
            base_url: base_url.to_string(),
            auth_token: Some("tok".to_string()),
            api_key: None,
            weight: 1.0,
            active: false,
        }
    }

    #[test]
    fn detects_pure_rename() {
        let mut watcher = RenameWatcher::new();
        let mut before = BTreeMap::new();
        before.insert("old".to_string(), channel("https://a.example"));
        watcher.last_seen = before;

        let mut after = BTreeMap::new();
        after.insert("new".to_string(), channel("https://a.example"));
        assert_eq!(
            watcher.detect_rename(&after),
            Some(("old".to_string(), "new".to_string()))
        );
    }

    #[test]
    fn does_not_confuse_an_edit_with_a_rename() {
        let mut watcher = RenameWatcher::new();
        let mut before = BTreeMap::new();
        before.insert("a".to_string(), channel("https://a.example"));
        watcher.last_seen = before;

        let mut after = BTreeMap::new();
        after.insert("a".to_string(), channel("https://a-changed.example"));
        assert_eq!(watcher.detect_rename(&after), None);
    }

    #[test]
    fn does_not_fire_on_plain_add() {
        let mut watcher = RenameWatcher::new();
        let mut before = BTreeMap::new();
        before.insert("a".to_string(), channel("https://a.example"));
        watcher.last_seen = before;

        let mut after = BTreeMap::new();
        after.insert("a".to_string(), channel("https://a.example"));
        after.insert("b".to_string(), channel("https://b.example"));
        assert_eq!(watcher.detect_rename(&after), None);
    }
}
