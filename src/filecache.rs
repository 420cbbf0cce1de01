//! A small hot-reloading cache for JSON-backed config files.
//!
//! Every persisted component of the proxy (channel catalog, routing config, LB
//! state, filter rules) is edited out-of-band by a local UI and read on every
//! request. Re-parsing the file on every request would put disk I/O on the byte
//! forwarding path, so each reader is wrapped in a [`FileCache`]: it keeps a
//! cheap `Arc` snapshot and only re-reads when (a) a debounce window has
//! elapsed *and* (b) the file's `(mtime, size)` signature actually changed.
//!
//! Grounded on the codex-helper host crate's `proxy::runtime_config::RuntimeConfig`,
//! generalized from a single config type to any `T: Default + Clone`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

type Signature = (SystemTime, u64);

struct Inner<T> {
    value: Arc<T>,
    last_check: Instant,
    last_sig: Option<Signature>,
}

/// Loads and (re)parses `T` from a file, with a self-healing default on any
/// read/parse failure (corrupt/missing files behave as an empty/default value).
pub trait FileBacked: Default + Sized {
    /// Parse `text` into `Self`. Returning `Err` triggers the caller's self-heal
    /// policy (typically: reset the in-memory value to `Default`).
    fn parse(text: &str) -> anyhow::Result<Self>;

    /// Whether a parse failure should truncate the backing file to `{}` in
    /// addition to resetting the in-memory value. True for the channel catalog
    /// (§4.1's `catalog-corrupt` policy: a corrupt file edited by a local UI
    /// is deliberately reset). §7's `router-parse-error` only requires logging
    /// and passthrough, not wiping `router.json`, so `RoutingDoc` overrides
    /// this to `false`.
    fn truncate_on_parse_error() -> bool {
        true
    }
}

pub struct FileCache<T> {
    path: PathBuf,
    debounce: Duration,
    inner: RwLock<Inner<T>>,
}

impl<T: FileBacked> FileCache<T> {
    pub fn new(path: PathBuf, debounce: Duration) -> Self {
        Self {
            path,
            debounce,
            inner: RwLock::new(Inner {
                value: Arc::new(T::default()),
                last_check: Instant::now() - debounce - Duration::from_secs(1),
                last_sig: None,
            }),
        }
    }

    fn signature(&self) -> Option<Signature> {
        let meta = fs::metadata(&self.path).ok()?;
        let mtime = meta.modified().ok()?;
        Some((mtime, meta.len()))
    }

    /// Returns the current cached value, reloading from disk first if the
    /// debounce window has elapsed and the file signature changed.
    pub fn get(&self) -> Arc<T> {
        {
            let guard = self.inner.read().unwrap();
            if guard.last_check.elapsed() < self.debounce {
                return guard.value.clone();
            }
        }
        self.maybe_reload()
    }

    fn maybe_reload(&self) -> Arc<T> {
        let mut guard = self.inner.write().unwrap();
        if guard.last_check.elapsed() < self.debounce {
            return guard.value.clone();
        }
        guard.last_check = Instant::now();

        let sig = self.signature();
        if sig == guard.last_sig {
            return guard.value.clone();
        }
        guard.last_sig = sig;

        let Some(text) = fs::read_to_string(&self.path).ok() else {
            // Missing file: treat as not-yet-created, keep previous value.
            return guard.value.clone();
        };

        match T::parse(&text) {
            Ok(parsed) => {
                guard.value = Arc::new(parsed);
            }
            Err(_) => {
                // Corrupt file: always reset the in-memory value; only truncate the
                // backing file itself when this type opts into that self-heal policy
                // (§4.1 catalog-corrupt vs §7 router-parse-error: log and continue).
                if T::truncate_on_parse_error() {
                    let _ = fs::write(&self.path, "{}");
                }
                guard.value = Arc::new(T::default());
            }
        }
        guard.value.clone()
    }

    /// Force a reload regardless of the debounce window (used right after a write).
    pub fn force_reload(&self) -> Arc<T> {
        {
            let mut guard = self.inner.write().unwrap();
            guard.last_check = Instant::now() - self.debounce - Duration::from_secs(1);
        }
        self.maybe_reload()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
