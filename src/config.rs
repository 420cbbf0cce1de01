//! Process-wide configuration: where the proxy's state lives on disk, the small
//! system-level settings file (`logLimit`), and the atomic write-with-backup helper
//! every persisted file (catalog, router, LB state, filter rules, traffic log,
//! history) goes through.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Directory holding all of the proxy's persisted state. Mirrors the layout a
/// developer would expect next to their shell config: `~/.llm-proxy/`.
pub fn proxy_home_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LLM_PROXY_HOME") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".llm-proxy")
}

pub fn ensure_home_dir() -> io::Result<PathBuf> {
    let dir = proxy_home_dir();
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// The two upstream families a single process can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Claude,
    Codex,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Claude => "claude",
            ServiceKind::Codex => "codex",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const ALLOWED_LOG_LIMITS: [u32; 4] = [10, 30, 50, 100];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_log_limit")]
    pub log_limit: u32,
}

fn default_log_limit() -> u32 {
    50
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_limit: default_log_limit(),
        }
    }
}

impl SystemConfig {
    pub fn normalized_log_limit(&self) -> u32 {
        if ALLOWED_LOG_LIMITS.contains(&self.log_limit) {
            self.log_limit
        } else {
            default_log_limit()
        }
    }

    pub fn path() -> PathBuf {
        proxy_home_dir().join("system.json")
    }

    pub fn load() -> Self {
        let path = Self::path();
        let Ok(text) = fs::read_to_string(&path) else {
            return Self::default();
        };
        serde_json::from_str(&text).unwrap_or_default()
    }

    pub fn save(&self) -> anyhow::Result<()> {
        atomic_write_json(&Self::path(), self)
    }
}

/// Serialize `value` to pretty JSON and write it atomically: write to a sibling
/// `.tmp` file, keep one `.bak` copy of whatever was there before, then rename
/// the temp file into place. Readers never observe a partially written file.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    atomic_write_text(path, &text)
}

pub fn atomic_write_text(path: &Path, text: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if path.exists() {
        let backup = path.with_extension(append_ext(path, "bak"));
        let _ = fs::copy(path, backup);
    }
    let tmp = path.with_extension(append_ext(path, "tmp"));
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn append_ext(path: &Path, suffix: &str) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.{suffix}"),
        None => suffix.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_GUARD: Mutex<()> = Mutex::new(());

    struct ScopedEnv {
        key: &'static str,
        prev: Option<String>,
    }

    impl ScopedEnv {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }
    }

    impl Drop for ScopedEnv {
        fn drop(&mut self) {
            unsafe {
                match &self.prev {
                    Some(v) => std::env::set_var(self.key, v),
                    None => std::env::remove_var(self.key),
                }
            }
        }
    }

    #[test]
    fn system_config_normalizes_invalid_log_limit() {
        let cfg = SystemConfig { log_limit: 7 };
        assert_eq!(cfg.normalized_log_limit(), 50);
    }

    #[test]
    fn atomic_write_round_trips_and_backs_up() {
        let _guard = ENV_GUARD.lock().unwrap();
        let tmp_dir =
            std::env::temp_dir().join(format!("llm-proxy-test-{}", uuid::Uuid::new_v4()));
        let _env = ScopedEnv::set("LLM_PROXY_HOME", tmp_dir.to_str().unwrap());
        let path = tmp_dir.join("system.json");

        let first = SystemConfig { log_limit: 10 };
        atomic_write_json(&path, &first).unwrap();
        let loaded: SystemConfig =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.log_limit, 10);

        let second = SystemConfig { log_limit: 100 };
        atomic_write_json(&path, &second).unwrap();
        assert!(path.with_extension("json.bak").exists());
        let loaded: SystemConfig =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.log_limit, 100);

        let _ = fs::remove_dir_all(&tmp_dir);
    }
}
