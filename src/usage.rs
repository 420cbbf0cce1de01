//! Usage extractor & aggregator (§4.6). Parses a captured upstream response (JSON or
//! SSE) into a fixed six-key token tally, mapping both claude-style and
//! codex-style provider schemas onto it.
//!
//! Grounded on the host crate's `usage.rs` (`UsageMetrics`, SSE splitting)
//! expanded from four keys to six, and on
//! `original_source/src/utils/usage_parser.py::normalize_usage` for the exact
//! claude/codex field mapping and the bool-before-int coercion rule that the host
//! crate's `to_i64` was missing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub cached_create: u64,
    #[serde(default)]
    pub cached_read: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub reasoning: u64,
    #[serde(default)]
    pub total: u64,
}

impl UsageMetrics {
    pub fn add_assign(&mut self, other: &UsageMetrics) {
        self.input = self.input.saturating_add(other.input);
        self.cached_create = self.cached_create.saturating_add(other.cached_create);
        self.cached_read = self.cached_read.saturating_add(other.cached_read);
        self.output = self.output.saturating_add(other.output);
        self.reasoning = self.reasoning.saturating_add(other.reasoning);
        self.total = self.total.saturating_add(other.total);
    }
}

/// Which upstream schema to map field names from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderSchema {
    Claude,
    Codex,
}

/// Best-effort int coercion: booleans map to 0/1 *before* falling through to the
/// general numeric path (a bool is technically also representable as a number in
/// JSON-adjacent dynamic typing, so the check order matters).
fn to_u64(value: &Value) -> u64 {
    match value {
        Value::Bool(b) => {
            if *b {
                1
            } else {
                0
            }
        }
        Value::Number(n) => {
            if let Some(i) = n.as_u64() {
                i
            } else if let Some(i) = n.as_i64() {
                i.max(0) as u64
            } else if let Some(f) = n.as_f64() {
                f.max(0.0) as u64
            } else {
                0
            }
        }
        Value::String(s) => s
            .parse::<u64>()
            .ok()
            .or_else(|| s.parse::<f64>().ok().map(|f| f.max(0.0) as u64))
            .unwrap_or(0),
        _ => 0,
    }
}

fn field(obj: &Value, key: &str) -> u64 {
    obj.get(key).map(to_u64).unwrap_or(0)
}

fn nested_field(obj: &Value, parent: &str, key: &str) -> u64 {
    obj.get(parent)
        .and_then(|p| p.get(key))
        .map(to_u64)
        .unwrap_or(0)
}

/// Maps a raw provider `usage` JSON object onto the six-key schema (§4.6 table).
pub fn normalize_usage(schema: ProviderSchema, raw: &Value) -> UsageMetrics {
    let input = field(raw, "input_tokens");
    let output = field(raw, "output_tokens");
    let explicit_total = raw.get("total_tokens").map(to_u64);

    let (cached_create, cached_read, reasoning) = match schema {
        ProviderSchema::Claude => (
            field(raw, "cache_creation_input_tokens"),
            field(raw, "cache_read_input_tokens"),
            field(raw, "reasoning_tokens"),
        ),
        ProviderSchema::Codex => (
            field(raw, "cache_creation_input_tokens"),
            nested_field(raw, "input_tokens_details", "cached_tokens"),
            nested_field(raw, "output_tokens_details", "reasoning_tokens"),
        ),
    };

    UsageMetrics {
        input,
        cached_create,
        cached_read,
        output,
        reasoning,
        total: explicit_total.unwrap_or(input + output),
    }
}

/// Extracts the raw usage object from a single decoded JSON payload. Claude-style
/// payloads may carry it top-level or nested under `message` (a fallback present
/// in the original Python implementation but not spelled out in the distilled
/// spec text; kept here since it costs nothing and only ever adds a hit).
fn extract_usage_obj(schema: ProviderSchema, payload: &Value) -> Option<Value> {
    if let Some(u) = payload.get("usage") {
        return Some(u.clone());
    }
    match schema {
        ProviderSchema::Claude => payload
            .get("message")
            .and_then(|m| m.get("usage"))
            .cloned(),
        ProviderSchema::Codex => payload
            .get("response")
            .and_then(|r| r.get("usage"))
            .cloned(),
    }
}

fn is_sse(text: &str) -> bool {
    text.starts_with("event:") || text.contains("\ndata:")
}

/// Splits SSE text on blank lines, decodes each `data:` line, and returns the
/// *last* payload whose usage object can be extracted (cumulative usage wins on
/// the terminal frame).
fn extract_from_sse(schema: ProviderSchema, text: &str) -> Option<UsageMetrics> {
    let mut last: Option<UsageMetrics> = None;
    for frame in text.split("\n\n") {
        for line in frame.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let Ok(payload) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            if let Some(raw) = extract_usage_obj(schema, &payload) {
                last = Some(normalize_usage(schema, &raw));
            }
        }
    }
    last
}

/// Entry point: extract usage metrics from captured response bytes, auto-detecting
/// SSE vs plain JSON by the exact prefix rule spec §4.6 specifies.
pub fn extract_usage_from_bytes(schema: ProviderSchema, bytes: &[u8]) -> UsageMetrics {
    let text = String::from_utf8_lossy(bytes);
    if is_sse(&text) {
        return extract_from_sse(schema, &text).unwrap_or_default();
    }
    let Ok(payload) = serde_json::from_str::<Value>(&text) else {
        return UsageMetrics::default();
    };
    extract_usage_obj(schema, &payload)
        .map(|raw| normalize_usage(schema, &raw))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn claude_schema_maps_all_six_keys() {
        let raw = serde_json::json!({
            "input_tokens": 10,
            "cache_creation_input_tokens": 2,
            "cache_read_input_tokens": 3,
            "output_tokens": 20,
        });
        let usage = normalize_usage(ProviderSchema::Claude, &raw);
        assert_eq!(
            usage,
            UsageMetrics {
                input: 10,
                cached_create: 2,
                cached_read: 3,
                output: 20,
                reasoning: 0,
                total: 30,
            }
        );
    }

    #[test]
    fn codex_schema_reads_nested_details() {
        let raw = serde_json::json!({
            "input_tokens": 5,
            "output_tokens": 7,
            "input_tokens_details": {"cached_tokens": 1},
            "output_tokens_details": {"reasoning_tokens": 4},
            "total_tokens": 100,
        });
        let usage = normalize_usage(ProviderSchema::Codex, &raw);
        assert_eq!(
            usage,
            UsageMetrics {
                input: 5,
                cached_create: 0,
                cached_read: 1,
                output: 7,
                reasoning: 4,
                total: 100,
            }
        );
    }

    #[test]
    fn bool_values_coerce_to_zero_or_one() {
        let raw = serde_json::json!({"input_tokens": true, "output_tokens": false});
        let usage = normalize_usage(ProviderSchema::Claude, &raw);
        assert_eq!(usage.input, 1);
        assert_eq!(usage.output, 0);
    }

    #[test]
    fn sse_extraction_keeps_last_usage_frame() {
        let text = "event: message\n\
            data: {\"usage\":{\"input_tokens\":1,\"output_tokens\":1}}\n\n\
            data: {\"usage\":{\"input_tokens\":1,\"output_tokens\":9}}\n\n\
            data: [DONE]\n\n";
        let usage = extract_usage_from_bytes(ProviderSchema::Claude, text.as_bytes());
        assert_eq!(usage.output, 9);
    }

    #[test]
    fn sse_single_trailing_frame_matches_plain_json_extraction() {
        let json_payload = serde_json::json!({"usage": {"input_tokens": 4, "output_tokens": 6}});
        let sse = format!("event: done\ndata: {}\n\n", json_payload);
        let from_sse = extract_usage_from_bytes(ProviderSchema::Claude, sse.as_bytes());
        let from_json =
            extract_usage_from_bytes(ProviderSchema::Claude, json_payload.to_string().as_bytes());
        assert_eq!(from_sse, from_json);
    }

    #[test]
    fn merge_is_additive_across_all_keys() {
        let mut total = UsageMetrics::default();
        total.add_assign(&UsageMetrics {
            input: 1,
            cached_create: 2,
            cached_read: 3,
            output: 4,
            reasoning: 5,
            total: 6,
        });
        total.add_assign(&UsageMetrics {
            input: 1,
            cached_create: 1,
            cached_read: 1,
            output: 1,
            reasoning: 1,
            total: 1,
        });
        assert_eq!(
            total,
            UsageMetrics {
                input: 2,
                cached_create: 3,
                cached_read: 4,
                output: 5,
                reasoning: 6,
                total: 7,
            }
        );
    }
}
