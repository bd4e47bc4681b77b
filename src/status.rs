// =============================================================================
// Status Publisher — append-only, last-writer-wins state sink
// =============================================================================
//
// One JSON document with named sections plus two JSON-lines history files.
// Every write loads the current document, mutates it, and writes it back with
// the same atomic tmp-then-rename discipline as `RuntimeConfig::save`. The
// only producers are the Trading Cycle and the Trigger Engine, both inside
// this process, so the cross-process advisory lock a multi-writer deployment
// would need (a flock-guarded critical section, for when a separate
// dashboard process also writes to the file) collapses here to a single
// in-process mutex -- no dashboard process shares this file in this
// deployment.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::debug;

const EVENT_LIMIT: usize = 200;
const ORDER_LIMIT: usize = 200;
const AI_HISTORY_LIMIT: usize = 300;
const CLOSE_HISTORY_LIMIT: usize = 500;

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// File-backed status sink. `dir` holds `status.json`, `ai_history.jsonl`, and
/// `close_history.jsonl`.
pub struct StatusPublisher {
    status_path: PathBuf,
    ai_history_path: PathBuf,
    close_history_path: PathBuf,
    state: Mutex<Map<String, Value>>,
}

impl StatusPublisher {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create status directory {}", dir.display()))?;

        let status_path = dir.join("status.json");
        let initial = if status_path.exists() {
            let content = std::fs::read_to_string(&status_path)
                .with_context(|| format!("failed to read {}", status_path.display()))?;
            serde_json::from_str::<Value>(&content)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default()
        } else {
            Map::new()
        };

        Ok(Self {
            status_path,
            ai_history_path: dir.join("ai_history.jsonl"),
            close_history_path: dir.join("close_history.jsonl"),
            state: Mutex::new(initial),
        })
    }

    fn write_locked(&self, data: &Map<String, Value>) -> Result<()> {
        let content = serde_json::to_string_pretty(data).context("failed to serialize status")?;
        let tmp_path = self.status_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.status_path)
            .with_context(|| format!("failed to rename into {}", self.status_path.display()))?;
        Ok(())
    }

    /// Merge `payload`'s keys into the named section (leaving unrelated keys
    /// in that section untouched), and stamp `updated_ts`.
    pub fn update_section(&self, section: &str, payload: Value) -> Result<()> {
        let mut state = self.state.lock();
        let node = state
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let (Value::Object(node_map), Value::Object(payload_map)) = (node, payload) {
            for (k, v) in payload_map {
                node_map.insert(k, v);
            }
            node_map.insert("updated_ts".to_string(), json!(now_ts()));
        }
        state.insert("last_update_ts".to_string(), json!(now_ts()));
        self.write_locked(&state)
    }

    /// Replace the named section wholesale with `{"payload": value, "ts": ...}`.
    fn set_snapshot(&self, section: &str, value: Value) -> Result<()> {
        let mut state = self.state.lock();
        state.insert(
            section.to_string(),
            json!({ "payload": value, "ts": now_ts() }),
        );
        state.insert("last_update_ts".to_string(), json!(now_ts()));
        self.write_locked(&state)
    }

    pub fn set_latest_input(&self, payload: Value) -> Result<()> {
        self.set_snapshot("latest_input", payload)
    }

    pub fn set_latest_advice(&self, payload: Value) -> Result<()> {
        self.set_snapshot("latest_advice", payload)
    }

    /// Replace the `positions` section wholesale with the current open set.
    pub fn set_positions(&self, items: Value) -> Result<()> {
        let mut state = self.state.lock();
        state.insert("positions".to_string(), json!({ "items": items, "ts": now_ts() }));
        state.insert("last_update_ts".to_string(), json!(now_ts()));
        self.write_locked(&state)
    }

    /// Append to the bounded `events` rolling list (cap 200).
    pub fn append_event(&self, mut event: Value) -> Result<()> {
        if let Value::Object(ref mut map) = event {
            map.entry("ts").or_insert_with(|| json!(now_ts()));
        }
        let mut state = self.state.lock();
        let events = state
            .entry("events".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = events {
            list.push(event);
            if list.len() > EVENT_LIMIT {
                let drop = list.len() - EVENT_LIMIT;
                list.drain(0..drop);
            }
        }
        state.insert("last_update_ts".to_string(), json!(now_ts()));
        self.write_locked(&state)
    }

    /// Append to the bounded `orders.items` rolling list (cap 200).
    pub fn append_order(&self, mut order: Value) -> Result<()> {
        if let Value::Object(ref mut map) = order {
            map.entry("ts").or_insert_with(|| json!(now_ts()));
        }
        let mut state = self.state.lock();
        let node = state
            .entry("orders".to_string())
            .or_insert_with(|| json!({ "items": [] }));
        if let Value::Object(node_map) = node {
            let items = node_map
                .entry("items")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(list) = items {
                list.push(order);
                if list.len() > ORDER_LIMIT {
                    let drop = list.len() - ORDER_LIMIT;
                    list.drain(0..drop);
                }
            }
            node_map.insert("ts".to_string(), json!(now_ts()));
        }
        state.insert("last_update_ts".to_string(), json!(now_ts()));
        self.write_locked(&state)
    }

    fn append_jsonl(path: &Path, mut entry: Value, cap: usize) -> Result<()> {
        if let Value::Object(ref mut map) = entry {
            map.entry("ts").or_insert_with(|| json!(now_ts()));
        }
        let mut lines: Vec<String> = if path.exists() {
            std::fs::read_to_string(path)
                .unwrap_or_default()
                .lines()
                .map(String::from)
                .collect()
        } else {
            Vec::new()
        };
        lines.push(serde_json::to_string(&entry).context("failed to serialize history entry")?);
        if lines.len() > cap {
            let drop = lines.len() - cap;
            lines.drain(0..drop);
        }
        let content = lines.join("\n") + "\n";
        std::fs::write(path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Append one entry to `ai_history.jsonl` (cap 300).
    pub fn append_ai_history(&self, entry: Value) -> Result<()> {
        let _guard = self.state.lock();
        debug!("appending ai_history entry");
        Self::append_jsonl(&self.ai_history_path, entry, AI_HISTORY_LIMIT)
    }

    /// Append one entry to `close_history.jsonl` (cap 500).
    pub fn append_close_history(&self, entry: Value) -> Result<()> {
        let _guard = self.state.lock();
        debug!("appending close_history entry");
        Self::append_jsonl(&self.close_history_path, entry, CLOSE_HISTORY_LIMIT)
    }

    /// Read the current status document (for tests / diagnostics).
    pub fn read(&self) -> Value {
        Value::Object(self.state.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("status-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn update_section_merges_without_clobbering_other_keys() {
        let dir = temp_dir("merge");
        let pub_ = StatusPublisher::new(&dir).unwrap();
        pub_.update_section("trader", json!({"state": "running", "symbol": "ETHUSDT"})).unwrap();
        pub_.update_section("trader", json!({"notice": "forbidden_window"})).unwrap();

        let status = pub_.read();
        let trader = &status["trader"];
        assert_eq!(trader["state"], "running");
        assert_eq!(trader["symbol"], "ETHUSDT");
        assert_eq!(trader["notice"], "forbidden_window");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn events_list_is_capped() {
        let dir = temp_dir("events");
        let pub_ = StatusPublisher::new(&dir).unwrap();
        for i in 0..(EVENT_LIMIT + 10) {
            pub_.append_event(json!({"seq": i})).unwrap();
        }
        let status = pub_.read();
        let events = status["events"].as_array().unwrap();
        assert_eq!(events.len(), EVENT_LIMIT);
        assert_eq!(events.last().unwrap()["seq"], EVENT_LIMIT + 9);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn status_persists_across_instances_via_atomic_write() {
        let dir = temp_dir("persist");
        {
            let pub_ = StatusPublisher::new(&dir).unwrap();
            pub_.set_latest_input(json!({"symbol": "ETHUSDT"})).unwrap();
        }
        let reopened = StatusPublisher::new(&dir).unwrap();
        let status = reopened.read();
        assert_eq!(status["latest_input"]["payload"]["symbol"], "ETHUSDT");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn ai_history_file_is_capped_and_appends_jsonl() {
        let dir = temp_dir("ai_history");
        let pub_ = StatusPublisher::new(&dir).unwrap();
        for i in 0..5 {
            pub_.append_ai_history(json!({"decision": "long", "seq": i})).unwrap();
        }
        let content = std::fs::read_to_string(dir.join("ai_history.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 5);
        std::fs::remove_dir_all(&dir).ok();
    }
}
