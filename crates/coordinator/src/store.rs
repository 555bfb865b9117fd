use std::sync::Mutex;

use hdrhistogram::Histogram as HdrHistogram;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;

use crate::agents::AgentInfo;
use crate::error::CoordinatorError;

/// Latency histogram shared between the merge step, which is the sole
/// writer, and the presentation endpoint, which only reads `max()`.
pub struct Histogram(Mutex<HdrHistogram<u64>>);

impl Histogram {
    /// Range `[1 µs, 5 s]`, 3 significant digits, matching the original's
    /// `hdrhistogram.New(1, 5*1000*1000, 3)`.
    pub fn new() -> Self {
        let histogram = HdrHistogram::new_with_bounds(1, 5_000_000, 3).expect("static bounds are valid");
        Histogram(Mutex::new(histogram))
    }

    fn record(&self, latency_us: u64) {
        let _ = self.0.lock().unwrap().record(latency_us);
    }

    pub fn max(&self) -> u64 {
        self.0.lock().unwrap().max()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// The rolling `CaptureResults` table: one row per composite key per merge
/// pass, one `agent_<index>` column per configured agent. Accessed from the
/// control loop's merge step, the flusher task, and the presentation
/// endpoint, all serialized through this single connection's lock.
pub struct Store {
    conn: Mutex<Connection>,
    agent_count: usize,
}

impl Store {
    /// Drops and recreates the table (§4.5 SETUP_STORE). `path` is removed
    /// first, matching the original's `os.Remove(file)` before opening.
    pub fn open(path: &str, agent_count: usize) -> Result<Self, CoordinatorError> {
        let _ = std::fs::remove_file(path);
        let conn = Connection::open(path)
            .map_err(|source| CoordinatorError::StoreOpen { path: path.to_string(), source })?;

        let agent_cols: Vec<String> = (0..agent_count).map(|i| format!("agent_{i} text")).collect();
        let create = format!(
            "create table CaptureResults (composite_key text not null, timestamp integer, {})",
            agent_cols.join(", ")
        );
        conn.execute(&create, [])?;

        Ok(Store { conn: Mutex::new(conn), agent_count })
    }

    /// Cross-agent merge relative to the lead agent (index 0), per §4.6:
    /// one row per lead composite key, one column per agent (NULL where a
    /// follower has no matching key), every recorded latency added to the
    /// shared histogram, all inside one transaction.
    pub fn merge_and_store(
        &self,
        agents: &mut [AgentInfo],
        histogram: &Histogram,
        now_ms: i64,
    ) -> Result<(), CoordinatorError> {
        debug_assert_eq!(agents.len(), self.agent_count);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let placeholders = vec!["?"; 2 + self.agent_count].join(", ");
        let insert = format!("insert into CaptureResults values ({placeholders})");

        let lead_keys: Vec<String> = agents[0].results.keys().cloned().collect();
        for key in lead_keys {
            let lead = agents[0].results.get(&key).expect("key drawn from this map").clone();
            let lead_latency: i64 = lead.oplatency.parse().unwrap_or_default();
            histogram.record(lead_latency.max(0) as u64);

            let mut row: Vec<Value> = vec![Value::String(key.clone()), Value::from(now_ms), Value::String(lead.oplatency)];
            for agent in agents.iter().skip(1) {
                match agent.results.get(&key) {
                    Some(info) => {
                        let latency: i64 = info.oplatency.parse().unwrap_or_default();
                        histogram.record(latency.max(0) as u64);
                        row.push(Value::String(info.oplatency.clone()));
                    }
                    None => row.push(Value::Null),
                }
            }

            let params: Vec<rusqlite::types::Value> = row
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => rusqlite::types::Value::Text(s),
                    Value::Number(n) => rusqlite::types::Value::Integer(n.as_i64().unwrap_or_default()),
                    Value::Null => rusqlite::types::Value::Null,
                    _ => unreachable!("composite rows only ever hold strings, one integer, and nulls"),
                })
                .collect();
            tx.execute(&insert, params_from_iter(params))?;
        }

        tx.commit()?;
        for agent in agents.iter_mut() {
            agent.results.clear();
        }
        Ok(())
    }

    /// Every row currently in the rolling store, serialized the same shape
    /// as the presentation endpoint's `data` blob.
    pub fn all_rows(&self) -> Result<Vec<Value>, CoordinatorError> {
        let conn = self.conn.lock().unwrap();
        let mut columns = vec!["composite_key".to_string(), "timestamp".to_string()];
        columns.extend((0..self.agent_count).map(|i| format!("agent_{i}")));

        let mut stmt = conn.prepare("select * from CaptureResults")?;
        let column_count = columns.len();
        let rows = stmt.query_map([], |row| {
            let mut entry = serde_json::Map::new();
            for (i, name) in columns.iter().enumerate().take(column_count) {
                let value = if name == "timestamp" {
                    let timestamp: i64 = row.get(i)?;
                    Value::from(timestamp)
                } else {
                    let value: Option<String> = row.get(i)?;
                    value.map(Value::String).unwrap_or(Value::Null)
                };
                entry.insert(name.clone(), value);
            }
            Ok(Value::Object(entry))
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(CoordinatorError::from)
    }

    /// Deletes every row. Called by the flusher task every `history.period`
    /// minutes, giving a rolling bounded history.
    pub fn flush(&self) -> Result<(), CoordinatorError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("delete from CaptureResults", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tricorder_proto::CaptureInfo;

    use super::*;
    use crate::agents::AgentInfo;

    fn capture_info(opaque: &str, oplatency: &str) -> CaptureInfo {
        CaptureInfo { opaque: opaque.into(), oplatency: oplatency.into(), key: "foo".into() }
    }

    fn temp_db_path(name: &str) -> String {
        format!("{}/tricorder-store-test-{name}-{}.db", std::env::temp_dir().display(), std::process::id())
    }

    #[tokio::test]
    async fn merging_identical_agent_maps_produces_matching_columns() {
        let path = temp_db_path("identical");
        let store = Store::open(&path, 2).unwrap();
        let histogram = Histogram::new();

        let mut agents = vec![
            AgentInfo::stub(0, HashMap::from([("42_7".to_string(), capture_info("42", "500"))])),
            AgentInfo::stub(1, HashMap::from([("42_7".to_string(), capture_info("42", "500"))])),
        ];

        store.merge_and_store(&mut agents, &histogram, 1_700_000_000_000).unwrap();

        let rows = store.all_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["composite_key"], "42_7");
        assert_eq!(rows[0]["agent_0"], "500");
        assert_eq!(rows[0]["agent_1"], "500");
        assert_eq!(histogram.max(), 500);

        // results are cleared after a successful merge
        assert!(agents[0].results.is_empty());
        assert!(agents[1].results.is_empty());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn missing_follower_key_yields_null_column_not_abort() {
        let path = temp_db_path("missing-follower");
        let store = Store::open(&path, 2).unwrap();
        let histogram = Histogram::new();

        let mut agents = vec![
            AgentInfo::stub(0, HashMap::from([("42_7".to_string(), capture_info("42", "500"))])),
            AgentInfo::stub(1, HashMap::new()),
        ];

        store.merge_and_store(&mut agents, &histogram, 1_700_000_000_000).unwrap();

        let rows = store.all_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["agent_0"], "500");
        assert!(rows[0]["agent_1"].is_null());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn flush_empties_the_table_regardless_of_prior_writes() {
        let path = temp_db_path("flush");
        let store = Store::open(&path, 1).unwrap();
        let histogram = Histogram::new();

        let mut agents = vec![AgentInfo::stub(0, HashMap::from([("1_2".to_string(), capture_info("1", "100"))]))];
        store.merge_and_store(&mut agents, &histogram, 1_700_000_000_000).unwrap();
        assert_eq!(store.all_rows().unwrap().len(), 1);

        store.flush().unwrap();
        assert!(store.all_rows().unwrap().is_empty());

        std::fs::remove_file(&path).ok();
    }
}
