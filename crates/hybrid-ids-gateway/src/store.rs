//! Alert store: defensive ingest coercion, the mutex-guarded in-memory
//! list, the append-only JSONL log, and the dashboard aggregations.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const LOG_FILE_NAME: &str = "alerts_gateway.log";

/// One stored alert: the coerced envelope plus its sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert_id: u64,
    pub engine: String,
    pub timestamp: String,
    pub attack_type: String,
    pub severity: u8,
    pub confidence: f64,
    pub message: String,
    pub session: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub payload_preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_score: Option<f64>,
}

fn str_field(value: &Value, key: &str, default: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

fn port_field(value: &Value, key: &str) -> u16 {
    match value.get(key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Coerce one incoming JSON object into a record, defaulting every field
/// that is missing or of the wrong type. Ingest never rejects.
pub fn coerce_alert(value: &Value, alert_id: u64) -> AlertRecord {
    let severity = match value.get("severity") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(1),
        Some(Value::String(s)) => s.parse().unwrap_or(1),
        _ => 1,
    }
    .clamp(1, 5) as u8;

    let confidence = match value.get("confidence") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    };

    let timestamp = match value.get("timestamp").and_then(Value::as_str) {
        Some(ts) if !ts.is_empty() => ts.to_string(),
        _ => Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    };

    let tags = value
        .get("tags")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    AlertRecord {
        alert_id,
        engine: str_field(value, "engine", "unknown"),
        timestamp,
        attack_type: str_field(value, "attack_type", "Unknown"),
        severity,
        confidence,
        message: str_field(value, "message", ""),
        session: str_field(value, "session", ""),
        src_ip: str_field(value, "src_ip", ""),
        dst_ip: str_field(value, "dst_ip", ""),
        src_port: port_field(value, "src_port"),
        dst_port: port_field(value, "dst_port"),
        protocol: str_field(value, "protocol", ""),
        tags,
        payload_preview: str_field(value, "payload_preview", ""),
        real_score: value.get("real_score").and_then(Value::as_f64),
    }
}

/// Aggregate view of the whole store.
#[derive(Debug, Serialize)]
pub struct GatewayStats {
    pub total: usize,
    pub by_engine: HashMap<String, usize>,
    pub by_severity: HashMap<String, usize>,
}

/// Per-attack-type aggregation for the dashboards.
#[derive(Debug, Serialize)]
pub struct AttackTypeSummary {
    pub attack_type: String,
    pub count: usize,
    /// Histogram over severities 1..=5.
    pub severity_distribution: [usize; 5],
    pub avg_confidence: f64,
    pub unique_sources: usize,
    pub unique_targets: usize,
    pub protocols: HashMap<String, usize>,
}

/// The gateway's sole cross-thread mutable state. One mutex guards the
/// list; the log-file append happens outside it.
pub struct AlertStore {
    alerts: Mutex<Vec<AlertRecord>>,
    log_path: PathBuf,
}

impl AlertStore {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            alerts: Mutex::new(Vec::new()),
            log_path: log_dir.join(LOG_FILE_NAME),
        }
    }

    /// Ingest one already-parsed JSON value. Returns the assigned
    /// sequence number, strictly increasing for the process lifetime.
    pub fn ingest(&self, value: &Value) -> u64 {
        let record = {
            let mut alerts = self.alerts.lock();
            let alert_id = alerts.len() as u64 + 1;
            let record = coerce_alert(value, alert_id);
            alerts.push(record.clone());
            record
        };

        // Persistence is best-effort; a failed append never fails ingest.
        if let Err(e) = self.append_log(&record) {
            warn!("Failed to append alert log: {}", e);
        }
        record.alert_id
    }

    fn append_log(&self, record: &AlertRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", line)
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }

    /// Most-recent-first listing, optionally filtered by engine and
    /// truncated. Returns (total after filtering, page).
    pub fn list(&self, limit: Option<usize>, engine: Option<&str>) -> (usize, Vec<AlertRecord>) {
        let alerts = self.alerts.lock();
        let filtered: Vec<AlertRecord> = alerts
            .iter()
            .rev()
            .filter(|a| engine.map_or(true, |e| a.engine == e))
            .cloned()
            .collect();
        let total = filtered.len();
        let page = match limit {
            Some(n) => filtered.into_iter().take(n).collect(),
            None => filtered,
        };
        (total, page)
    }

    pub fn stats(&self) -> GatewayStats {
        let alerts = self.alerts.lock();
        let mut by_engine: HashMap<String, usize> = HashMap::new();
        let mut by_severity: HashMap<String, usize> = HashMap::new();
        for alert in alerts.iter() {
            *by_engine.entry(alert.engine.clone()).or_insert(0) += 1;
            *by_severity.entry(alert.severity.to_string()).or_insert(0) += 1;
        }
        GatewayStats {
            total: alerts.len(),
            by_engine,
            by_severity,
        }
    }

    /// Per-attack-type aggregation, sorted by count descending.
    pub fn attack_details(&self) -> Vec<AttackTypeSummary> {
        let alerts = self.alerts.lock();

        let mut grouped: HashMap<&str, Vec<&AlertRecord>> = HashMap::new();
        for alert in alerts.iter() {
            grouped.entry(&alert.attack_type).or_default().push(alert);
        }

        let mut summaries: Vec<AttackTypeSummary> = grouped
            .into_iter()
            .map(|(attack_type, records)| {
                let mut severity_distribution = [0usize; 5];
                let mut sources: HashSet<&str> = HashSet::new();
                let mut targets: HashSet<&str> = HashSet::new();
                let mut protocols: HashMap<String, usize> = HashMap::new();
                let mut confidence_sum = 0.0;

                for r in &records {
                    let idx = usize::from(r.severity.clamp(1, 5)) - 1;
                    severity_distribution[idx] += 1;
                    sources.insert(&r.src_ip);
                    targets.insert(&r.dst_ip);
                    *protocols.entry(r.protocol.clone()).or_insert(0) += 1;
                    confidence_sum += r.confidence;
                }

                AttackTypeSummary {
                    attack_type: attack_type.to_string(),
                    count: records.len(),
                    severity_distribution,
                    avg_confidence: confidence_sum / records.len() as f64,
                    unique_sources: sources.len(),
                    unique_targets: targets.len(),
                    protocols,
                }
            })
            .collect();

        summaries.sort_by(|a, b| b.count.cmp(&a.count));
        summaries
    }

    /// Full chronological list for one attack type, newest first.
    pub fn by_attack_type(&self, name: &str) -> Vec<AlertRecord> {
        let alerts = self.alerts.lock();
        alerts
            .iter()
            .rev()
            .filter(|a| a.attack_type == name)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> AlertStore {
        let dir = tempfile::tempdir().unwrap();
        // Leak the tempdir so the path survives the store.
        let path = dir.into_path();
        AlertStore::new(&path)
    }

    fn full_alert(engine: &str, attack: &str, severity: u8, src: &str) -> Value {
        json!({
            "engine": engine,
            "timestamp": "2026-08-01 10:00:00",
            "attack_type": attack,
            "severity": severity,
            "confidence": 0.9,
            "message": format!("{} detected", attack),
            "session": format!("{}:50000 -> 192.168.1.100:80", src),
            "src_ip": src,
            "dst_ip": "192.168.1.100",
            "src_port": 50000,
            "dst_port": 80,
            "protocol": "UDP"
        })
    }

    #[test]
    fn test_missing_fields_coerced_to_defaults() {
        let record = coerce_alert(&json!({"engine": "anomaly", "attack_type": "X"}), 1);
        assert_eq!(record.engine, "anomaly");
        assert_eq!(record.attack_type, "X");
        assert_eq!(record.severity, 1);
        assert_eq!(record.confidence, 0.0);
        assert_eq!(record.src_port, 0);
        assert_eq!(record.dst_port, 0);
        // Defaulted timestamp has the envelope shape.
        assert_eq!(record.timestamp.len(), 19);
    }

    #[test]
    fn test_wrong_types_coerced() {
        let record = coerce_alert(
            &json!({
                "severity": "4",
                "confidence": "0.75",
                "src_port": "50000",
                "dst_port": {"nested": true},
                "tags": "not-an-array"
            }),
            1,
        );
        assert_eq!(record.severity, 4);
        assert!((record.confidence - 0.75).abs() < 1e-9);
        assert_eq!(record.src_port, 50000);
        assert_eq!(record.dst_port, 0);
        assert!(record.tags.is_empty());
    }

    #[test]
    fn test_severity_clamped() {
        assert_eq!(coerce_alert(&json!({"severity": 99}), 1).severity, 5);
        assert_eq!(coerce_alert(&json!({"severity": -3}), 1).severity, 1);
        assert_eq!(coerce_alert(&json!({"severity": 0}), 1).severity, 1);
    }

    #[test]
    fn test_sequence_ids_strictly_increase() {
        let store = store();
        let ids: Vec<u64> = (0..5)
            .map(|_| store.ingest(&full_alert("rule", "LFI", 3, "10.0.0.1")))
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_list_newest_first_with_limit_and_engine_filter() {
        let store = store();
        store.ingest(&full_alert("rule", "LFI", 3, "10.0.0.1"));
        store.ingest(&full_alert("anomaly", "DDoS", 5, "10.0.0.2"));
        store.ingest(&full_alert("anomaly", "PortScan", 4, "10.0.0.3"));

        let (total, page) = store.list(None, None);
        assert_eq!(total, 3);
        assert_eq!(page[0].attack_type, "PortScan");
        assert_eq!(page[2].attack_type, "LFI");

        let (total, page) = store.list(Some(1), Some("anomaly"));
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].attack_type, "PortScan");

        let (total, page) = store.list(None, Some("rule"));
        assert_eq!(total, 1);
        assert_eq!(page[0].alert_id, 1);
    }

    #[test]
    fn test_stats_aggregation() {
        let store = store();
        store.ingest(&full_alert("rule", "LFI", 3, "10.0.0.1"));
        store.ingest(&full_alert("anomaly", "DDoS", 5, "10.0.0.2"));
        store.ingest(&full_alert("anomaly", "DDoS", 5, "10.0.0.3"));

        let stats = store.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_engine.get("anomaly"), Some(&2));
        assert_eq!(stats.by_engine.get("rule"), Some(&1));
        assert_eq!(stats.by_severity.get("5"), Some(&2));
        assert_eq!(stats.by_severity.get("3"), Some(&1));
    }

    #[test]
    fn test_attack_details_sorted_by_count() {
        let store = store();
        store.ingest(&full_alert("anomaly", "DDoS", 5, "10.0.0.1"));
        store.ingest(&full_alert("anomaly", "DDoS", 4, "10.0.0.2"));
        store.ingest(&full_alert("anomaly", "DDoS", 5, "10.0.0.1"));
        store.ingest(&full_alert("rule", "LFI", 3, "10.0.0.9"));

        let details = store.attack_details();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].attack_type, "DDoS");
        assert_eq!(details[0].count, 3);
        assert_eq!(details[0].severity_distribution[4], 2); // two sev-5
        assert_eq!(details[0].severity_distribution[3], 1); // one sev-4
        assert_eq!(details[0].unique_sources, 2);
        assert_eq!(details[0].unique_targets, 1);
        assert_eq!(details[0].protocols.get("UDP"), Some(&3));
        assert!((details[0].avg_confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_by_attack_type_newest_first() {
        let store = store();
        store.ingest(&full_alert("anomaly", "DDoS", 5, "10.0.0.1"));
        store.ingest(&full_alert("rule", "LFI", 3, "10.0.0.2"));
        store.ingest(&full_alert("anomaly", "DDoS", 4, "10.0.0.3"));

        let records = store.by_attack_type("DDoS");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].alert_id, 3);
        assert_eq!(records[1].alert_id, 1);
        assert!(store.by_attack_type("Nope").is_empty());
    }

    #[test]
    fn test_round_trip_preserves_declared_fields() {
        let store = store();
        let input = full_alert("anomaly", "DDoS", 5, "192.168.31.41");
        store.ingest(&input);

        let (_, page) = store.list(None, None);
        let stored = &page[0];
        assert_eq!(stored.engine, input["engine"]);
        assert_eq!(stored.timestamp, input["timestamp"]);
        assert_eq!(stored.attack_type, input["attack_type"]);
        assert_eq!(u64::from(stored.severity), input["severity"].as_u64().unwrap());
        assert_eq!(stored.session, input["session"]);
        assert_eq!(stored.src_ip, input["src_ip"]);
        assert_eq!(u64::from(stored.src_port), input["src_port"].as_u64().unwrap());
        assert_eq!(stored.protocol, input["protocol"]);
    }

    #[test]
    fn test_log_file_one_json_line_per_alert() {
        let dir = tempfile::tempdir().unwrap();
        let store = AlertStore::new(dir.path());
        store.ingest(&full_alert("rule", "LFI", 3, "10.0.0.1"));
        store.ingest(&full_alert("anomaly", "DDoS", 5, "10.0.0.2"));

        let raw = std::fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: AlertRecord = serde_json::from_str(line).unwrap();
            assert!(parsed.alert_id >= 1);
        }
    }
}
