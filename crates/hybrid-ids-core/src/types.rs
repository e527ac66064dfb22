//! Core data types shared across the detection pipeline.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engine configuration.
///
/// Populated from CLI flags with environment overrides (`ALERT_API_URL`,
/// `ALERT_API_TIMEOUT`, `MIN_ATTACK_CONFIDENCE`, `REAL_SCORE_THRESHOLD`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Network interface to monitor (live mode).
    pub interface: String,
    /// Optional BPF capture filter.
    pub bpf_filter: Option<String>,
    /// Capture file to replay instead of a live interface.
    pub pcap_path: Option<PathBuf>,
    /// Per-packet delay when replaying a capture file, seconds.
    pub replay_delay: f64,
    /// Rule file (JSON array of rule descriptors).
    pub rules_path: PathBuf,
    /// Directory holding the anomaly model artifacts. `None` disables
    /// the anomaly engine.
    pub model_dir: Option<PathBuf>,
    /// Alert gateway ingest endpoint.
    pub gateway_url: String,
    /// Per-POST delivery timeout, seconds.
    pub alert_timeout_secs: f64,
    /// Detector-side append-only alert log.
    pub alert_log_path: PathBuf,
    /// Blocked source list, re-read at most every 3 s.
    pub blocked_ips_path: PathBuf,
    /// Trusted source list, unioned with detected local addresses.
    pub trusted_ips_path: PathBuf,
    pub min_attack_confidence: f32,
    pub real_score_threshold: f32,
    /// Stop capturing after this many seconds.
    pub duration_secs: Option<u64>,
    /// Generate synthetic traffic instead of capturing.
    pub use_simulation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            bpf_filter: None,
            pcap_path: None,
            replay_delay: 0.0,
            rules_path: PathBuf::from("rules.json"),
            model_dir: None,
            gateway_url: "http://127.0.0.1:5000/alerts".to_string(),
            alert_timeout_secs: 3.0,
            alert_log_path: PathBuf::from("alerts.log"),
            blocked_ips_path: PathBuf::from("blocked_ips.json"),
            trusted_ips_path: PathBuf::from("trusted_ips.json"),
            min_attack_confidence: 0.5,
            real_score_threshold: -0.05,
            duration_secs: None,
            use_simulation: false,
        }
    }
}

impl EngineConfig {
    /// Apply recognized environment variables on top of the defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(url) = std::env::var("ALERT_API_URL") {
            cfg.gateway_url = url;
        }
        if let Ok(t) = std::env::var("ALERT_API_TIMEOUT") {
            if let Ok(secs) = t.parse::<f64>() {
                cfg.alert_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("MIN_ATTACK_CONFIDENCE") {
            if let Ok(c) = v.parse::<f32>() {
                cfg.min_attack_confidence = c;
            }
        }
        if let Ok(v) = std::env::var("REAL_SCORE_THRESHOLD") {
            if let Ok(c) = v.parse::<f32>() {
                cfg.real_score_threshold = c;
            }
        }
        cfg
    }
}

/// Transport protocols tracked by the flow table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One decoded IP packet as consumed by both engines.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    /// Transport payload bytes.
    pub payload: Vec<u8>,
    /// IPv6 frames are rule-matched but never flow-tracked.
    pub ipv6: bool,
    /// Capture timestamp, seconds since the Unix epoch.
    pub timestamp: f64,
    /// On-wire length from the capture header.
    pub wire_len: usize,
}

impl DecodedPacket {
    pub fn session(&self) -> String {
        format!(
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Canonical alert shape shared by both engines and the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEnvelope {
    /// "rule" or "anomaly".
    pub engine: String,
    /// Local time, `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,
    pub attack_type: String,
    pub severity: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub message: String,
    /// `src_ip:src_port -> dst_ip:dst_port`.
    pub session: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_score: Option<f64>,
}

/// Counters kept by the live engine. Monotonic except the gauges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub start_time: DateTime<Utc>,
    pub packets_observed: u64,
    pub matched_packets: u64,
    pub alerts_per_rule: HashMap<u32, u64>,
    pub feature_extract_skipped: u64,
    pub short_sequence_skipped: u64,
    pub alerts_sent: u64,
    pub alerts_failed: u64,
    pub active_flows: u32,
    pub processing_rate: f32,
    pub cpu_usage: f32,
    pub memory_usage: u64,
    #[serde(skip, default = "std::time::Instant::now")]
    last_rate_calculation: std::time::Instant,
    #[serde(skip, default)]
    last_packet_count: u64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            packets_observed: 0,
            matched_packets: 0,
            alerts_per_rule: HashMap::new(),
            feature_extract_skipped: 0,
            short_sequence_skipped: 0,
            alerts_sent: 0,
            alerts_failed: 0,
            active_flows: 0,
            processing_rate: 0.0,
            cpu_usage: 0.0,
            memory_usage: 0,
            last_rate_calculation: std::time::Instant::now(),
            last_packet_count: 0,
        }
    }

    pub fn record_packet(&mut self) {
        self.packets_observed += 1;

        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last_rate_calculation).as_secs_f32();
        if elapsed >= 1.0 {
            let delta = self.packets_observed - self.last_packet_count;
            self.processing_rate = delta as f32 / elapsed;
            self.last_rate_calculation = now;
            self.last_packet_count = self.packets_observed;
        }
    }

    /// Record one packet's rule hits.
    pub fn record_rule_hits(&mut self, sids: &[u32]) {
        if sids.is_empty() {
            return;
        }
        self.matched_packets += 1;
        for sid in sids {
            *self.alerts_per_rule.entry(*sid).or_insert(0) += 1;
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}
