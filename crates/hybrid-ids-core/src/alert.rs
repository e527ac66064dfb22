//! Decision-to-alert layer: envelope construction, the detector-side
//! append-only log, and the bounded-latency POST to the alert gateway.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Local;
use tracing::{info, warn};

use crate::anomaly::Evaluation;
use crate::error::{IdsError, Result};
use crate::flow::FlowStats;
use crate::rules::Rule;
use crate::types::{AlertEnvelope, DecodedPacket, EngineConfig};

/// Hex preview: first 512 payload bytes, truncated to 200 hex chars.
pub fn hex_preview(payload: &[u8]) -> String {
    let mut hex = String::with_capacity(512);
    for byte in payload.iter().take(512) {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex.truncate(200);
    hex
}

/// Local wall-clock timestamp in the envelope format.
pub fn local_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl AlertEnvelope {
    /// Envelope for one rule hit.
    pub fn from_rule_hit(rule: &Rule, pkt: &DecodedPacket) -> Self {
        Self {
            engine: "rule".to_string(),
            timestamp: local_timestamp(),
            attack_type: rule.msg.clone(),
            severity: rule.severity,
            confidence: None,
            message: rule.msg.clone(),
            session: pkt.session(),
            src_ip: pkt.src_ip.to_string(),
            dst_ip: pkt.dst_ip.to_string(),
            src_port: pkt.src_port,
            dst_port: pkt.dst_port,
            protocol: pkt.protocol.name().to_string(),
            tags: if rule.tags.is_empty() {
                None
            } else {
                Some(rule.tags.clone())
            },
            payload_preview: Some(hex_preview(&pkt.payload)),
            real_score: None,
        }
    }

    /// Envelope for one anomaly verdict. Endpoints come from the flow's
    /// original orientation, not the canonical key.
    pub fn from_anomaly(flow: &FlowStats, eval: &Evaluation) -> Self {
        let attack_type = eval.verdict.attack_type().to_string();
        let confidence = f64::from(eval.verdict.confidence());
        let message = format!(
            "{} detected on {} flow ({:.0} pkt/s, real_score={:.3})",
            attack_type,
            flow.protocol.name(),
            flow.packets_per_second(),
            eval.real_score
        );
        Self {
            engine: "anomaly".to_string(),
            timestamp: local_timestamp(),
            attack_type,
            severity: eval.severity,
            confidence: Some(confidence),
            message,
            session: flow.session(),
            src_ip: flow.src_ip.to_string(),
            dst_ip: flow.dst_ip.to_string(),
            src_port: flow.src_port,
            dst_port: flow.dst_port,
            protocol: flow.protocol.name().to_string(),
            tags: None,
            payload_preview: None,
            real_score: Some(f64::from(eval.real_score)),
        }
    }
}

/// Delivers alerts: local JSONL log first, then one POST per alert with
/// a fixed timeout and no retry. Failures never block the pipeline.
pub struct AlertSink {
    client: reqwest::Client,
    gateway_url: String,
    log_path: PathBuf,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl AlertSink {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs_f64(config.alert_timeout_secs))
            .build()
            .map_err(|e| IdsError::AlertDelivery(e.to_string()))?;

        Ok(Self {
            client,
            gateway_url: config.gateway_url.clone(),
            log_path: config.alert_log_path.clone(),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Deliver one alert. Returns whether the gateway accepted it.
    pub async fn deliver(&self, alert: &AlertEnvelope) -> bool {
        // The local log is kept regardless of delivery outcome.
        if let Err(e) = self.append_local(alert) {
            warn!("Failed to append local alert log: {}", e);
        }

        info!(
            "[ALERT][{}][sev={}] {} | {} | confidence={:.2}",
            alert.engine,
            alert.severity,
            alert.attack_type,
            alert.session,
            alert.confidence.unwrap_or(0.0)
        );

        match self.client.post(&self.gateway_url).json(alert).send().await {
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 202 => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(resp) => {
                warn!("Gateway rejected alert: HTTP {}", resp.status());
                self.failed.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(e) => {
                warn!("Alert delivery failed: {}", e);
                self.failed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn append_local(&self, alert: &AlertEnvelope) -> std::io::Result<()> {
        let line = serde_json::to_string(alert)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", line)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::Verdict;
    use crate::types::Protocol;

    #[test]
    fn test_hex_preview_truncation() {
        let payload = vec![0xabu8; 600];
        let preview = hex_preview(&payload);
        assert_eq!(preview.len(), 200);
        assert!(preview.starts_with("abab"));

        assert_eq!(hex_preview(b"\x01\x02"), "0102");
        assert_eq!(hex_preview(b""), "");
    }

    #[test]
    fn test_rule_envelope_shape() {
        let rules = crate::rules::RuleSet::from_json(
            r#"[{"sid": 1, "msg": "LFI attempt", "dst_port": 80,
                 "content": "/etc/passwd", "severity": 4, "tags": ["lfi"]}]"#,
        )
        .unwrap();
        let pkt = DecodedPacket {
            src_ip: "192.168.1.10".parse().unwrap(),
            dst_ip: "192.168.1.100".parse().unwrap(),
            src_port: 12345,
            dst_port: 80,
            protocol: Protocol::Tcp,
            payload: b"GET /etc/passwd HTTP/1.1\r\n".to_vec(),
            ipv6: false,
            timestamp: 0.0,
            wire_len: 80,
        };
        let envelope = AlertEnvelope::from_rule_hit(&rules.rules()[0], &pkt);

        assert_eq!(envelope.engine, "rule");
        assert_eq!(envelope.attack_type, "LFI attempt");
        assert_eq!(envelope.severity, 4);
        assert_eq!(envelope.session, "192.168.1.10:12345 -> 192.168.1.100:80");
        assert_eq!(envelope.protocol, "TCP");
        assert_eq!(envelope.tags.as_deref(), Some(&["lfi".to_string()][..]));
        assert!(envelope.payload_preview.as_deref().unwrap().len() <= 200);
        assert!(envelope.real_score.is_none());

        // Wire shape: optional absent fields stay off the wire.
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("confidence").is_none());
        assert!(json.get("real_score").is_none());
        assert_eq!(json["engine"], "rule");
    }

    #[test]
    fn test_anomaly_envelope_shape() {
        let mut table = crate::flow::FlowTable::new();
        let pkt = DecodedPacket {
            src_ip: "203.0.113.9".parse().unwrap(),
            dst_ip: "192.168.1.100".parse().unwrap(),
            src_port: 50000,
            dst_port: 80,
            protocol: Protocol::Udp,
            payload: vec![0u8; 1024],
            ipv6: false,
            timestamp: 1.0,
            wire_len: 1066,
        };
        let (_, _, flow) = table.observe(&pkt, 1.0);

        let eval = Evaluation {
            verdict: Verdict::KnownAttack {
                label: "DDoS".to_string(),
                confidence: 0.95,
            },
            severity: 5,
            real_score: -0.02,
        };
        let envelope = AlertEnvelope::from_anomaly(&flow, &eval);

        assert_eq!(envelope.engine, "anomaly");
        assert_eq!(envelope.attack_type, "DDoS");
        assert_eq!(envelope.severity, 5);
        assert_eq!(envelope.src_ip, "203.0.113.9");
        assert_eq!(envelope.src_port, 50000);
        assert_eq!(envelope.protocol, "UDP");
        assert!((envelope.confidence.unwrap() - 0.95).abs() < 1e-6);
        assert!((envelope.real_score.unwrap() + 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_timestamp_format() {
        let ts = local_timestamp();
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], " ");
        assert_eq!(&ts[13..14], ":");
    }
}
