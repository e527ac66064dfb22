//! Detection loop: drives both engines over the decoded packet stream.
//!
//! Owns the flow table exclusively; no other task touches it. Every
//! fault below load time is contained here so the capture loop never
//! stops.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::anomaly::{AnomalyDetector, MIN_PACKETS_FOR_DETECTION};
use crate::error::Result;
use crate::flow::FlowTable;
use crate::rules::{OverlayFilter, RuleSet};
use crate::types::{AlertEnvelope, DecodedPacket, EngineStats};

/// Seconds between flow table sweeps, measured in packet time.
const SWEEP_INTERVAL_SECS: f64 = 5.0;

pub struct DetectionEngine {
    rules: RuleSet,
    overlay: OverlayFilter,
    anomaly: Option<AnomalyDetector>,
    flows: FlowTable,
    alert_tx: mpsc::Sender<AlertEnvelope>,
    broadcast: broadcast::Sender<AlertEnvelope>,
    stats: Arc<parking_lot::RwLock<EngineStats>>,
    last_sweep: f64,
}

impl DetectionEngine {
    pub fn new(
        rules: RuleSet,
        overlay: OverlayFilter,
        anomaly: Option<AnomalyDetector>,
        alert_tx: mpsc::Sender<AlertEnvelope>,
        broadcast: broadcast::Sender<AlertEnvelope>,
        stats: Arc<parking_lot::RwLock<EngineStats>>,
    ) -> Self {
        Self {
            rules,
            overlay,
            anomaly,
            flows: FlowTable::new(),
            alert_tx,
            broadcast,
            stats,
            last_sweep: 0.0,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<DecodedPacket>) -> Result<()> {
        info!(
            "Detection engine started ({} rules, anomaly={})",
            self.rules.len(),
            self.anomaly.is_some()
        );

        while let Some(pkt) = rx.recv().await {
            self.process(pkt).await;
        }

        info!("Packet stream ended, detection engine stopping");
        Ok(())
    }

    async fn process(&mut self, pkt: DecodedPacket) {
        self.overlay.refresh();
        if self.overlay.should_drop(pkt.src_ip) {
            return;
        }

        self.stats.write().record_packet();

        // Rule engine: every packet, declaration order.
        let hits: Vec<(u32, AlertEnvelope)> = self
            .rules
            .match_packet(&pkt)
            .into_iter()
            .map(|rule| (rule.sid, AlertEnvelope::from_rule_hit(rule, &pkt)))
            .collect();
        if !hits.is_empty() {
            let sids: Vec<u32> = hits.iter().map(|(sid, _)| *sid).collect();
            self.stats.write().record_rule_hits(&sids);
            for (_, envelope) in hits {
                self.emit(envelope).await;
            }
        }

        // Anomaly engine: IPv4 flows only.
        if pkt.ipv6 {
            return;
        }
        let now = pkt.timestamp;
        let (key, features, flow) = self.flows.observe(&pkt, now);

        if let Some(detector) = &self.anomaly {
            if detector.should_run(&flow) {
                self.flows.mark_detected(&key);
                match detector.evaluate(&flow, &features) {
                    Ok(eval) if eval.verdict.is_attack() => {
                        let envelope = AlertEnvelope::from_anomaly(&flow, &eval);
                        self.emit(envelope).await;
                    }
                    Ok(eval) => {
                        info!(
                            "[DECISION][benign] {} | confidence=0.00 | severity=0 | real_score={:.3}",
                            flow.session(),
                            eval.real_score
                        );
                    }
                    Err(e) => {
                        error!("Inference failed for {}: {}", flow.session(), e);
                    }
                }
            } else if flow.total_packets() < MIN_PACKETS_FOR_DETECTION {
                self.stats.write().short_sequence_skipped += 1;
            }
        }

        if now - self.last_sweep > SWEEP_INTERVAL_SECS {
            let removed = self.flows.sweep(now);
            if removed > 0 {
                debug!("Swept {} idle flows, {} active", removed, self.flows.len());
            }
            self.last_sweep = now;
        }
        self.stats.write().active_flows = self.flows.len() as u32;
    }

    async fn emit(&self, alert: AlertEnvelope) {
        // In-process subscribers (console printers) are best-effort.
        let _ = self.broadcast.send(alert.clone());

        if let Err(e) = self.alert_tx.send(alert).await {
            warn!("Alert channel closed, dropping alert: {}", e);
        }
    }
}
