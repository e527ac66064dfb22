//! # Hybrid IDS Core
//!
//! Dual-engine network intrusion detection: a declarative rule engine and
//! a trained anomaly model run side by side over the same per-flow
//! feature stream, and both feed a central alert gateway.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod alert;
pub mod anomaly;
pub mod capture;
pub mod decode;
pub mod detection;
pub mod error;
pub mod flow;
pub mod model;
pub mod rules;
pub mod types;
pub mod utils;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::alert::AlertSink;
use crate::anomaly::{AnomalyDetector, Thresholds};
use crate::capture::{FileReplay, PacketCapture, SimulatedCapture};
use crate::detection::DetectionEngine;
use crate::error::Result;
use crate::model::ModelBundle;
use crate::rules::{OverlayFilter, RuleSet};
use crate::types::{AlertEnvelope, DecodedPacket, EngineConfig, EngineStats};

use sysinfo::System;

/// The detection service: owns configuration, shared statistics and the
/// shutdown token, and supervises the capture/detection/alert tasks.
pub struct HybridIds {
    config: Arc<EngineConfig>,
    stats: Arc<parking_lot::RwLock<EngineStats>>,
    alert_sender: broadcast::Sender<AlertEnvelope>,
    // Keep one receiver alive so sends never fail spuriously.
    _alert_receiver: broadcast::Receiver<AlertEnvelope>,
    shutdown_token: CancellationToken,
}

impl HybridIds {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let (alert_sender, alert_receiver) = broadcast::channel(1000);
        Ok(Self {
            config: Arc::new(config),
            stats: Arc::new(parking_lot::RwLock::new(EngineStats::new())),
            alert_sender,
            _alert_receiver: alert_receiver,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Load all artifacts and spawn the pipeline tasks. Load failures are
    /// fatal; everything after this call is self-healing.
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting hybrid IDS");

        let rules = RuleSet::load(&self.config.rules_path)?;
        let overlay = OverlayFilter::new(
            self.config.blocked_ips_path.clone(),
            self.config.trusted_ips_path.clone(),
        );

        let anomaly = match &self.config.model_dir {
            Some(dir) => {
                let bundle = ModelBundle::load(dir)?;
                let thresholds = Thresholds {
                    min_attack_confidence: self.config.min_attack_confidence,
                    real_score_threshold: self.config.real_score_threshold,
                };
                Some(AnomalyDetector::new(bundle, thresholds))
            }
            None => {
                info!("No model directory configured, anomaly engine disabled");
                None
            }
        };

        let sink = AlertSink::new(&self.config)?;

        let (packet_tx, packet_rx) = mpsc::channel::<DecodedPacket>(10_000);
        let (alert_tx, alert_rx) = mpsc::channel::<AlertEnvelope>(1_000);

        self.spawn_capture(packet_tx);
        self.spawn_detection(rules, overlay, anomaly, alert_tx, packet_rx);
        self.spawn_alert_delivery(sink, alert_rx);
        self.spawn_stats_monitor();
        self.spawn_system_updater();

        if let Some(secs) = self.config.duration_secs {
            let token = self.shutdown_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
                info!("Configured duration of {}s elapsed, shutting down", secs);
                token.cancel();
            });
        }

        info!("Hybrid IDS started, all tasks spawned");
        Ok(())
    }

    fn spawn_capture(&self, packet_tx: mpsc::Sender<DecodedPacket>) {
        let config = Arc::clone(&self.config);
        let stats = Arc::clone(&self.stats);
        let token = self.shutdown_token.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                r = run_capture(&config, packet_tx, Arc::clone(&stats)) => r,
                _ = token.cancelled() => {
                    info!("Capture shutting down via cancellation token");
                    Ok(())
                }
            };
            if let Err(e) = result {
                error!("Capture failed: {}", e);
            }
            // A finished capture source (file replay end, fatal capture
            // error) ends the whole run once the queue drains.
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            token.cancel();
        });
    }

    fn spawn_detection(
        &self,
        rules: RuleSet,
        overlay: OverlayFilter,
        anomaly: Option<AnomalyDetector>,
        alert_tx: mpsc::Sender<AlertEnvelope>,
        packet_rx: mpsc::Receiver<DecodedPacket>,
    ) {
        let stats = Arc::clone(&self.stats);
        let broadcast_tx = self.alert_sender.clone();
        let token = self.shutdown_token.clone();

        let engine = DetectionEngine::new(rules, overlay, anomaly, alert_tx, broadcast_tx, stats);
        tokio::spawn(async move {
            tokio::select! {
                result = engine.run(packet_rx) => {
                    if let Err(e) = result {
                        error!("Detection engine failed: {}", e);
                    }
                }
                _ = token.cancelled() => {
                    info!("Detection engine shutting down via cancellation token");
                }
            }
        });
    }

    fn spawn_alert_delivery(&self, sink: AlertSink, mut alert_rx: mpsc::Receiver<AlertEnvelope>) {
        let stats = Arc::clone(&self.stats);
        let token = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                let alert = tokio::select! {
                    a = alert_rx.recv() => a,
                    _ = token.cancelled() => {
                        info!("Alert delivery shutting down via cancellation token");
                        break;
                    }
                };
                let Some(alert) = alert else { break };
                sink.deliver(&alert).await;

                let mut s = stats.write();
                s.alerts_sent = sink.sent();
                s.alerts_failed = sink.failed();
            }
        });
    }

    fn spawn_stats_monitor(&self) {
        let stats = Arc::clone(&self.stats);
        let token = self.shutdown_token.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let s = stats.read();
                        info!(
                            "STATS: packets={}, matched={}, flows={}, rate={:.2} pps, sent={}, failed={}",
                            s.packets_observed,
                            s.matched_packets,
                            s.active_flows,
                            s.processing_rate,
                            s.alerts_sent,
                            s.alerts_failed
                        );
                    }
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    /// Per-process cpu/memory gauges via sysinfo, refreshed every 2 s.
    fn spawn_system_updater(&self) {
        let stats = Arc::clone(&self.stats);
        let token = self.shutdown_token.clone();

        tokio::spawn(async move {
            let mut sys = System::new_all();
            let Ok(pid) = sysinfo::get_current_pid() else {
                return;
            };
            sys.refresh_process(pid);

            let mut interval = tokio::time::interval(std::time::Duration::from_secs(2));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        sys.refresh_process(pid);
                        sys.refresh_memory();
                        let cpu = sys.process(pid).map(|p| p.cpu_usage()).unwrap_or(0.0);
                        let mem = sys.used_memory();
                        let mut s = stats.write();
                        s.cpu_usage = cpu;
                        s.memory_usage = mem;
                    }
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown_token.cancel();
    }

    /// Resolve when the engine has been asked to stop (duration elapsed,
    /// capture source exhausted, or an explicit `shutdown` call).
    pub async fn run_until_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    pub fn get_stats(&self) -> EngineStats {
        self.stats.read().clone()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEnvelope> {
        self.alert_sender.subscribe()
    }
}

async fn run_capture(
    config: &EngineConfig,
    packet_tx: mpsc::Sender<DecodedPacket>,
    stats: Arc<parking_lot::RwLock<EngineStats>>,
) -> Result<()> {
    if config.use_simulation {
        info!("Starting simulated capture");
        return SimulatedCapture::run(packet_tx, stats).await;
    }

    if config.pcap_path.is_some() {
        return FileReplay::new(config)?.run(packet_tx, stats).await;
    }

    match PacketCapture::new(config) {
        Ok(capture) => capture.run(packet_tx, stats).await,
        Err(e) => {
            // Live capture usually fails for lack of privileges; the
            // simulated source keeps the rest of the pipeline alive.
            tracing::warn!("Live capture unavailable ({}), falling back to simulation", e);
            SimulatedCapture::run(packet_tx, stats).await
        }
    }
}
