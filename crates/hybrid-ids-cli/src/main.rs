//! Command-line detector: runs the dual-engine pipeline against a live
//! interface, a stored capture, or the synthetic traffic source.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use colored::*;
use hybrid_ids_core::types::{AlertEnvelope, EngineConfig};
use hybrid_ids_core::utils::format_bytes;
use hybrid_ids_core::HybridIds;
use tracing::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Live,
    Pcap,
}

#[derive(Parser)]
#[command(name = "hybrid-ids")]
#[command(about = "Dual-engine network intrusion detection (rules + anomaly model)")]
#[command(version)]
struct Cli {
    /// Capture mode.
    #[arg(long, value_enum, default_value = "live")]
    mode: Mode,

    /// Network interface (live mode).
    #[arg(short, long, default_value = "eth0")]
    interface: String,

    /// Capture file to replay (pcap mode).
    #[arg(short = 'r', long)]
    pcap: Option<PathBuf>,

    /// Rule file, JSON array of rule descriptors.
    #[arg(short = 'R', long)]
    rules: PathBuf,

    /// Directory with the anomaly model artifacts. Omit to run the rule
    /// engine alone.
    #[arg(short = 'm', long)]
    model_dir: Option<PathBuf>,

    /// BPF capture filter, e.g. "tcp port 80".
    #[arg(long)]
    bpf: Option<String>,

    /// Stop after this many seconds.
    #[arg(short, long)]
    duration: Option<u64>,

    /// Per-packet delay when replaying a capture file, seconds.
    #[arg(long, default_value_t = 0.0)]
    replay_delay: f64,

    /// Generate synthetic traffic instead of capturing.
    #[arg(long)]
    simulate: bool,

    /// Alert gateway ingest URL (overrides ALERT_API_URL).
    #[arg(long)]
    gateway_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::from_env();
    config.interface = cli.interface;
    config.bpf_filter = cli.bpf;
    config.rules_path = cli.rules;
    config.model_dir = cli.model_dir;
    config.duration_secs = cli.duration;
    config.replay_delay = cli.replay_delay;
    config.use_simulation = cli.simulate;
    if let Some(url) = cli.gateway_url {
        config.gateway_url = url;
    }
    if cli.mode == Mode::Pcap {
        config.pcap_path = Some(
            cli.pcap
                .ok_or_else(|| anyhow::anyhow!("--pcap is required in pcap mode"))?,
        );
    }

    let mut ids = HybridIds::new(config)?;

    // Console rendering of alerts from both engines.
    let mut alert_rx = ids.subscribe_alerts();
    tokio::spawn(async move {
        while let Ok(alert) = alert_rx.recv().await {
            print_alert(&alert);
        }
    });

    // Load failures surface here and exit non-zero.
    ids.start().await?;

    tokio::select! {
        _ = ids.run_until_shutdown() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\n{}", "Interrupted, shutting down...".yellow());
            ids.shutdown();
        }
    }

    // Give in-flight deliveries a moment to settle.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    print_summary(&ids);

    Ok(())
}

fn print_alert(alert: &AlertEnvelope) {
    let severity = match alert.severity {
        5 => format!("sev={}", alert.severity).bright_red().bold(),
        4 => format!("sev={}", alert.severity).red(),
        3 => format!("sev={}", alert.severity).yellow(),
        _ => format!("sev={}", alert.severity).white(),
    };
    let engine = if alert.engine == "rule" {
        alert.engine.bright_blue()
    } else {
        alert.engine.bright_magenta()
    };
    println!(
        "{} [{}][{}] {} | {} | confidence={:.2}",
        "ALERT".bright_red().bold(),
        engine,
        severity,
        alert.attack_type.bright_white().bold(),
        alert.session.bright_cyan(),
        alert.confidence.unwrap_or(0.0)
    );
}

fn print_summary(ids: &HybridIds) {
    let stats = ids.get_stats();

    println!("\n{}", "========= detection statistics =========".bright_cyan());
    println!("Packets observed:   {}", stats.packets_observed.to_string().bright_white());
    println!("Packets with hits:  {}", stats.matched_packets.to_string().bright_white());
    println!("Decode skips:       {}", stats.feature_extract_skipped);
    println!("Short-flow skips:   {}", stats.short_sequence_skipped);
    println!("Alerts delivered:   {}", stats.alerts_sent.to_string().bright_green());
    println!("Alerts failed:      {}", stats.alerts_failed.to_string().bright_red());
    println!("Memory usage:       {}", format_bytes(stats.memory_usage));

    if !stats.alerts_per_rule.is_empty() {
        println!("\n{}", "Hits per rule SID:".bright_cyan());
        let mut sids: Vec<_> = stats.alerts_per_rule.iter().collect();
        sids.sort_by_key(|(sid, _)| **sid);
        for (sid, count) in sids {
            println!("  SID {}: {} hits", sid.to_string().bright_white(), count);
        }
    }
}
