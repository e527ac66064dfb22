//! Packet capture: live pcap, capture-file replay, and the synthetic
//! traffic generator used for demos and end-to-end testing.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pcap::{Active, Capture, Device};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::decode::{decode_frame, DecodeSkip};
use crate::error::{IdsError, Result};
use crate::types::{DecodedPacket, EngineConfig, EngineStats, Protocol};

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Decode one frame and push it onto the packet channel. The channel is
/// bounded and the capture loop must never block on it, so a full queue
/// drops the packet.
fn forward_frame(
    data: &[u8],
    timestamp: f64,
    tx: &mpsc::Sender<DecodedPacket>,
    stats: &Arc<parking_lot::RwLock<EngineStats>>,
) -> bool {
    match decode_frame(data, timestamp) {
        Ok(pkt) => match tx.try_send(pkt) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Packet queue full, dropping packet");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        },
        Err(skip) => {
            if !matches!(skip, DecodeSkip::NonIp) {
                debug!("Skipping frame: {:?}", skip);
            }
            stats.write().feature_extract_skipped += 1;
            true
        }
    }
}

/// Live capture on a network interface.
pub struct PacketCapture {
    interface: String,
    capture: Option<Capture<Active>>,
}

impl PacketCapture {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let mut instance = Self {
            interface: config.interface.clone(),
            capture: None,
        };
        instance.initialize(config.bpf_filter.as_deref())?;
        Ok(instance)
    }

    fn initialize(&mut self, bpf_filter: Option<&str>) -> Result<()> {
        let devices = Device::list().map_err(|e| IdsError::Capture(e.to_string()))?;
        info!("Found {} network devices", devices.len());

        let device = devices
            .iter()
            .find(|d| d.name == self.interface)
            .or_else(|| {
                warn!(
                    "Interface '{}' not found, looking for alternatives",
                    self.interface
                );
                devices.iter().find(|d| {
                    !d.name.contains("loopback")
                        && !d.name.starts_with("lo")
                        && d.desc
                            .as_deref()
                            .map(|desc| !desc.to_lowercase().contains("loopback"))
                            .unwrap_or(true)
                })
            })
            .cloned()
            .ok_or_else(|| IdsError::Capture("no suitable network interface found".to_string()))?;

        if device.name != self.interface {
            info!("Using alternative interface: {}", device.name);
            self.interface = device.name.clone();
        }

        let capture = Capture::from_device(device)
            .map_err(|e| IdsError::Capture(e.to_string()))?
            .promisc(false)
            .snaplen(1518)
            .timeout(10)
            .buffer_size(2 * 1024 * 1024)
            .open()
            .map_err(|e| IdsError::Capture(e.to_string()))?;

        let mut capture = capture
            .setnonblock()
            .map_err(|e| IdsError::Capture(e.to_string()))?;

        if let Some(filter) = bpf_filter {
            capture
                .filter(filter, true)
                .map_err(|e| IdsError::Capture(format!("bad BPF filter {:?}: {}", filter, e)))?;
        }

        info!("Packet capture initialized on {}", self.interface);
        self.capture = Some(capture);
        Ok(())
    }

    /// Capture loop with bounded error recovery. Ends when the packet
    /// channel closes or errors exceed the tolerance.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<DecodedPacket>,
        stats: Arc<parking_lot::RwLock<EngineStats>>,
    ) -> Result<()> {
        const MAX_ERRORS: u32 = 100;

        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| IdsError::Capture("capture not initialized".to_string()))?;

        let mut packet_count = 0u64;
        let mut error_count = 0u32;

        loop {
            if packet_count % 100 == 0 {
                tokio::task::yield_now().await;
            }

            let frame = match capture.next_packet() {
                Ok(packet) => {
                    error_count = 0;
                    let ts = packet.header.ts;
                    #[allow(clippy::cast_precision_loss)]
                    let timestamp = ts.tv_sec as f64 + ts.tv_usec as f64 / 1e6;
                    Some((packet.data.to_vec(), timestamp))
                }
                Err(pcap::Error::TimeoutExpired) => None,
                Err(e) => {
                    error_count += 1;
                    debug!("Capture error ({}): {}", error_count, e);
                    if error_count >= MAX_ERRORS {
                        error!("Too many capture errors, stopping");
                        return Err(IdsError::Capture("too many capture errors".to_string()));
                    }
                    None
                }
            };

            match frame {
                Some((data, timestamp)) => {
                    packet_count += 1;
                    if !forward_frame(&data, timestamp, &tx, &stats) {
                        info!("Packet channel closed, stopping capture");
                        return Ok(());
                    }
                }
                None => {
                    tokio::time::sleep(Duration::from_micros(100)).await;
                }
            }
        }
    }
}

/// Offline replay of a stored capture file through the same pipeline.
pub struct FileReplay {
    path: std::path::PathBuf,
    replay_delay: f64,
}

impl FileReplay {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let path = config
            .pcap_path
            .clone()
            .ok_or_else(|| IdsError::Capture("no capture file configured".to_string()))?;
        Ok(Self {
            path,
            replay_delay: config.replay_delay,
        })
    }

    pub async fn run(
        self,
        tx: mpsc::Sender<DecodedPacket>,
        stats: Arc<parking_lot::RwLock<EngineStats>>,
    ) -> Result<()> {
        let mut capture = Capture::from_file(&self.path)
            .map_err(|e| IdsError::load(format!("capture file {}", self.path.display()), e))?;

        info!("Replaying capture file {}", self.path.display());
        let mut count = 0u64;

        while let Ok(packet) = capture.next_packet() {
            let ts = packet.header.ts;
            #[allow(clippy::cast_precision_loss)]
            let timestamp = ts.tv_sec as f64 + ts.tv_usec as f64 / 1e6;
            if !forward_frame(packet.data, timestamp, &tx, &stats) {
                break;
            }
            count += 1;
            if self.replay_delay > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(self.replay_delay)).await;
            } else if count % 200 == 0 {
                tokio::task::yield_now().await;
            }
        }

        info!("Replay finished: {} frames", count);
        Ok(())
    }
}

/// Synthetic traffic source: a background mix of ordinary flows plus
/// periodic bursts shaped like the deployed attack generator, fed
/// through the identical detection path.
pub struct SimulatedCapture;

impl SimulatedCapture {
    pub async fn run(
        tx: mpsc::Sender<DecodedPacket>,
        _stats: Arc<parking_lot::RwLock<EngineStats>>,
    ) -> Result<()> {
        info!("Simulated capture started");
        let mut round = 0u64;

        loop {
            let mut batch = Self::background_batch();
            if round % 10 == 3 {
                batch.extend(Self::attack_burst());
            }
            round += 1;

            for pkt in batch {
                match tx.try_send(pkt) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        info!("Packet channel closed, stopping simulation");
                        return Ok(());
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn background_batch() -> Vec<DecodedPacket> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let now = now_epoch();
        let mut packets = Vec::new();

        let batch_size = rng.gen_range(2..=5);
        for _ in 0..batch_size {
            let src_ip = format!("192.168.1.{}", rng.gen_range(2..=250));
            let dst_ip = if rng.gen_bool(0.6) {
                format!(
                    "{}.{}.{}.{}",
                    rng.gen_range(1..=223),
                    rng.gen_range(0..=255),
                    rng.gen_range(0..=255),
                    rng.gen_range(1..=254)
                )
            } else {
                format!("192.168.1.{}", rng.gen_range(2..=250))
            };
            let dst_port = match rng.gen_range(0..10) {
                0..=3 => 443,
                4..=6 => 80,
                7 => 53,
                8 => 22,
                _ => rng.gen_range(1024..=65535),
            };
            let protocol = if rng.gen_bool(0.7) {
                Protocol::Tcp
            } else {
                Protocol::Udp
            };
            let size = rng.gen_range(64..=1500);

            packets.push(DecodedPacket {
                src_ip: src_ip.parse().unwrap(),
                dst_ip: dst_ip.parse().unwrap(),
                src_port: rng.gen_range(1024..=65535),
                dst_port,
                protocol,
                payload: vec![0u8; rng.gen_range(0..=128)],
                ipv6: false,
                timestamp: now,
                wire_len: size,
            });
        }
        packets
    }

    /// One burst in the shape of the deployed attack generator.
    fn attack_burst() -> Vec<DecodedPacket> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let now = now_epoch();
        let target: std::net::IpAddr = "192.168.1.100".parse().unwrap();
        let attacker: std::net::IpAddr = format!(
            "{}.{}.{}.{}",
            rng.gen_range(1..=223),
            rng.gen_range(0..=255),
            rng.gen_range(0..=255),
            rng.gen_range(1..=254)
        )
        .parse()
        .unwrap();
        let mut packets = Vec::new();

        let mut push = |src_port: u16, dst_port: u16, protocol: Protocol, payload: Vec<u8>| {
            packets.push(DecodedPacket {
                src_ip: attacker,
                dst_ip: target,
                src_port,
                dst_port,
                protocol,
                wire_len: payload.len() + 42,
                payload,
                ipv6: false,
                timestamp: now,
            });
        };

        match rng.gen_range(0..8) {
            0 => {
                // UDP flood: fixed source port 50000 against port 80.
                for _ in 0..40 {
                    push(50000, 80, Protocol::Udp, (0..1024).map(|_| rng.gen()).collect());
                }
            }
            1 => {
                // TCP SYN flood rotating over source ports 50010-50014.
                for i in 0..40u16 {
                    push(50010 + i % 5, 80, Protocol::Tcp, Vec::new());
                }
            }
            2 => {
                // High-entropy UDP toward unregistered high ports.
                let dst_port = rng.gen_range(45000..45020);
                for _ in 0..rng.gen_range(48..=64) {
                    let payload: Vec<u8> =
                        (0..rng.gen_range(400..=1400)).map(|_| rng.gen()).collect();
                    push(56000, dst_port, Protocol::Udp, payload);
                }
            }
            3 => {
                // Port scan from the generator's fixed source port.
                for dst_port in [21u16, 22, 23, 25, 80, 110, 143, 443, 3306, 3389, 8080] {
                    push(58000, dst_port, Protocol::Tcp, b"SCAN".to_vec());
                }
            }
            4 => {
                // Injection-shaped requests against port 80.
                for _ in 0..32 {
                    push(
                        59000,
                        80,
                        Protocol::Udp,
                        b"GET /?id=1' OR '1'='1 HTTP/1.1\r\n\r\n".to_vec(),
                    );
                }
            }
            5 => {
                // Credential guessing against ssh.
                for i in 0..32u32 {
                    let proto = if i % 2 == 0 { Protocol::Tcp } else { Protocol::Udp };
                    push(60000, 22, proto, format!("user:admin pass:{}", i).into_bytes());
                }
            }
            6 => {
                // Slow probing against https.
                for _ in 0..24 {
                    push(61000, 443, Protocol::Udp, vec![b'A'; rng.gen_range(100..=500)]);
                }
            }
            _ => {
                // Bot-style dns queries.
                for _ in 0..32 {
                    let payload: Vec<u8> =
                        (0..rng.gen_range(50..=200)).map(|_| rng.gen()).collect();
                    push(62000, 53, Protocol::Udp, payload);
                }
            }
        }

        packets
    }
}
