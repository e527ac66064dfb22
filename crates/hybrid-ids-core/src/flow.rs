//! Bidirectional flow tracking and feature extraction.
//!
//! The flow table is an owned value driven by the detection loop; nothing
//! else mutates it. Keys canonicalize the 5-tuple so both directions of a
//! conversation land on the same entry.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::types::{DecodedPacket, Protocol};

/// Idle flows older than this are removed by `sweep`.
pub const FLOW_TIMEOUT_SECS: f64 = 60.0;

/// Number of entries in the feature vector.
pub const FEATURE_DIM: usize = 16;

pub type FeatureVector = [f32; FEATURE_DIM];

/// Canonicalized 5-tuple. The endpoint with the lexicographically smaller
/// (ip, port) pair is stored first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub ip_low: IpAddr,
    pub port_low: u16,
    pub ip_high: IpAddr,
    pub port_high: u16,
    pub protocol: Protocol,
}

impl FlowKey {
    pub fn canonical(
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        protocol: Protocol,
    ) -> Self {
        if (src_ip, src_port) <= (dst_ip, dst_port) {
            Self {
                ip_low: src_ip,
                port_low: src_port,
                ip_high: dst_ip,
                port_high: dst_port,
                protocol,
            }
        } else {
            Self {
                ip_low: dst_ip,
                port_low: dst_port,
                ip_high: src_ip,
                port_high: src_port,
                protocol,
            }
        }
    }
}

/// Per-direction packet counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirStats {
    pub packets: u64,
    pub bytes: u64,
    pub len_min: u32,
    pub len_max: u32,
    pub len_sum: u64,
    /// Timestamp of the previous packet in this direction.
    prev_time: Option<f64>,
    /// Accumulated inter-arrival gaps, seconds.
    iat_sum: f64,
}

impl DirStats {
    fn record(&mut self, len: u32, now: f64) {
        if self.packets == 0 {
            self.len_min = len;
            self.len_max = len;
        } else {
            self.len_min = self.len_min.min(len);
            self.len_max = self.len_max.max(len);
        }
        if let Some(prev) = self.prev_time {
            let gap = now - prev;
            if gap > 0.0 {
                self.iat_sum += gap;
            }
        }
        self.prev_time = Some(now);
        self.packets += 1;
        self.bytes += u64::from(len);
        self.len_sum += u64::from(len);
    }

    pub fn mean_len(&self) -> f32 {
        self.len_sum as f32 / self.packets.max(1) as f32
    }

    /// Mean inter-arrival gap in microseconds. The first packet of a
    /// direction contributes no gap.
    pub fn mean_iat_us(&self) -> f32 {
        let gaps = self.packets.saturating_sub(1).max(1);
        (self.iat_sum * 1e6) as f32 / gaps as f32
    }
}

/// Mutable state for one tracked flow.
///
/// `src_*`/`dst_*` preserve the first observed packet's orientation and
/// are used for display and alert reporting only, never for keying.
#[derive(Debug, Clone)]
pub struct FlowStats {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub start_time: f64,
    pub last_time: f64,
    pub fwd: DirStats,
    pub bwd: DirStats,
    /// Total packet count at the last anomaly evaluation.
    pub last_detect_packets: u64,
}

impl FlowStats {
    fn new(pkt: &DecodedPacket) -> Self {
        Self {
            src_ip: pkt.src_ip,
            src_port: pkt.src_port,
            dst_ip: pkt.dst_ip,
            dst_port: pkt.dst_port,
            protocol: pkt.protocol,
            start_time: pkt.timestamp,
            last_time: pkt.timestamp,
            fwd: DirStats::default(),
            bwd: DirStats::default(),
            last_detect_packets: 0,
        }
    }

    fn update(&mut self, pkt: &DecodedPacket, now: f64) {
        let forward = (pkt.src_ip, pkt.src_port) == (self.src_ip, self.src_port)
            && (pkt.dst_ip, pkt.dst_port) == (self.dst_ip, self.dst_port);
        let dir = if forward { &mut self.fwd } else { &mut self.bwd };
        dir.record(pkt.wire_len as u32, now);
        if now > self.last_time {
            self.last_time = now;
        }
    }

    pub fn total_packets(&self) -> u64 {
        self.fwd.packets + self.bwd.packets
    }

    pub fn total_bytes(&self) -> u64 {
        self.fwd.bytes + self.bwd.bytes
    }

    /// Flow duration in seconds, clamped to one microsecond.
    pub fn duration_secs(&self) -> f64 {
        (self.last_time - self.start_time).max(1e-6)
    }

    pub fn packets_per_second(&self) -> f32 {
        (self.total_packets() as f64 / self.duration_secs()) as f32
    }

    pub fn bytes_per_second(&self) -> f32 {
        (self.total_bytes() as f64 / self.duration_secs()) as f32
    }

    /// Exactly one direction has seen traffic.
    pub fn one_way(&self) -> bool {
        (self.fwd.packets == 0) != (self.bwd.packets == 0)
    }

    pub fn session(&self) -> String {
        format!(
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Compute the 16-dimension feature vector for a flow's current state.
///
/// This is the sole source of feature vectors for both engines. Order:
/// dst port, duration (µs), fwd/bwd packets, fwd/bwd bytes, fwd len
/// max/min/mean, bwd len max/min/mean, bytes/s, packets/s, fwd/bwd mean
/// inter-arrival (µs). Directions with no packets report zeros.
pub fn extract_features(flow: &FlowStats) -> FeatureVector {
    let duration_s = flow.duration_secs();
    let duration_us = (duration_s * 1e6) as f32;

    let fwd_mean = if flow.fwd.packets > 0 { flow.fwd.mean_len() } else { 0.0 };
    let bwd_mean = if flow.bwd.packets > 0 { flow.bwd.mean_len() } else { 0.0 };
    let fwd_iat = if flow.fwd.packets > 1 { flow.fwd.mean_iat_us() } else { 0.0 };
    let bwd_iat = if flow.bwd.packets > 1 { flow.bwd.mean_iat_us() } else { 0.0 };

    [
        f32::from(flow.dst_port),
        duration_us,
        flow.fwd.packets as f32,
        flow.bwd.packets as f32,
        flow.fwd.bytes as f32,
        flow.bwd.bytes as f32,
        flow.fwd.len_max as f32,
        flow.fwd.len_min as f32,
        fwd_mean,
        flow.bwd.len_max as f32,
        flow.bwd.len_min as f32,
        bwd_mean,
        (flow.total_bytes() as f64 / duration_s) as f32,
        (flow.total_packets() as f64 / duration_s) as f32,
        fwd_iat,
        bwd_iat,
    ]
}

/// Table of live flows, owned by the detection loop.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: HashMap<FlowKey, FlowStats>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one packet: create the flow if absent, update the correct
    /// direction, and return the key, the current feature vector and a
    /// snapshot of the flow state.
    pub fn observe(&mut self, pkt: &DecodedPacket, now: f64) -> (FlowKey, FeatureVector, FlowStats) {
        let key = FlowKey::canonical(
            pkt.src_ip,
            pkt.src_port,
            pkt.dst_ip,
            pkt.dst_port,
            pkt.protocol,
        );
        let flow = self.flows.entry(key).or_insert_with(|| FlowStats::new(pkt));
        flow.update(pkt, now);
        let snapshot = flow.clone();
        let features = extract_features(&snapshot);
        (key, features, snapshot)
    }

    /// Note that the anomaly detector just evaluated this flow.
    pub fn mark_detected(&mut self, key: &FlowKey) {
        if let Some(flow) = self.flows.get_mut(key) {
            flow.last_detect_packets = flow.total_packets();
        }
    }

    /// Remove flows idle longer than `FLOW_TIMEOUT_SECS`. Returns the
    /// number of removed entries. A flow exactly at the boundary stays.
    pub fn sweep(&mut self, now: f64) -> usize {
        let before = self.flows.len();
        self.flows.retain(|_, flow| now - flow.last_time <= FLOW_TIMEOUT_SECS);
        before - self.flows.len()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
