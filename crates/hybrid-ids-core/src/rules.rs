//! Declarative rule engine: JSON rule compilation, ordered matching, and
//! the blocked/trusted source overlays consulted before evaluation.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ipnetwork::IpNetwork;
use regex::bytes::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{IdsError, Result};
use crate::types::{DecodedPacket, Protocol};
use crate::utils;

/// Protocol predicate. The `ip` alias also matches transport traffic so
/// CIDR-only rules apply to tcp and udp packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolPred {
    Any,
    Ip,
    Tcp,
    Udp,
}

impl ProtocolPred {
    fn matches(self, proto: Protocol) -> bool {
        match self {
            ProtocolPred::Any | ProtocolPred::Ip => true,
            ProtocolPred::Tcp => proto == Protocol::Tcp,
            ProtocolPred::Udp => proto == Protocol::Udp,
        }
    }
}

/// Address predicate. A value that looks like a CIDR but fails network
/// parsing degrades to an exact string comparison, so a bad rule value
/// turns into a non-match instead of disabling the rule.
#[derive(Debug, Clone)]
pub enum IpPred {
    Any,
    Exact(String),
    Cidr(IpNetwork),
}

impl IpPred {
    fn parse(value: &str) -> Self {
        if value == "any" {
            return IpPred::Any;
        }
        if value.contains('/') {
            match value.parse::<IpNetwork>() {
                Ok(net) => return IpPred::Cidr(net),
                Err(_) => return IpPred::Exact(value.to_string()),
            }
        }
        IpPred::Exact(value.to_string())
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match self {
            IpPred::Any => true,
            IpPred::Exact(s) => s == &ip.to_string(),
            IpPred::Cidr(net) => net.contains(ip),
        }
    }
}

/// Port predicate. An inverted range (`lo > hi`) matches no port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPred {
    Any,
    Single(u16),
    Range(u16, u16),
}

impl PortPred {
    fn parse(value: &str) -> Result<Self> {
        if value == "any" {
            return Ok(PortPred::Any);
        }
        if let Some((a, b)) = value.split_once('-') {
            let lo = a.trim().parse::<u16>().map_err(|e| IdsError::load("rule port range", e))?;
            let hi = b.trim().parse::<u16>().map_err(|e| IdsError::load("rule port range", e))?;
            return Ok(PortPred::Range(lo, hi));
        }
        let port = value.parse::<u16>().map_err(|e| IdsError::load("rule port", e))?;
        Ok(PortPred::Single(port))
    }

    fn matches(self, port: u16) -> bool {
        match self {
            PortPred::Any => true,
            PortPred::Single(p) => p == port,
            PortPred::Range(lo, hi) => lo <= port && port <= hi,
        }
    }
}

/// One compiled rule. Disabled entries never reach this type.
#[derive(Debug, Clone)]
pub struct Rule {
    pub sid: u32,
    pub msg: String,
    pub protocol: ProtocolPred,
    pub src_ip: IpPred,
    pub dst_ip: IpPred,
    pub src_port: PortPred,
    pub dst_port: PortPred,
    pub content: Option<Regex>,
    pub severity: u8,
    pub tags: Vec<String>,
}

/// Raw rule descriptor as it appears in the JSON file. Ports may be
/// written as numbers or strings.
#[derive(Debug, Deserialize)]
struct RawRule {
    sid: u32,
    #[serde(default)]
    msg: String,
    #[serde(default = "default_any")]
    protocol: String,
    #[serde(default = "default_any")]
    src_ip: String,
    #[serde(default = "default_any_value")]
    src_port: serde_json::Value,
    #[serde(default = "default_any")]
    dst_ip: String,
    #[serde(default = "default_any_value")]
    dst_port: serde_json::Value,
    #[serde(default)]
    content: Option<String>,
    #[serde(default = "default_severity")]
    severity: u8,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    tags: Vec<String>,
}

fn default_any() -> String {
    "any".to_string()
}

fn default_any_value() -> serde_json::Value {
    serde_json::Value::String("any".to_string())
}

fn default_severity() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

fn port_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Ordered set of enabled rules.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Load and compile the rule file. Any malformed entry aborts the
    /// load with a diagnostic naming the offending sid.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| IdsError::load(format!("rule file {}", path.display()), e))?;
        let set = Self::from_json(&raw)?;
        info!("Loaded {} active rules from {}", set.rules.len(), path.display());
        Ok(set)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let raw_rules: Vec<RawRule> =
            serde_json::from_str(raw).map_err(|e| IdsError::load("rule file", e))?;

        let mut rules = Vec::new();
        for raw_rule in raw_rules {
            if !raw_rule.enabled {
                debug!("Skipping disabled rule sid={}", raw_rule.sid);
                continue;
            }
            rules.push(compile_rule(raw_rule)?);
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Evaluate one packet against every rule in declaration order and
    /// return the matching rules.
    pub fn match_packet(&self, pkt: &DecodedPacket) -> Vec<&Rule> {
        let mut hits = Vec::new();
        for rule in &self.rules {
            if !rule.protocol.matches(pkt.protocol) {
                continue;
            }
            if !rule.src_ip.matches(pkt.src_ip) {
                continue;
            }
            if !rule.dst_ip.matches(pkt.dst_ip) {
                continue;
            }
            if !rule.src_port.matches(pkt.src_port) {
                continue;
            }
            if !rule.dst_port.matches(pkt.dst_port) {
                continue;
            }
            if let Some(regex) = &rule.content {
                if !regex.is_match(&pkt.payload) {
                    continue;
                }
            }
            hits.push(rule);
        }
        hits
    }
}

fn compile_rule(raw: RawRule) -> Result<Rule> {
    let protocol = match raw.protocol.to_lowercase().as_str() {
        "any" => ProtocolPred::Any,
        "ip" => ProtocolPred::Ip,
        "tcp" => ProtocolPred::Tcp,
        "udp" => ProtocolPred::Udp,
        other => {
            return Err(IdsError::load(
                format!("rule sid={}", raw.sid),
                format!("unknown protocol {:?}", other),
            ))
        }
    };

    // DOTALL byte regex: payloads routinely contain newlines.
    let content = match &raw.content {
        Some(pattern) if !pattern.is_empty() => Some(
            Regex::new(&format!("(?s){}", pattern)).map_err(|e| {
                IdsError::load(format!("rule sid={} content", raw.sid), e)
            })?,
        ),
        _ => None,
    };

    if raw.severity == 0 || raw.severity > 5 {
        return Err(IdsError::load(
            format!("rule sid={}", raw.sid),
            format!("severity {} out of range 1-5", raw.severity),
        ));
    }

    Ok(Rule {
        sid: raw.sid,
        msg: raw.msg,
        protocol,
        src_ip: IpPred::parse(&raw.src_ip),
        dst_ip: IpPred::parse(&raw.dst_ip),
        src_port: PortPred::parse(&port_value_to_string(&raw.src_port))
            .map_err(|e| IdsError::load(format!("rule sid={}", raw.sid), e))?,
        dst_port: PortPred::parse(&port_value_to_string(&raw.dst_port))
            .map_err(|e| IdsError::load(format!("rule sid={}", raw.sid), e))?,
        content,
        severity: raw.severity,
        tags: raw.tags,
    })
}

/// Source-address overlays consulted before any rule evaluation.
///
/// Two small JSON files (arrays of address strings) are re-read at most
/// every three seconds. The trusted set is unioned with the host's own
/// addresses so the engine never alerts on its own traffic.
#[derive(Debug)]
pub struct OverlayFilter {
    blocked_path: PathBuf,
    trusted_path: PathBuf,
    blocked: HashSet<IpAddr>,
    trusted: HashSet<IpAddr>,
    last_reload: Option<Instant>,
}

const RELOAD_INTERVAL_SECS: u64 = 3;

impl OverlayFilter {
    pub fn new(blocked_path: PathBuf, trusted_path: PathBuf) -> Self {
        let mut filter = Self {
            blocked_path,
            trusted_path,
            blocked: HashSet::new(),
            trusted: HashSet::new(),
            last_reload: None,
        };
        filter.reload();
        filter
    }

    /// Re-read the overlay files if the reload interval has elapsed.
    pub fn refresh(&mut self) {
        match self.last_reload {
            Some(at) if at.elapsed().as_secs() < RELOAD_INTERVAL_SECS => {}
            _ => self.reload(),
        }
    }

    fn reload(&mut self) {
        self.blocked = read_ip_file(&self.blocked_path);

        let mut trusted = read_ip_file(&self.trusted_path);
        trusted.extend(utils::local_addresses());
        self.trusted = trusted;

        self.last_reload = Some(Instant::now());
    }

    /// True when the packet must be dropped before rule evaluation.
    pub fn should_drop(&self, src: IpAddr) -> bool {
        self.blocked.contains(&src) || self.trusted.contains(&src)
    }

    #[cfg(test)]
    fn with_sets(blocked: HashSet<IpAddr>, trusted: HashSet<IpAddr>) -> Self {
        Self {
            blocked_path: PathBuf::new(),
            trusted_path: PathBuf::new(),
            blocked,
            trusted,
            last_reload: Some(Instant::now()),
        }
    }
}

fn read_ip_file(path: &Path) -> HashSet<IpAddr> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return HashSet::new();
    };
    let Ok(entries) = serde_json::from_str::<Vec<String>>(&raw) else {
        debug!("Overlay file {} is not a JSON string array", path.display());
        return HashSet::new();
    };
    entries
        .iter()
        .filter_map(|s| s.parse::<IpAddr>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_packet(src: &str, sport: u16, dst: &str, dport: u16, payload: &[u8]) -> DecodedPacket {
        DecodedPacket {
            src_ip: src.parse().unwrap(),
            dst_ip: dst.parse().unwrap(),
            src_port: sport,
            dst_port: dport,
            protocol: Protocol::Tcp,
            payload: payload.to_vec(),
            ipv6: false,
            timestamp: 0.0,
            wire_len: 60 + payload.len(),
        }
    }

    const LFI_RULES: &str = r#"[
        {
            "sid": 100001,
            "msg": "LFI attempt /etc/passwd",
            "protocol": "tcp",
            "dst_port": 80,
            "content": "/etc/passwd",
            "severity": 4,
            "tags": ["http", "lfi"]
        }
    ]"#;

    #[test]
    fn test_lfi_rule_hits_once() {
        let rules = RuleSet::from_json(LFI_RULES).unwrap();
        let pkt = tcp_packet(
            "192.168.1.10",
            12345,
            "192.168.1.100",
            80,
            b"GET /etc/passwd HTTP/1.1\r\nHost: test\r\n\r\n",
        );
        let hits = rules.match_packet(&pkt);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].sid, 100001);
        assert_eq!(hits[0].severity, 4);
    }

    #[test]
    fn test_disabled_rule_dropped_at_compile() {
        let raw = r#"[
            {"sid": 1, "msg": "off", "enabled": false, "content": "x"},
            {"sid": 2, "msg": "on"}
        ]"#;
        let rules = RuleSet::from_json(raw).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.rules()[0].sid, 2);
    }

    #[test]
    fn test_empty_payload_never_matches_content_rule() {
        let rules = RuleSet::from_json(LFI_RULES).unwrap();
        let pkt = tcp_packet("192.168.1.10", 12345, "192.168.1.100", 80, b"");
        assert!(rules.match_packet(&pkt).is_empty());
    }

    #[test]
    fn test_content_matches_across_newlines() {
        let raw = r#"[{"sid": 7, "msg": "multiline", "content": "user.admin"}]"#;
        let rules = RuleSet::from_json(raw).unwrap();
        let pkt = tcp_packet("1.2.3.4", 1, "5.6.7.8", 2, b"user\nadmin");
        assert_eq!(rules.match_packet(&pkt).len(), 1);
    }

    #[test]
    fn test_inverted_port_range_matches_nothing() {
        let raw = r#"[{"sid": 3, "msg": "bad range", "src_port": "2000-1000"}]"#;
        let rules = RuleSet::from_json(raw).unwrap();
        for port in [999, 1000, 1500, 2000, 2001] {
            let pkt = tcp_packet("1.1.1.1", port, "2.2.2.2", 80, b"x");
            assert!(rules.match_packet(&pkt).is_empty(), "port {}", port);
        }
    }

    #[test]
    fn test_port_range_inclusive() {
        let raw = r#"[{"sid": 4, "msg": "range", "dst_port": "1000-2000"}]"#;
        let rules = RuleSet::from_json(raw).unwrap();
        for (port, expect) in [(999, false), (1000, true), (1500, true), (2000, true), (2001, false)] {
            let pkt = tcp_packet("1.1.1.1", 5, "2.2.2.2", port, b"x");
            assert_eq!(rules.match_packet(&pkt).len() == 1, expect, "port {}", port);
        }
    }

    #[test]
    fn test_cidr_containment() {
        let raw = r#"[{"sid": 5, "msg": "lan", "protocol": "ip", "src_ip": "192.168.1.0/24"}]"#;
        let rules = RuleSet::from_json(raw).unwrap();

        let inside = tcp_packet("192.168.1.77", 5, "8.8.8.8", 80, b"");
        assert_eq!(rules.match_packet(&inside).len(), 1);

        let outside = tcp_packet("192.168.2.77", 5, "8.8.8.8", 80, b"");
        assert!(rules.match_packet(&outside).is_empty());
    }

    #[test]
    fn test_ip_alias_matches_transport() {
        // `protocol: ip` must apply to tcp and udp packets, otherwise
        // CIDR-only rules would never fire on transport traffic.
        let raw = r#"[{"sid": 6, "msg": "alias", "protocol": "ip"}]"#;
        let rules = RuleSet::from_json(raw).unwrap();
        let mut pkt = tcp_packet("1.1.1.1", 5, "2.2.2.2", 80, b"");
        assert_eq!(rules.match_packet(&pkt).len(), 1);
        pkt.protocol = Protocol::Udp;
        assert_eq!(rules.match_packet(&pkt).len(), 1);
    }

    #[test]
    fn test_malformed_cidr_degrades_to_exact() {
        let raw = r#"[{"sid": 8, "msg": "bad cidr", "src_ip": "192.168.1.0/99"}]"#;
        let rules = RuleSet::from_json(raw).unwrap();
        let pkt = tcp_packet("192.168.1.7", 5, "2.2.2.2", 80, b"");
        assert!(rules.match_packet(&pkt).is_empty());
    }

    #[test]
    fn test_unknown_protocol_aborts_load() {
        let raw = r#"[{"sid": 9, "msg": "bad", "protocol": "icmpx"}]"#;
        assert!(RuleSet::from_json(raw).is_err());
    }

    #[test]
    fn test_invalid_regex_aborts_load() {
        let raw = r#"[{"sid": 10, "msg": "bad", "content": "([unclosed"}]"#;
        assert!(RuleSet::from_json(raw).is_err());
    }

    #[test]
    fn test_severity_out_of_range_aborts_load() {
        let raw = r#"[{"sid": 11, "msg": "bad", "severity": 9}]"#;
        assert!(RuleSet::from_json(raw).is_err());
    }

    #[test]
    fn test_numeric_port_accepted() {
        let raw = r#"[{"sid": 12, "msg": "num", "dst_port": 80}]"#;
        let rules = RuleSet::from_json(raw).unwrap();
        let pkt = tcp_packet("1.1.1.1", 5, "2.2.2.2", 80, b"");
        assert_eq!(rules.match_packet(&pkt).len(), 1);
    }

    #[test]
    fn test_declaration_order_preserved() {
        let raw = r#"[
            {"sid": 20, "msg": "first", "dst_port": 80},
            {"sid": 21, "msg": "second", "dst_port": 80}
        ]"#;
        let rules = RuleSet::from_json(raw).unwrap();
        let pkt = tcp_packet("1.1.1.1", 5, "2.2.2.2", 80, b"");
        let hits = rules.match_packet(&pkt);
        assert_eq!(hits.iter().map(|r| r.sid).collect::<Vec<_>>(), vec![20, 21]);
    }

    #[test]
    fn test_blocked_source_dropped() {
        let blocked: HashSet<IpAddr> = ["192.168.1.10".parse().unwrap()].into_iter().collect();
        let filter = OverlayFilter::with_sets(blocked, HashSet::new());
        assert!(filter.should_drop("192.168.1.10".parse().unwrap()));
        assert!(!filter.should_drop("192.168.1.11".parse().unwrap()));
    }

    #[test]
    fn test_trusted_source_dropped() {
        let trusted: HashSet<IpAddr> = ["10.0.0.5".parse().unwrap()].into_iter().collect();
        let filter = OverlayFilter::with_sets(HashSet::new(), trusted);
        assert!(filter.should_drop("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn test_only_own_link_local_address_exempted() {
        // The host's own link-local address lands in the trusted set via
        // local address discovery; a spoofed link-local source does not.
        let own: HashSet<IpAddr> = ["169.254.7.7".parse().unwrap()].into_iter().collect();
        let filter = OverlayFilter::with_sets(HashSet::new(), own);
        assert!(filter.should_drop("169.254.7.7".parse().unwrap()));
        assert!(!filter.should_drop("169.254.1.1".parse().unwrap()));
    }
}
