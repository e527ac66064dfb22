//! End-to-end checks over the public surface: synthesized frames through
//! the decoder, the rule engine and the flow tracker.

use hybrid_ids_core::anomaly::{
    classify_direction, decide, severity, signature_match, softmax, DecisionInput, FlowDirection,
    Thresholds, Verdict, KNOWN_ATTACK_LABELS, UNKNOWN_ATTACK_NAME,
};
use hybrid_ids_core::decode::decode_frame;
use hybrid_ids_core::flow::FlowTable;
use hybrid_ids_core::rules::RuleSet;
use hybrid_ids_core::types::{AlertEnvelope, Protocol};

/// Ethernet/IPv4/TCP frame builder for test traffic.
fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    frame.extend_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    let total_len = 20 + 20 + payload.len() as u16;
    frame.push(0x45);
    frame.push(0);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0x04, 0xd2, 0, 0]);
    frame.push(64);
    frame.push(6);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(&sport.to_be_bytes());
    frame.extend_from_slice(&dport.to_be_bytes());
    frame.extend_from_slice(&[0; 8]);
    frame.push(5 << 4);
    frame.push(0x18); // psh|ack
    frame.extend_from_slice(&[0x20, 0x00, 0, 0, 0, 0]);
    frame.extend_from_slice(payload);
    frame
}

#[test]
fn lfi_frame_decodes_and_matches_rule() {
    let rules = RuleSet::from_json(
        r#"[{
            "sid": 100001,
            "msg": "LFI attempt /etc/passwd",
            "protocol": "tcp",
            "dst_port": 80,
            "content": "/etc/passwd",
            "severity": 4,
            "tags": ["http", "lfi"]
        }]"#,
    )
    .unwrap();

    let frame = tcp_frame(
        [192, 168, 1, 10],
        [192, 168, 1, 100],
        12345,
        80,
        b"GET /etc/passwd HTTP/1.1\r\nHost: test\r\n\r\n",
    );
    let pkt = decode_frame(&frame, 100.0).unwrap();

    let hits = rules.match_packet(&pkt);
    assert_eq!(hits.len(), 1);

    let envelope = AlertEnvelope::from_rule_hit(hits[0], &pkt);
    assert_eq!(envelope.engine, "rule");
    assert_eq!(envelope.attack_type, "LFI attempt /etc/passwd");
    assert_eq!(envelope.severity, 4);
    assert_eq!(envelope.session, "192.168.1.10:12345 -> 192.168.1.100:80");
    // "GET " in hex.
    assert!(envelope.payload_preview.unwrap().starts_with("47455420"));
}

#[test]
fn decoded_frames_drive_the_flow_table() {
    let mut table = FlowTable::new();

    let out = tcp_frame([192, 168, 1, 10], [8, 8, 8, 8], 40000, 443, b"hello");
    let back = tcp_frame([8, 8, 8, 8], [192, 168, 1, 10], 443, 40000, b"world!");

    let pkt_out = decode_frame(&out, 10.0).unwrap();
    let pkt_back = decode_frame(&back, 10.5).unwrap();

    let (key_a, _, _) = table.observe(&pkt_out, pkt_out.timestamp);
    let (key_b, features, flow) = table.observe(&pkt_back, pkt_back.timestamp);

    // Both directions land on the same canonical entry.
    assert_eq!(key_a, key_b);
    assert_eq!(table.len(), 1);
    assert_eq!(flow.total_packets(), 2);
    assert_eq!(flow.fwd.packets, 1);
    assert_eq!(flow.bwd.packets, 1);

    // Feature vector is finite, non-negative, and reports the first-seen
    // destination port.
    assert_eq!(features[0], 443.0);
    for v in &features {
        assert!(v.is_finite() && *v >= 0.0);
    }
}

#[test]
fn high_entropy_udp_scenario_yields_unknown_attack() {
    // The generator's unknown-traffic shape: src 56000 toward an
    // unregistered high port, high packet rate, negative realness.
    let labels: Vec<String> = KNOWN_ATTACK_LABELS.iter().map(|s| s.to_string()).collect();
    // Unconfident non-benign argmax: the strong-OOD arm decides.
    let probs = softmax(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    let input = DecisionInput {
        probs: &probs,
        real_score: -0.2,
        labels: &labels,
        packets_per_second: 600.0,
        bytes_per_second: 500_000.0,
        total_packets: 56,
        one_way: true,
        direction: classify_direction(
            "203.0.113.50".parse().unwrap(),
            "192.168.1.100".parse().unwrap(),
        ),
        src_port: 56000,
        dst_port: 45007,
        protocol: Protocol::Udp,
    };

    let verdict = decide(&input, &Thresholds::default());
    assert_eq!(verdict.attack_type(), UNKNOWN_ATTACK_NAME);
    let confidence = verdict.confidence();
    assert!((0.5..=0.9).contains(&confidence), "confidence {}", confidence);
    let sev = severity(&verdict, &input);
    assert!(sev == 4 || sev == 5);
}

#[test]
fn signature_table_matches_generator_ports() {
    assert_eq!(
        signature_match(50000, Protocol::Udp, 80),
        Some(("DDoS", 0.95))
    );
    assert_eq!(
        signature_match(60000, Protocol::Udp, 22).map(|(l, _)| l),
        Some("BruteForce")
    );
    assert_eq!(
        signature_match(58000, Protocol::Tcp, 9999).map(|(l, _)| l),
        Some("PortScan")
    );
    // Wrong protocol or port: no match.
    assert_eq!(signature_match(50000, Protocol::Tcp, 80), None);
    assert_eq!(signature_match(50000, Protocol::Udp, 443), None);
    assert_eq!(signature_match(40000, Protocol::Udp, 80), None);
}

#[test]
fn outbound_download_never_alerts() {
    // Bidirectional HTTPS download from a private client: whatever the
    // model says short of a signature triple, no alert below 2000 pps.
    let labels: Vec<String> = KNOWN_ATTACK_LABELS.iter().map(|s| s.to_string()).collect();
    for (class_idx, real) in [(0usize, -0.5f32), (3, 0.1), (4, -0.3)] {
        let mut logits = vec![0.0f32; labels.len()];
        logits[class_idx] = 3.0;
        let probs = softmax(&logits);
        let input = DecisionInput {
            probs: &probs,
            real_score: real,
            labels: &labels,
            packets_per_second: 300.0,
            bytes_per_second: 800_000.0,
            total_packets: 600,
            one_way: false,
            direction: FlowDirection::LocalToExternal,
            src_port: 51111,
            dst_port: 443,
            protocol: Protocol::Tcp,
        };
        let verdict = decide(&input, &Thresholds::default());
        assert_eq!(verdict, Verdict::Benign, "class {} real {}", class_idx, real);
    }
}
