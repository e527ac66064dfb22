//! Stateless frame decoding using pnet.

use std::net::IpAddr;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;

use crate::types::{DecodedPacket, Protocol};

/// Reasons a frame is dropped before reaching either engine.
/// All of these are silent skips; the engine only counts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeSkip {
    NonIp,
    UnsupportedTransport,
    Truncated,
}

/// Decode one captured ethernet frame into the pipeline's packet record.
pub fn decode_frame(data: &[u8], timestamp: f64) -> Result<DecodedPacket, DecodeSkip> {
    let ethernet = EthernetPacket::new(data).ok_or(DecodeSkip::Truncated)?;

    match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => decode_ipv4(ethernet.payload(), timestamp, data.len()),
        EtherTypes::Ipv6 => decode_ipv6(ethernet.payload(), timestamp, data.len()),
        _ => Err(DecodeSkip::NonIp),
    }
}

fn decode_ipv4(data: &[u8], timestamp: f64, wire_len: usize) -> Result<DecodedPacket, DecodeSkip> {
    let ipv4 = Ipv4Packet::new(data).ok_or(DecodeSkip::Truncated)?;

    let src_ip = IpAddr::V4(ipv4.get_source());
    let dst_ip = IpAddr::V4(ipv4.get_destination());

    match ipv4.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(ipv4.payload()).ok_or(DecodeSkip::Truncated)?;
            Ok(DecodedPacket {
                src_ip,
                dst_ip,
                src_port: tcp.get_source(),
                dst_port: tcp.get_destination(),
                protocol: Protocol::Tcp,
                payload: tcp.payload().to_vec(),
                ipv6: false,
                timestamp,
                wire_len,
            })
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(ipv4.payload()).ok_or(DecodeSkip::Truncated)?;
            Ok(DecodedPacket {
                src_ip,
                dst_ip,
                src_port: udp.get_source(),
                dst_port: udp.get_destination(),
                protocol: Protocol::Udp,
                payload: udp.payload().to_vec(),
                ipv6: false,
                timestamp,
                wire_len,
            })
        }
        _ => Err(DecodeSkip::UnsupportedTransport),
    }
}

fn decode_ipv6(data: &[u8], timestamp: f64, wire_len: usize) -> Result<DecodedPacket, DecodeSkip> {
    let ipv6 = Ipv6Packet::new(data).ok_or(DecodeSkip::Truncated)?;

    let src_ip = IpAddr::V6(ipv6.get_source());
    let dst_ip = IpAddr::V6(ipv6.get_destination());

    match ipv6.get_next_header() {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(ipv6.payload()).ok_or(DecodeSkip::Truncated)?;
            Ok(DecodedPacket {
                src_ip,
                dst_ip,
                src_port: tcp.get_source(),
                dst_port: tcp.get_destination(),
                protocol: Protocol::Tcp,
                payload: tcp.payload().to_vec(),
                ipv6: true,
                timestamp,
                wire_len,
            })
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(ipv6.payload()).ok_or(DecodeSkip::Truncated)?;
            Ok(DecodedPacket {
                src_ip,
                dst_ip,
                src_port: udp.get_source(),
                dst_port: udp.get_destination(),
                protocol: Protocol::Udp,
                payload: udp.payload().to_vec(),
                ipv6: true,
                timestamp,
                wire_len,
            })
        }
        _ => Err(DecodeSkip::UnsupportedTransport),
    }
}
