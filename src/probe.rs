//! Gateway discovery over PCP and NAT-PMP
//!
//! Sends a NAT-PMP external-address request and a PCP ANNOUNCE to every
//! candidate gateway from every local address of the same family, and reports
//! the gateways that answer with a successful response.

use crate::bus::Bus;
use crate::codec::{Codec, Decoded};
use crate::gateway::UdpRequest;
use crate::orchestrator::{AttemptSchedule, Delivery, UdpExchange, UdpOrchestrator};
use crate::presets::PCP_NATPMP_PORT;
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, trace};

const NATPMP_VERSION: u8 = 0;
const NATPMP_OP_EXTERNAL_ADDRESS: u8 = 0;
const NATPMP_EXTERNAL_ADDRESS_RESPONSE_LEN: usize = 12;

const PCP_VERSION: u8 = 2;
const PCP_OP_ANNOUNCE: u8 = 0;
const PCP_RESPONSE_BIT: u8 = 0x80;
const PCP_HEADER_LEN: usize = 24;

/// Protocol a gateway answered with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatewayKind {
    /// Port Control Protocol (RFC 6887)
    Pcp,
    /// NAT Port Mapping Protocol (RFC 6886)
    NatPmp,
}

impl fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayKind::Pcp => write!(f, "PCP"),
            GatewayKind::NatPmp => write!(f, "NAT-PMP"),
        }
    }
}

/// Successful probe answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    /// Protocol that answered
    pub kind: GatewayKind,
    /// Public address, reported by NAT-PMP only
    pub external_ip: Option<IpAddr>,
    /// Seconds since the gateway's mapping table was reset
    pub epoch_secs: u32,
}

/// Codec for the two discovery requests
///
/// The request is the local address the probe is sent from; PCP carries it
/// in its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeCodec {
    /// NAT-PMP external address request
    NatPmp,
    /// PCP ANNOUNCE
    Pcp,
}

impl Codec for ProbeCodec {
    type Request = IpAddr;
    type Response = ProbeResponse;

    fn encode(&self, client_ip: &IpAddr) -> Bytes {
        match self {
            ProbeCodec::NatPmp => Bytes::from_static(&[NATPMP_VERSION, NATPMP_OP_EXTERNAL_ADDRESS]),
            ProbeCodec::Pcp => {
                let mut request = BytesMut::with_capacity(PCP_HEADER_LEN);
                request.put_u8(PCP_VERSION);
                request.put_u8(PCP_OP_ANNOUNCE);
                request.put_u16(0); // reserved
                request.put_u32(0); // lifetime
                request.put_slice(&pcp_address_bytes(*client_ip));
                request.freeze()
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Decoded<ProbeResponse> {
        let decoded = match self {
            ProbeCodec::NatPmp => decode_natpmp(bytes),
            ProbeCodec::Pcp => decode_pcp(bytes),
        };
        if !decoded.is_matched() {
            trace!("{:?} rejected {}", self, hex::encode(bytes));
        }
        decoded
    }
}

fn decode_natpmp(bytes: &[u8]) -> Decoded<ProbeResponse> {
    if bytes.len() < NATPMP_EXTERNAL_ADDRESS_RESPONSE_LEN
        || bytes[0] != NATPMP_VERSION
        || bytes[1] != NATPMP_OP_EXTERNAL_ADDRESS + 128
        || u16::from_be_bytes([bytes[2], bytes[3]]) != 0
    {
        return Decoded::Rejected;
    }

    let epoch_secs = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let external_ip = Ipv4Addr::new(bytes[8], bytes[9], bytes[10], bytes[11]);
    Decoded::Matched(ProbeResponse {
        kind: GatewayKind::NatPmp,
        external_ip: Some(IpAddr::V4(external_ip)),
        epoch_secs,
    })
}

fn decode_pcp(bytes: &[u8]) -> Decoded<ProbeResponse> {
    if bytes.len() < PCP_HEADER_LEN
        || bytes[0] != PCP_VERSION
        || bytes[1] != PCP_RESPONSE_BIT | PCP_OP_ANNOUNCE
        || bytes[3] != 0
    {
        return Decoded::Rejected;
    }

    let epoch_secs = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    Decoded::Matched(ProbeResponse {
        kind: GatewayKind::Pcp,
        external_ip: None,
        epoch_secs,
    })
}

/// 16-byte PCP address field, IPv4 addresses mapped into `::ffff:0:0/96`
fn pcp_address_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(ipv4) => ipv4.to_ipv6_mapped().octets(),
        IpAddr::V6(ipv6) => ipv6.octets(),
    }
}

/// A gateway that answered a probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredGateway {
    /// Address the gateway answered from
    pub gateway: IpAddr,
    /// Local address the probe was sent from
    pub local_ip: IpAddr,
    /// Protocol that answered
    pub kind: GatewayKind,
    /// Public address, if the protocol reports it
    pub external_ip: Option<IpAddr>,
    /// Gateway epoch from the response
    pub epoch_secs: u32,
    /// When the answer was collected
    pub discovered_at: DateTime<Utc>,
}

/// Probe `candidates` for PCP and NAT-PMP support
///
/// Each candidate is paired with every local address of the same family
/// reported by the UDP gateway. A gateway reachable from several local
/// addresses is reported once per protocol, for the first local address
/// that reached it.
pub async fn probe_gateways(
    udp: Bus<UdpRequest>,
    candidates: &[IpAddr],
    schedule: &AttemptSchedule,
    provisioning_timeout: Duration,
) -> Result<Vec<DiscoveredGateway>> {
    let local_ips = udp
        .call(|reply| UdpRequest::GetLocalIpAddresses { reply }, provisioning_timeout)
        .await?;
    debug!("Probing {} candidates from {:?}", candidates.len(), local_ips);

    let mut exchanges = Vec::new();
    for &local_ip in &local_ips {
        for &candidate in candidates {
            if local_ip.is_ipv4() != candidate.is_ipv4() {
                continue;
            }
            let destination = SocketAddr::new(candidate, PCP_NATPMP_PORT);
            for codec in [ProbeCodec::Pcp, ProbeCodec::NatPmp] {
                exchanges.push(UdpExchange::new(local_ip, destination, local_ip, codec));
            }
        }
    }
    if exchanges.is_empty() {
        info!("No local address can reach any candidate gateway");
        return Ok(Vec::new());
    }

    let orchestrator = UdpOrchestrator::new(udp, provisioning_timeout);
    let exchanges = orchestrator
        .run(exchanges, Delivery::Unicast, schedule)
        .await;

    let discovered_at = Utc::now();
    let mut discovered: Vec<DiscoveredGateway> = Vec::new();
    for exchange in exchanges {
        let Some(response) = exchange.response() else {
            continue;
        };
        let gateway = exchange.destination.ip();
        if discovered
            .iter()
            .any(|known| known.gateway == gateway && known.kind == response.kind)
        {
            continue;
        }
        info!(
            "{} gateway found at {} (via {})",
            response.kind, gateway, exchange.source
        );
        discovered.push(DiscoveredGateway {
            gateway,
            local_ip: exchange.source,
            kind: response.kind,
            external_ip: response.external_ip,
            epoch_secs: response.epoch_secs,
            discovered_at,
        });
    }

    Ok(discovered)
}
