//! Well-known gateway addresses and ports

use std::net::Ipv4Addr;

/// Server port shared by PCP and NAT-PMP
pub const PCP_NATPMP_PORT: u16 = 5351;

/// Addresses home routers commonly use for themselves
///
/// Probed when the default gateway cannot be determined.
pub const COMMON_GATEWAY_ADDRESSES: &[Ipv4Addr] = &[
    Ipv4Addr::new(192, 168, 0, 1),
    Ipv4Addr::new(192, 168, 1, 1),
    Ipv4Addr::new(192, 168, 2, 1),
    Ipv4Addr::new(192, 168, 0, 254),
    Ipv4Addr::new(192, 168, 1, 254),
    Ipv4Addr::new(192, 168, 3, 1),
    Ipv4Addr::new(192, 168, 8, 1),
    Ipv4Addr::new(192, 168, 10, 1),
    Ipv4Addr::new(192, 168, 11, 1),
    Ipv4Addr::new(192, 168, 31, 1),
    Ipv4Addr::new(192, 168, 50, 1),
    Ipv4Addr::new(192, 168, 100, 1),
    Ipv4Addr::new(192, 168, 178, 1),
    Ipv4Addr::new(10, 0, 0, 1),
    Ipv4Addr::new(10, 0, 0, 138),
    Ipv4Addr::new(10, 0, 1, 1),
    Ipv4Addr::new(10, 1, 1, 1),
    Ipv4Addr::new(10, 1, 10, 1),
    Ipv4Addr::new(172, 16, 0, 1),
];
