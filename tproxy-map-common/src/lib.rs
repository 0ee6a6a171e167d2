#![cfg_attr(not(any(feature = "user", test)), no_std)]

// Key/value layouts of the pinned `zt_tproxy_map` hash map. The tc redirect
// program owns the map; these definitions must match its C structs byte for
// byte. Every address and port field holds network byte order.

use core::fmt;

/// Capacity of each per-protocol index table.
pub const MAX_INDEX_ENTRIES: usize = 100;
/// One mapping slot per 16-bit port value.
pub const MAX_TABLE_SIZE: usize = 65536;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Where iproute2 pins the map when the redirect program is attached via tc.
pub const DEFAULT_MAP_PIN: &str = "/sys/fs/bpf/tc/globals/zt_tproxy_map";

/// Hash key: destination address plus prefix length.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct RuleKey {
    /// IPv4 address in network byte order.
    pub destination_ip: u32,
    pub prefix_length: u16,
    pub pad: u16,
}

impl RuleKey {
    pub const fn new(destination_ip: u32, prefix_length: u16) -> Self {
        Self {
            destination_ip,
            prefix_length,
            pad: 0,
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.destination_ip.to_ne_bytes();
        write!(f, "{a}.{b}.{c}.{d}/{}", self.prefix_length)
    }
}

/// Redirects ports `[low_port, high_port]` to `proxy_ip:proxy_port`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PortMapping {
    pub low_port: u16,
    pub high_port: u16,
    pub proxy_port: u16,
    pub _pad: u16,
    /// IPv4 address in network byte order.
    pub proxy_ip: u32,
}

impl PortMapping {
    pub const fn new(low_port: u16, high_port: u16, proxy_port: u16, proxy_ip: u32) -> Self {
        Self {
            low_port,
            high_port,
            proxy_port,
            _pad: 0,
            proxy_ip,
        }
    }

    /// Unused slots are all-zero; a populated slot always has a low port.
    pub const fn is_empty(&self) -> bool {
        self.low_port == 0
    }
}

/// Map value: every redirect rule stored for one [`RuleKey`].
///
/// The mapping arrays are addressed by the port as it appears on the wire
/// (network byte order reinterpreted as a native `u16`), which is how the
/// classifier indexes them straight from the transport header. The index
/// tables list the populated slots so they can be enumerated without walking
/// all 65536 entries.
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct RuleRecord {
    pub destination_ip: u32,
    /// Zero matches any source.
    pub source_ip: u32,
    pub udp_index_count: u16,
    pub tcp_index_count: u16,
    pub udp_index_table: [u16; MAX_INDEX_ENTRIES],
    pub tcp_index_table: [u16; MAX_INDEX_ENTRIES],
    pub udp_mapping: [PortMapping; MAX_TABLE_SIZE],
    pub tcp_mapping: [PortMapping; MAX_TABLE_SIZE],
}

// The derived Debug would print 131072 mappings.
impl fmt::Debug for RuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let udp = usize::from(self.udp_index_count).min(MAX_INDEX_ENTRIES);
        let tcp = usize::from(self.tcp_index_count).min(MAX_INDEX_ENTRIES);
        f.debug_struct("RuleRecord")
            .field("destination_ip", &self.destination_ip)
            .field("source_ip", &self.source_ip)
            .field("udp_index_count", &self.udp_index_count)
            .field("tcp_index_count", &self.tcp_index_count)
            .field("udp_index_table", &&self.udp_index_table[..udp])
            .field("tcp_index_table", &&self.tcp_index_table[..tcp])
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "user")]
mod user_impls {
    use super::{PortMapping, RuleKey, RuleRecord};
    use aya::Pod;

    unsafe impl Pod for RuleKey {}
    unsafe impl Pod for PortMapping {}
    unsafe impl Pod for RuleRecord {}
}
