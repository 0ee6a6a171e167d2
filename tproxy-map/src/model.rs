use std::{fmt, net::Ipv4Addr};

use serde_json::{Map as JsonMap, Number as JsonNumber, Value};
use tproxy_map_common::{
    MAX_INDEX_ENTRIES, MAX_TABLE_SIZE, PROTO_TCP, PROTO_UDP, PortMapping, RuleKey, RuleRecord,
};

use crate::error::UpdateError;

/// The two transport protocols a rule record keeps tables for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn number(self) -> u8 {
        match self {
            Self::Tcp => PROTO_TCP,
            Self::Udp => PROTO_UDP,
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = UpdateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            PROTO_TCP => Ok(Self::Tcp),
            PROTO_UDP => Ok(Self::Udp),
            other => Err(UpdateError::UnsupportedProtocol(other)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Allocates an all-zero record directly on the heap.
///
/// The record is ~1.5 MiB, too large to build on a thread stack first.
pub fn empty_record() -> Box<RuleRecord> {
    // SAFETY: RuleRecord is repr(C) and made of integers only, so the
    // all-zero bit pattern is a valid value.
    unsafe { Box::<RuleRecord>::new_zeroed().assume_init() }
}

/// The record created on first insert for `key`: destination filled in, any
/// source, no mappings.
pub fn fresh_record(key: &RuleKey) -> Box<RuleRecord> {
    let mut record = empty_record();
    record.destination_ip = key.destination_ip;
    record.source_ip = 0;
    record
}

/// Heap copy of `record` without a stack temporary.
pub fn duplicate_record(record: &RuleRecord) -> Box<RuleRecord> {
    let mut copy = empty_record();
    *copy = *record;
    copy
}

/// Read-only view of one protocol's half of a record.
pub struct ProtocolTable<'a> {
    count: u16,
    index: &'a [u16; MAX_INDEX_ENTRIES],
    mapping: &'a [PortMapping; MAX_TABLE_SIZE],
}

/// Mutable view of one protocol's half of a record.
pub struct ProtocolTableMut<'a> {
    pub count: &'a mut u16,
    pub index: &'a mut [u16; MAX_INDEX_ENTRIES],
    pub mapping: &'a mut [PortMapping; MAX_TABLE_SIZE],
}

pub fn table(record: &RuleRecord, protocol: Protocol) -> ProtocolTable<'_> {
    match protocol {
        Protocol::Tcp => ProtocolTable {
            count: record.tcp_index_count,
            index: &record.tcp_index_table,
            mapping: &record.tcp_mapping,
        },
        Protocol::Udp => ProtocolTable {
            count: record.udp_index_count,
            index: &record.udp_index_table,
            mapping: &record.udp_mapping,
        },
    }
}

pub fn table_mut(record: &mut RuleRecord, protocol: Protocol) -> ProtocolTableMut<'_> {
    match protocol {
        Protocol::Tcp => ProtocolTableMut {
            count: &mut record.tcp_index_count,
            index: &mut record.tcp_index_table,
            mapping: &mut record.tcp_mapping,
        },
        Protocol::Udp => ProtocolTableMut {
            count: &mut record.udp_index_count,
            index: &mut record.udp_index_table,
            mapping: &mut record.udp_mapping,
        },
    }
}

fn checked_len(count: u16, protocol: Protocol) -> Result<usize, UpdateError> {
    let len = usize::from(count);
    if len > MAX_INDEX_ENTRIES {
        return Err(UpdateError::InternalConsistency(format!(
            "{protocol} index count {len} exceeds capacity {MAX_INDEX_ENTRIES}"
        )));
    }
    Ok(len)
}

impl<'a> ProtocolTable<'a> {
    /// Populated slots in insertion order.
    pub fn indexed(&self, protocol: Protocol) -> Result<&'a [u16], UpdateError> {
        let len = checked_len(self.count, protocol)?;
        Ok(&self.index[..len])
    }

    pub fn mapping(&self, slot: u16) -> &'a PortMapping {
        &self.mapping[usize::from(slot)]
    }
}

impl ProtocolTableMut<'_> {
    pub fn checked_len(&self, protocol: Protocol) -> Result<usize, UpdateError> {
        checked_len(*self.count, protocol)
    }
}

/// Host-order port number of a mapping slot. Slots are wire-order ports.
pub fn port_of(slot: u16) -> u16 {
    u16::from_be(slot)
}

pub fn wire_ip_to_addr(wire: u32) -> Ipv4Addr {
    Ipv4Addr::from(wire.to_ne_bytes())
}

/// JSON rendering of the populated part of a record, in host byte order.
pub fn record_summary(key: &RuleKey, record: &RuleRecord) -> Result<Value, UpdateError> {
    let mut obj = JsonMap::new();
    obj.insert("key".to_string(), Value::String(key.to_string()));
    obj.insert(
        "destination_ip".to_string(),
        Value::String(wire_ip_to_addr(record.destination_ip).to_string()),
    );
    obj.insert(
        "source_ip".to_string(),
        Value::String(wire_ip_to_addr(record.source_ip).to_string()),
    );
    for protocol in [Protocol::Udp, Protocol::Tcp] {
        let view = table(record, protocol);
        let entries = view
            .indexed(protocol)?
            .iter()
            .map(|&slot| mapping_summary(slot, view.mapping(slot)))
            .collect();
        obj.insert(protocol.to_string(), Value::Array(entries));
    }
    Ok(Value::Object(obj))
}

fn mapping_summary(slot: u16, mapping: &PortMapping) -> Value {
    let mut obj = JsonMap::new();
    obj.insert(
        "port".to_string(),
        Value::Number(JsonNumber::from(port_of(slot))),
    );
    obj.insert(
        "low_port".to_string(),
        Value::Number(JsonNumber::from(u16::from_be(mapping.low_port))),
    );
    obj.insert(
        "high_port".to_string(),
        Value::Number(JsonNumber::from(u16::from_be(mapping.high_port))),
    );
    obj.insert(
        "proxy".to_string(),
        Value::String(format!(
            "{}:{}",
            wire_ip_to_addr(mapping.proxy_ip),
            u16::from_be(mapping.proxy_port)
        )),
    );
    Value::Object(obj)
}
