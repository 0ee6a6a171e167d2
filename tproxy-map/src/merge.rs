use tproxy_map_common::{MAX_INDEX_ENTRIES, PortMapping, RuleRecord};

use crate::error::UpdateError;
use crate::model::{Protocol, port_of, table, table_mut};

/// Upserts `mapping` at `slot` on the `protocol` side of `record`.
///
/// The slot is appended to the index table the first time it is seen and the
/// mapping array entry is overwritten every time. Nothing else in the record
/// is touched, so merging the same mapping twice is a no-op the second time.
/// Returns whether the slot was newly indexed.
///
/// The record is left unchanged when an error is returned before the write,
/// i.e. on a full index table or a corrupt index count.
pub fn merge(
    record: &mut RuleRecord,
    protocol: Protocol,
    slot: u16,
    mapping: PortMapping,
) -> Result<bool, UpdateError> {
    if mapping.is_empty() {
        return Err(UpdateError::InternalConsistency(format!(
            "refusing to index an empty {protocol} mapping at port {}",
            port_of(slot)
        )));
    }

    let side = table_mut(record, protocol);
    let len = side.checked_len(protocol)?;
    let added = if side.index[..len].contains(&slot) {
        false
    } else {
        if len == MAX_INDEX_ENTRIES {
            return Err(UpdateError::IndexTableFull {
                protocol,
                port: port_of(slot),
                capacity: MAX_INDEX_ENTRIES,
            });
        }
        side.index[len] = slot;
        *side.count += 1;
        true
    };
    side.mapping[usize::from(slot)] = mapping;

    verify(record, protocol, slot, &mapping)?;
    Ok(added)
}

/// Post-condition of [`merge`]: the slot is indexed exactly once and reads
/// back the mapping that was written.
fn verify(
    record: &RuleRecord,
    protocol: Protocol,
    slot: u16,
    expected: &PortMapping,
) -> Result<(), UpdateError> {
    let view = table(record, protocol);
    let occurrences = view
        .indexed(protocol)?
        .iter()
        .filter(|&&s| s == slot)
        .count();
    if occurrences != 1 {
        return Err(UpdateError::InternalConsistency(format!(
            "{protocol} port {} indexed {occurrences} times",
            port_of(slot)
        )));
    }
    let stored = view.mapping(slot);
    if stored.is_empty() || stored != expected {
        return Err(UpdateError::InternalConsistency(format!(
            "{protocol} mapping at port {} did not read back",
            port_of(slot)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::empty_record;

    const LOOPBACK: u32 = u32::from_ne_bytes([127, 0, 0, 1]);

    fn wire(port: u16) -> u16 {
        port.to_be()
    }

    fn redirect(port: u16, proxy_port: u16) -> PortMapping {
        PortMapping::new(wire(port), wire(port), wire(proxy_port), LOOPBACK)
    }

    #[test]
    fn merge_into_empty_record_reads_back() {
        let mut record = empty_record();
        let mapping = redirect(5060, 5061);
        let added = merge(&mut record, Protocol::Udp, wire(5060), mapping).unwrap();

        assert!(added);
        assert_eq!(record.udp_index_count, 1);
        assert_eq!(record.udp_index_table[0], wire(5060));
        assert_eq!(record.udp_mapping[usize::from(wire(5060))], mapping);
        assert_eq!(record.tcp_index_count, 0);
    }

    #[test]
    fn repeated_merge_is_idempotent() {
        let mut record = empty_record();
        let mapping = redirect(443, 8443);
        assert!(merge(&mut record, Protocol::Tcp, wire(443), mapping).unwrap());
        assert!(!merge(&mut record, Protocol::Tcp, wire(443), mapping).unwrap());

        assert_eq!(record.tcp_index_count, 1);
        assert_eq!(&record.tcp_index_table[..1], &[wire(443)]);
        assert_eq!(record.tcp_mapping[usize::from(wire(443))], mapping);
    }

    #[test]
    fn remerge_updates_mapping_in_place() {
        let mut record = empty_record();
        merge(&mut record, Protocol::Udp, wire(53), redirect(53, 5353)).unwrap();
        let updated = redirect(53, 5354);
        assert!(!merge(&mut record, Protocol::Udp, wire(53), updated).unwrap());

        assert_eq!(record.udp_index_count, 1);
        assert_eq!(record.udp_mapping[usize::from(wire(53))], updated);
    }

    #[test]
    fn index_table_deduplicates_in_insertion_order() {
        let mut record = empty_record();
        for port in [10, 20, 10, 30] {
            merge(&mut record, Protocol::Udp, wire(port), redirect(port, 9000)).unwrap();
        }
        assert_eq!(record.udp_index_count, 3);
        assert_eq!(
            &record.udp_index_table[..3],
            &[wire(10), wire(20), wire(30)]
        );
    }

    #[test]
    fn merge_leaves_other_slots_and_protocol_alone() {
        let mut record = empty_record();
        let tcp = redirect(443, 8443);
        let udp_other = redirect(123, 1123);
        merge(&mut record, Protocol::Tcp, wire(443), tcp).unwrap();
        merge(&mut record, Protocol::Udp, wire(123), udp_other).unwrap();

        merge(&mut record, Protocol::Udp, wire(53), redirect(53, 5353)).unwrap();

        assert_eq!(record.tcp_index_count, 1);
        assert_eq!(record.tcp_mapping[usize::from(wire(443))], tcp);
        assert!(record.tcp_mapping[usize::from(wire(53))].is_empty());
        assert_eq!(record.udp_mapping[usize::from(wire(123))], udp_other);
        let populated = record
            .udp_mapping
            .iter()
            .filter(|m| !m.is_empty())
            .count();
        assert_eq!(populated, 2);
    }

    #[test]
    fn udp_merge_never_writes_the_tcp_index() {
        let mut record = empty_record();
        merge(&mut record, Protocol::Udp, wire(5060), redirect(5060, 5061)).unwrap();
        assert!(record.tcp_index_table.iter().all(|&s| s == 0));
    }

    #[test]
    fn full_index_table_rejects_new_ports() {
        let mut record = empty_record();
        for port in 1..=MAX_INDEX_ENTRIES as u16 {
            merge(&mut record, Protocol::Tcp, wire(port), redirect(port, 9000)).unwrap();
        }
        assert_eq!(usize::from(record.tcp_index_count), MAX_INDEX_ENTRIES);

        // existing ports can still be updated
        assert!(!merge(&mut record, Protocol::Tcp, wire(7), redirect(7, 9001)).unwrap());

        let err = merge(&mut record, Protocol::Tcp, wire(1000), redirect(1000, 9000)).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::IndexTableFull {
                protocol: Protocol::Tcp,
                port: 1000,
                capacity: MAX_INDEX_ENTRIES,
            }
        ));
        assert!(record.tcp_mapping[usize::from(wire(1000))].is_empty());
        assert_eq!(usize::from(record.tcp_index_count), MAX_INDEX_ENTRIES);

        // the other protocol has its own capacity
        assert!(merge(&mut record, Protocol::Udp, wire(1000), redirect(1000, 9000)).unwrap());
    }

    #[test]
    fn corrupt_index_count_is_rejected_before_writing() {
        let mut record = empty_record();
        record.udp_index_count = (MAX_INDEX_ENTRIES + 1) as u16;
        let err = merge(&mut record, Protocol::Udp, wire(53), redirect(53, 5353)).unwrap_err();
        assert!(matches!(err, UpdateError::InternalConsistency(_)));
        assert!(record.udp_mapping[usize::from(wire(53))].is_empty());
    }

    #[test]
    fn duplicated_index_entry_fails_verification() {
        let mut record = empty_record();
        record.udp_index_table[0] = wire(53);
        record.udp_index_table[1] = wire(53);
        record.udp_index_count = 2;
        let err = merge(&mut record, Protocol::Udp, wire(53), redirect(53, 5353)).unwrap_err();
        assert!(matches!(err, UpdateError::InternalConsistency(_)));
    }

    #[test]
    fn empty_mapping_is_refused() {
        let mut record = empty_record();
        let err = merge(&mut record, Protocol::Udp, wire(53), PortMapping::default()).unwrap_err();
        assert!(matches!(err, UpdateError::InternalConsistency(_)));
        assert_eq!(record.udp_index_count, 0);
    }
}
