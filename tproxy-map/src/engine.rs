//! Validate -> Fetch -> Merge -> Persist pipeline for a single rule update.
//!
//! Each stage consumes the previous stage's value and returns the next one,
//! so a failed stage ends the update with nothing written. Persist is the
//! only mutation of the map.
//!
//! Fetch and Persist are separate map operations with no lock between them.
//! Two concurrent updates of the same key can both fetch the same record and
//! the later persist wins, dropping the other update's port. With
//! [`PersistMode::CompareAndSwap`] the second writer fails with
//! [`UpdateError::Conflict`] instead, except in the narrow gap left by
//! [`StoreClient::compare_and_put`].

use std::fmt;

use tracing::{debug, warn};

use tproxy_map_common::{PortMapping, RuleKey, RuleRecord};

use crate::codec::{parse_ip, parse_port, parse_prefix_length, parse_protocol};
use crate::error::UpdateError;
use crate::merge::merge;
use crate::model::{Protocol, duplicate_record, fresh_record, port_of};
use crate::store::{StoreClient, StoreError};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    Validate,
    Fetch,
    Merge,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validate => "validate",
            Self::Fetch => "fetch",
            Self::Merge => "merge",
            Self::Persist => "persist",
        };
        f.write_str(name)
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum PersistMode {
    /// Plain `put`; last writer wins.
    #[default]
    Overwrite,
    /// `compare_and_put` against the record seen by Fetch.
    CompareAndSwap,
}

/// Rule arguments as given on the command line.
#[derive(Clone, Debug)]
pub struct UpdateRequest {
    pub destination: String,
    pub prefix_length: String,
    pub dst_port: String,
    pub src_port: String,
    pub proxy_port: String,
    pub protocol: String,
    pub proxy_ip: String,
}

/// Output of Validate: wire-format key and mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Validated {
    pub key: RuleKey,
    /// Raw protocol number; only checked against TCP/UDP in Merge.
    pub protocol: u8,
    /// Mapping slot, i.e. the destination port in network byte order.
    pub slot: u16,
    pub mapping: PortMapping,
}

/// Output of Fetch: the merge base.
pub struct Fetched {
    validated: Validated,
    record: Box<RuleRecord>,
    /// Record as fetched, kept only for compare-and-swap.
    snapshot: Option<Box<RuleRecord>>,
    existed: bool,
}

/// Output of Merge: the full record to write back.
pub struct Merged {
    key: RuleKey,
    protocol: Protocol,
    slot: u16,
    record: Box<RuleRecord>,
    snapshot: Option<Box<RuleRecord>>,
    created: bool,
    slot_added: bool,
}

/// Result of a completed update.
#[derive(Debug)]
pub struct Outcome {
    pub key: RuleKey,
    pub protocol: Protocol,
    /// Host-order destination port of the mapping.
    pub port: u16,
    /// No record existed for the key before this update.
    pub created: bool,
    /// The port was not indexed before this update.
    pub slot_added: bool,
    pub record: Box<RuleRecord>,
}

/// Parses and range-checks every argument. No map access happens here.
pub fn validate(request: &UpdateRequest) -> Result<Validated, UpdateError> {
    let protocol = parse_protocol(&request.protocol)?;
    let destination_ip = parse_ip(&request.destination)?;
    let prefix_length = parse_prefix_length(&request.prefix_length)?;
    let key = RuleKey::new(destination_ip, prefix_length);

    if prefix_length < 32 && u32::from_be(destination_ip) & (u32::MAX >> prefix_length) != 0 {
        warn!(
            destination = %request.destination,
            prefix_length,
            "destination has host bits set beyond the prefix; stored as given"
        );
    }

    let dst_port = parse_port(&request.dst_port)?;
    let src_port = parse_port(&request.src_port)?;
    let proxy_port = parse_port(&request.proxy_port)?;
    let proxy_ip = parse_ip(&request.proxy_ip)?;

    Ok(Validated {
        key,
        protocol,
        slot: dst_port,
        mapping: PortMapping::new(dst_port, src_port, proxy_port, proxy_ip),
    })
}

/// Merges the fetched record with the requested mapping.
pub fn merge_fetched(fetched: Fetched) -> Result<Merged, UpdateError> {
    let Fetched {
        validated,
        mut record,
        snapshot,
        existed,
    } = fetched;
    let protocol = Protocol::try_from(validated.protocol)?;
    let slot_added = merge(&mut record, protocol, validated.slot, validated.mapping)?;
    debug!(
        key = %validated.key,
        %protocol,
        port = port_of(validated.slot),
        slot_added,
        "merged mapping into rule record"
    );
    Ok(Merged {
        key: validated.key,
        protocol,
        slot: validated.slot,
        record,
        snapshot,
        created: !existed,
        slot_added,
    })
}

/// Runs the update pipeline against one store.
pub struct UpdateEngine<S> {
    store: S,
    mode: PersistMode,
}

impl<S: StoreClient> UpdateEngine<S> {
    pub fn new(store: S, mode: PersistMode) -> Self {
        Self { store, mode }
    }

    /// Fetch, Merge and Persist an already validated update.
    pub fn apply(&mut self, validated: Validated) -> Result<Outcome, UpdateError> {
        let fetched = self.fetch(validated)?;
        let merged = merge_fetched(fetched)?;
        self.persist(merged)
    }

    /// Reads the current record; a miss yields a fresh one.
    pub fn fetch(&self, validated: Validated) -> Result<Fetched, UpdateError> {
        let key = validated.key;
        let stored = self
            .store
            .get(&key)
            .map_err(|source| UpdateError::StoreLookup {
                key: key.to_string(),
                source,
            })?;

        let fetched = match stored {
            Some(record) => {
                debug!(%key, "rule record found");
                let snapshot = match self.mode {
                    PersistMode::CompareAndSwap => Some(duplicate_record(&record)),
                    PersistMode::Overwrite => None,
                };
                Fetched {
                    validated,
                    record,
                    snapshot,
                    existed: true,
                }
            }
            None => {
                debug!(%key, "no rule record, starting from an empty one");
                Fetched {
                    validated,
                    record: fresh_record(&key),
                    snapshot: None,
                    existed: false,
                }
            }
        };
        Ok(fetched)
    }

    /// Writes the merged record back as a whole.
    pub fn persist(&mut self, merged: Merged) -> Result<Outcome, UpdateError> {
        let key = merged.key;
        let result = match self.mode {
            PersistMode::Overwrite => self.store.put(&key, &merged.record),
            PersistMode::CompareAndSwap => {
                self.store
                    .compare_and_put(&key, merged.snapshot.as_deref(), &merged.record)
            }
        };
        result.map_err(|source| match source {
            StoreError::Conflict => UpdateError::Conflict {
                key: key.to_string(),
            },
            source @ StoreError::Lookup(_) => UpdateError::StoreLookup {
                key: key.to_string(),
                source,
            },
            source @ StoreError::Write(_) => UpdateError::StoreWrite {
                key: key.to_string(),
                source,
            },
        })?;
        debug!(%key, mode = ?self.mode, "rule record written");

        Ok(Outcome {
            key,
            protocol: merged.protocol,
            port: port_of(merged.slot),
            created: merged.created,
            slot_added: merged.slot_added,
            record: merged.record,
        })
    }
}
