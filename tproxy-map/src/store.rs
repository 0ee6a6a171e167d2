use thiserror::Error;
use tproxy_map_common::{RuleKey, RuleRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("map lookup failed: {0}")]
    Lookup(String),

    #[error("map update failed: {0}")]
    Write(String),

    #[error("stored record differs from the fetched one")]
    Conflict,
}

/// Whole-record access to the rule map.
///
/// There is no field-level update: a rule change is always a full `get`,
/// an in-memory merge and a full `put`. Nothing serialises a `get` with the
/// following `put`, so two writers that fetch the same record both succeed
/// and the later `put` silently drops the earlier writer's merge.
pub trait StoreClient {
    /// `Ok(None)` means no record exists for `key` yet.
    fn get(&self, key: &RuleKey) -> Result<Option<Box<RuleRecord>>, StoreError>;

    /// Creates or replaces the record for `key`.
    fn put(&mut self, key: &RuleKey, record: &RuleRecord) -> Result<(), StoreError>;

    /// Writes `record` only if the stored value still equals `expected`
    /// (`None` meaning absent), otherwise fails with [`StoreError::Conflict`].
    ///
    /// This re-reads right before writing, which shrinks the lost-update
    /// window to the gap between that read and the write but cannot close
    /// it: BPF hash maps have no compare-and-swap for values.
    fn compare_and_put(
        &mut self,
        key: &RuleKey,
        expected: Option<&RuleRecord>,
        record: &RuleRecord,
    ) -> Result<(), StoreError> {
        let current = self.get(key)?;
        let unchanged = match (current.as_deref(), expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => current == expected,
            _ => false,
        };
        if !unchanged {
            return Err(StoreError::Conflict);
        }
        self.put(key, record)
    }
}
