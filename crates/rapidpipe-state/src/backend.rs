//! Quarantine store trait definition.
//!
//! [`QuarantineStore`] defines the storage contract for records of failed
//! partitions. Model types live in [`rapidpipe_types::quarantine`].

use rapidpipe_types::ids::{PipeId, QuarantineLocation};
use rapidpipe_types::quarantine::QuarantineRecord;

use crate::error;

/// Storage contract for quarantined records.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn QuarantineStore>`.
pub trait QuarantineStore: Send + Sync {
    /// Durably append a batch of quarantined records. Returns the count inserted.
    ///
    /// The batch is appended atomically: either every record lands or none do.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn append(&self, pipe: &PipeId, records: &[QuarantineRecord]) -> error::Result<u64>;

    /// Load every record appended to `location`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn load(&self, location: &QuarantineLocation) -> error::Result<Vec<QuarantineRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (can be used as `dyn QuarantineStore`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn QuarantineStore) {}
    }
}
