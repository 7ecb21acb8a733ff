//! Proptest strategies for batch lifecycle properties.

use argus_core::domain::BatchStatus;
use proptest::prelude::*;
use uuid::Uuid;

pub fn batch_status_strategy() -> impl Strategy<Value = BatchStatus> {
    prop::sample::select(BatchStatus::ALL.to_vec())
}

/// Arbitrary sequences of attempted transitions, legal or not.
pub fn transition_attempts_strategy() -> impl Strategy<Value = Vec<BatchStatus>> {
    prop::collection::vec(batch_status_strategy(), 0..24)
}

pub fn file_id_strategy() -> impl Strategy<Value = Uuid> {
    any::<u128>().prop_map(Uuid::from_u128)
}

/// File ids with deliberate repeats, as produced by at-least-once redelivery.
pub fn redelivered_file_ids_strategy() -> impl Strategy<Value = Vec<Uuid>> {
    prop::collection::vec(0u128..12, 1..40)
        .prop_map(|seeds| seeds.into_iter().map(|s| Uuid::from_u128(s + 1)).collect())
}
