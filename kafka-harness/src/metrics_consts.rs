// ==== Consumption ====
/// Records handed to the processor without error
pub const RECORDS_PROCESSED: &str = "harness_records_processed_total";

/// Records the processor rejected
pub const PROCESSING_FAILURES: &str = "harness_processing_failures_total";

/// Offsets committed, labelled by mode
pub const OFFSETS_COMMITTED: &str = "harness_offsets_committed_total";

/// Uncommitted records dropped because their partition was revoked
pub const REVOKED_RECORDS_DISCARDED: &str = "harness_revoked_records_discarded_total";

/// Partition claims aborted and scheduled for reopening
pub const CLAIMS_ABORTED: &str = "harness_claims_aborted_total";

/// Gauge of partitions with an active claim
pub const ACTIVE_CLAIMS: &str = "harness_active_claims";

// ==== Production ====
/// Records handed to the transport in acknowledged batches
pub const RECORDS_PRODUCED: &str = "harness_records_produced_total";

/// Batches flushed, labelled by trigger (size, interval, drain)
pub const BATCHES_FLUSHED: &str = "harness_batches_flushed_total";

/// Batches the transport rejected
pub const FLUSH_FAILURES: &str = "harness_flush_failures_total";

/// Records dropped because the drain deadline passed
pub const DRAIN_DROPPED_RECORDS: &str = "harness_drain_dropped_records_total";

/// Synthetic records emitted by the generator
pub const RECORDS_GENERATED: &str = "harness_records_generated_total";
