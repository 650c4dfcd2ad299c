/// Rebalance callbacks by event type (assign, revoke, error)
pub const REBALANCE_EVENTS: &str = "kafka_rebalance_events_total";

/// Rebalance callbacks with an empty partition list, common with cooperative-sticky
pub const REBALANCE_EMPTY_SKIPPED: &str = "kafka_rebalance_empty_skipped_total";

/// Errors returned by the consumer poll loop
pub const CONSUMER_RECV_ERRORS: &str = "kafka_consumer_recv_errors_total";

/// Messages dropped because their partition is no longer owned
pub const CONSUMER_UNOWNED_DROPPED: &str = "kafka_consumer_unowned_dropped_total";

/// Partitions paused because their reader fell behind
pub const CONSUMER_PARTITION_PAUSES: &str = "kafka_consumer_partition_pauses_total";

/// Offsets committed to the group coordinator
pub const CONSUMER_COMMITS: &str = "kafka_consumer_commits_total";

/// Messages waiting in the librdkafka producer queue
pub const PRODUCER_QUEUE_MESSAGES: &str = "kafka_producer_queue_messages";

/// Records whose delivery failed
pub const PRODUCER_DELIVERY_ERRORS: &str = "kafka_producer_delivery_errors_total";
