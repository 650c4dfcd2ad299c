use envconfig::Envconfig;

/// Transport tuning read from the environment. Every default matches the
/// values the harness has always run with, so an empty environment behaves
/// like the reference setup.
#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "2.6.0")]
    pub kafka_protocol_version: String, // broker protocol version to assume, major.minor.patch

    #[envconfig(default = "kafka-harness")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "sticky")]
    pub kafka_rebalance_strategy: String, // sticky, range, roundrobin

    // Where a partition with no committed offset starts
    #[envconfig(default = "oldest")]
    pub kafka_consumer_offset_initial: String, // oldest, newest

    #[envconfig(default = "10000000")]
    pub kafka_consumer_offset_retention_minutes: i64,

    #[envconfig(default = "100")]
    pub kafka_fetch_max_records: i64,

    #[envconfig(default = "1048576")]
    pub kafka_fetch_max_bytes: i64,

    #[envconfig(default = "100")]
    pub kafka_fetch_max_wait_ms: i64,

    // Consumer batch thresholds for the batch and multiBatch modes
    #[envconfig(default = "100")]
    pub kafka_consumer_batch_size: i64,

    #[envconfig(default = "1000")]
    pub kafka_consumer_batch_window_ms: i64,

    #[envconfig(default = "snappy")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "all")]
    pub kafka_required_acks: String, // none, leader, all

    #[envconfig(default = "false")]
    pub kafka_enable_idempotence: bool,

    #[envconfig(default = "100")]
    pub kafka_flush_max_messages: i64,

    #[envconfig(default = "1")]
    pub kafka_flush_frequency_ms: i64,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: i64, // Maximum time between producer batches during low traffic

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: i64, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "10000")]
    pub kafka_drain_timeout_ms: i64,

    #[envconfig(default = "1000")]
    pub kafka_claim_retry_backoff_ms: i64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            kafka_protocol_version: "2.6.0".to_string(),
            kafka_consumer_group: "kafka-harness".to_string(),
            kafka_rebalance_strategy: "sticky".to_string(),
            kafka_consumer_offset_initial: "oldest".to_string(),
            kafka_consumer_offset_retention_minutes: 10_000_000,
            kafka_fetch_max_records: 100,
            kafka_fetch_max_bytes: 1_048_576,
            kafka_fetch_max_wait_ms: 100,
            kafka_consumer_batch_size: 100,
            kafka_consumer_batch_window_ms: 1000,
            kafka_compression_codec: "snappy".to_string(),
            kafka_required_acks: "all".to_string(),
            kafka_enable_idempotence: false,
            kafka_flush_max_messages: 100,
            kafka_flush_frequency_ms: 1,
            kafka_producer_linger_ms: 20,
            kafka_message_timeout_ms: 20000,
            kafka_drain_timeout_ms: 10000,
            kafka_claim_retry_backoff_ms: 1000,
        }
    }
}
