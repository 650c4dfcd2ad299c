use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rdkafka::ClientConfig;

use crate::config::KafkaConfig;
use crate::credential::Credential;
use crate::error::ConfigError;
use crate::session::FetchOptions;
use crate::tls::TlsContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl FromStr for ProtocolVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split('.')
            .map(str::parse::<u16>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigError::tuning("kafka_protocol_version", format!("{s}: {e}")))?;
        match parts.as_slice() {
            [major, minor, patch] => Ok(Self {
                major: *major,
                minor: *minor,
                patch: *patch,
            }),
            _ => Err(ConfigError::tuning(
                "kafka_protocol_version",
                format!("{s}: expected major.minor.patch"),
            )),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceStrategy {
    Sticky,
    Range,
    RoundRobin,
}

impl RebalanceStrategy {
    pub fn as_rdkafka(&self) -> &'static str {
        match self {
            RebalanceStrategy::Sticky => "cooperative-sticky",
            RebalanceStrategy::Range => "range",
            RebalanceStrategy::RoundRobin => "roundrobin",
        }
    }
}

impl FromStr for RebalanceStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sticky" => Ok(RebalanceStrategy::Sticky),
            "range" => Ok(RebalanceStrategy::Range),
            "roundrobin" => Ok(RebalanceStrategy::RoundRobin),
            _ => Err(ConfigError::tuning(
                "kafka_rebalance_strategy",
                format!("unknown strategy {s}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialOffset {
    Oldest,
    Newest,
}

impl InitialOffset {
    pub fn as_rdkafka(&self) -> &'static str {
        match self {
            InitialOffset::Oldest => "earliest",
            InitialOffset::Newest => "latest",
        }
    }
}

impl FromStr for InitialOffset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "oldest" | "earliest" => Ok(InitialOffset::Oldest),
            "newest" | "latest" => Ok(InitialOffset::Newest),
            _ => Err(ConfigError::tuning(
                "kafka_consumer_offset_initial",
                format!("unknown initial offset {s}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_rdkafka(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "snappy" => Ok(Compression::Snappy),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            _ => Err(ConfigError::tuning(
                "kafka_compression_codec",
                format!("unknown codec {s}"),
            )),
        }
    }
}

/// How many replicas must persist a batch before it counts as sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAcks {
    None,
    Leader,
    All,
}

impl RequiredAcks {
    pub fn as_rdkafka(&self) -> &'static str {
        match self {
            RequiredAcks::None => "0",
            RequiredAcks::Leader => "1",
            RequiredAcks::All => "all",
        }
    }
}

impl FromStr for RequiredAcks {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(RequiredAcks::None),
            "leader" | "1" => Ok(RequiredAcks::Leader),
            "all" | "-1" => Ok(RequiredAcks::All),
            _ => Err(ConfigError::tuning(
                "kafka_required_acks",
                format!("unknown acks level {s}"),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupSettings {
    pub group_id: String,
    pub rebalance: RebalanceStrategy,
    pub initial_offset: InitialOffset,
    pub offset_retention: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub size: usize,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct ProducerSettings {
    pub compression: Compression,
    pub acks: RequiredAcks,
    pub idempotent: bool,
    pub flush_max_messages: usize,
    pub flush_frequency: Duration,
    pub linger: Duration,
    pub message_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub drain_timeout: Duration,
    pub claim_retry_backoff: Duration,
}

/// Everything a session needs, assembled once per run and read-only after.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub brokers: String,
    pub credential: Credential,
    pub tls: TlsContext,
    pub protocol_version: ProtocolVersion,
    pub group: GroupSettings,
    pub fetch: FetchOptions,
    pub batch: BatchSettings,
    pub producer: ProducerSettings,
    pub lifecycle: LifecycleSettings,
}

/// Validate tuning and combine it with the secure transport. No I/O.
pub fn build_config(
    brokers: &str,
    credential: Credential,
    tls: TlsContext,
    tuning: &KafkaConfig,
) -> Result<SessionConfig, ConfigError> {
    if brokers.trim().is_empty() {
        return Err(ConfigError::tuning("brokers", "no broker address given"));
    }

    let producer = ProducerSettings {
        compression: tuning.kafka_compression_codec.parse()?,
        acks: tuning.kafka_required_acks.parse()?,
        idempotent: tuning.kafka_enable_idempotence,
        flush_max_messages: count("kafka_flush_max_messages", tuning.kafka_flush_max_messages)?,
        flush_frequency: millis("kafka_flush_frequency_ms", tuning.kafka_flush_frequency_ms)?,
        linger: non_negative_millis("kafka_producer_linger_ms", tuning.kafka_producer_linger_ms)?,
        message_timeout: millis("kafka_message_timeout_ms", tuning.kafka_message_timeout_ms)?,
    };
    if producer.idempotent && producer.acks != RequiredAcks::All {
        return Err(ConfigError::tuning(
            "kafka_enable_idempotence",
            "idempotent production requires kafka_required_acks=all",
        ));
    }

    let retention_minutes = count(
        "kafka_consumer_offset_retention_minutes",
        tuning.kafka_consumer_offset_retention_minutes,
    )?;
    let offset_retention = (retention_minutes as u64)
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| {
            ConfigError::tuning(
                "kafka_consumer_offset_retention_minutes",
                format!("{retention_minutes} minutes is out of range"),
            )
        })?;

    Ok(SessionConfig {
        brokers: brokers.to_string(),
        credential,
        tls,
        protocol_version: tuning.kafka_protocol_version.parse()?,
        group: GroupSettings {
            group_id: non_empty("kafka_consumer_group", &tuning.kafka_consumer_group)?,
            rebalance: tuning.kafka_rebalance_strategy.parse()?,
            initial_offset: tuning.kafka_consumer_offset_initial.parse()?,
            offset_retention,
        },
        fetch: FetchOptions {
            max_wait: millis("kafka_fetch_max_wait_ms", tuning.kafka_fetch_max_wait_ms)?,
            max_records: count("kafka_fetch_max_records", tuning.kafka_fetch_max_records)?,
            max_bytes: count("kafka_fetch_max_bytes", tuning.kafka_fetch_max_bytes)?,
        },
        batch: BatchSettings {
            size: count("kafka_consumer_batch_size", tuning.kafka_consumer_batch_size)?,
            window: millis(
                "kafka_consumer_batch_window_ms",
                tuning.kafka_consumer_batch_window_ms,
            )?,
        },
        producer,
        lifecycle: LifecycleSettings {
            drain_timeout: millis("kafka_drain_timeout_ms", tuning.kafka_drain_timeout_ms)?,
            claim_retry_backoff: non_negative_millis(
                "kafka_claim_retry_backoff_ms",
                tuning.kafka_claim_retry_backoff_ms,
            )?,
        },
    })
}

fn count(field: &'static str, value: i64) -> Result<usize, ConfigError> {
    if value <= 0 {
        return Err(ConfigError::tuning(field, format!("must be positive, got {value}")));
    }
    usize::try_from(value).map_err(|e| ConfigError::tuning(field, e.to_string()))
}

fn millis(field: &'static str, value: i64) -> Result<Duration, ConfigError> {
    count(field, value).map(|ms| Duration::from_millis(ms as u64))
}

fn non_negative_millis(field: &'static str, value: i64) -> Result<Duration, ConfigError> {
    u64::try_from(value)
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::tuning(field, format!("must not be negative, got {value}")))
}

fn non_empty(field: &'static str, value: &str) -> Result<String, ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::tuning(field, "must not be empty"));
    }
    Ok(value.to_string())
}

impl SessionConfig {
    fn base_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.brokers)
            .set("statistics.interval.ms", "10000")
            .set("api.version.request", "true")
            .set("broker.version.fallback", self.protocol_version.to_string())
            .set("security.protocol", "sasl_ssl")
            .set("sasl.mechanisms", self.credential.mechanism().name())
            .set("sasl.username", self.credential.username())
            .set("sasl.password", self.credential.password())
            .set("ssl.certificate.pem", self.tls.certificate_pem())
            .set("ssl.key.pem", self.tls.key_pem())
            .set("ssl.ca.pem", self.tls.ca_pem());

        if self.tls.skip_server_verification() {
            client_config
                .set("enable.ssl.certificate.verification", "false")
                .set("ssl.endpoint.identification.algorithm", "none");
        } else {
            client_config.set("enable.ssl.certificate.verification", "true");
        }
        client_config
    }

    /// librdkafka properties for a group consumer. Offsets are only ever
    /// committed explicitly.
    pub fn consumer_client_config(&self) -> ClientConfig {
        let mut client_config = self.base_client_config();
        client_config
            .set("group.id", &self.group.group_id)
            .set("partition.assignment.strategy", self.group.rebalance.as_rdkafka())
            .set("auto.offset.reset", self.group.initial_offset.as_rdkafka())
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("fetch.wait.max.ms", self.fetch.max_wait.as_millis().to_string())
            .set("max.partition.fetch.bytes", self.fetch.max_bytes.to_string());
        client_config
    }

    pub fn producer_client_config(&self) -> ClientConfig {
        let mut client_config = self.base_client_config();
        client_config
            .set("compression.codec", self.producer.compression.as_rdkafka())
            .set("acks", self.producer.acks.as_rdkafka())
            .set("enable.idempotence", self.producer.idempotent.to_string())
            .set("batch.num.messages", self.producer.flush_max_messages.to_string())
            .set("linger.ms", self.producer.linger.as_millis().to_string())
            .set(
                "message.timeout.ms",
                self.producer.message_timeout.as_millis().to_string(),
            );
        client_config
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::scram::ScramMechanism;
    use crate::tls::configure_transport;

    use super::*;

    fn tls() -> TlsContext {
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../testdata/tls");
        configure_transport(
            &dir.join("client.crt"),
            &dir.join("ca.pem"),
            &dir.join("client.key"),
            false,
        )
        .unwrap()
    }

    fn credential() -> Credential {
        Credential::new("user1", "user1", ScramMechanism::Sha512)
    }

    #[test]
    fn test_defaults_build() {
        let config =
            build_config("127.0.0.1:9092", credential(), tls(), &KafkaConfig::default()).unwrap();

        assert_eq!(config.protocol_version.to_string(), "2.6.0");
        assert_eq!(config.group.rebalance, RebalanceStrategy::Sticky);
        assert_eq!(config.group.initial_offset, InitialOffset::Oldest);
        assert_eq!(
            config.group.offset_retention,
            Duration::from_secs(10_000_000 * 60)
        );
        assert_eq!(config.fetch.max_records, 100);
        assert_eq!(config.fetch.max_wait, Duration::from_millis(100));
        assert_eq!(config.producer.compression, Compression::Snappy);
        assert_eq!(config.producer.acks, RequiredAcks::All);
        assert!(!config.producer.idempotent);
        assert_eq!(config.producer.flush_max_messages, 100);
        assert_eq!(config.producer.flush_frequency, Duration::from_millis(1));
    }

    #[test]
    fn test_rejects_negative_fetch_size() {
        let tuning = KafkaConfig {
            kafka_fetch_max_records: -1,
            ..KafkaConfig::default()
        };
        let err = build_config("127.0.0.1:9092", credential(), tls(), &tuning).unwrap_err();
        assert!(
            matches!(
                err,
                ConfigError::InvalidTuning {
                    field: "kafka_fetch_max_records",
                    ..
                }
            ),
            "{err}"
        );
    }

    #[test]
    fn test_rejects_out_of_range_offset_retention() {
        let tuning = KafkaConfig {
            kafka_consumer_offset_retention_minutes: i64::MAX,
            ..KafkaConfig::default()
        };
        let err = build_config("127.0.0.1:9092", credential(), tls(), &tuning).unwrap_err();
        assert!(
            matches!(
                err,
                ConfigError::InvalidTuning {
                    field: "kafka_consumer_offset_retention_minutes",
                    ..
                }
            ),
            "{err}"
        );
    }

    #[test]
    fn test_rejects_idempotence_without_full_acks() {
        let tuning = KafkaConfig {
            kafka_enable_idempotence: true,
            kafka_required_acks: "leader".to_string(),
            ..KafkaConfig::default()
        };
        assert!(build_config("127.0.0.1:9092", credential(), tls(), &tuning).is_err());

        let tuning = KafkaConfig {
            kafka_enable_idempotence: true,
            ..KafkaConfig::default()
        };
        let config = build_config("127.0.0.1:9092", credential(), tls(), &tuning).unwrap();
        assert!(config.producer.idempotent);
    }

    #[test]
    fn test_rejects_unknown_enums_and_versions() {
        for tuning in [
            KafkaConfig {
                kafka_compression_codec: "brotli".to_string(),
                ..KafkaConfig::default()
            },
            KafkaConfig {
                kafka_rebalance_strategy: "random".to_string(),
                ..KafkaConfig::default()
            },
            KafkaConfig {
                kafka_protocol_version: "2.6".to_string(),
                ..KafkaConfig::default()
            },
            KafkaConfig {
                kafka_consumer_group: " ".to_string(),
                ..KafkaConfig::default()
            },
        ] {
            assert!(build_config("127.0.0.1:9092", credential(), tls(), &tuning).is_err());
        }
        assert!(build_config("", credential(), tls(), &KafkaConfig::default()).is_err());
    }

    #[test]
    fn test_renders_rdkafka_properties() {
        let config =
            build_config("broker:9093", credential(), tls(), &KafkaConfig::default()).unwrap();

        let consumer = config.consumer_client_config();
        assert_eq!(consumer.get("bootstrap.servers"), Some("broker:9093"));
        assert_eq!(consumer.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(consumer.get("sasl.mechanisms"), Some("SCRAM-SHA-512"));
        assert_eq!(consumer.get("sasl.username"), Some("user1"));
        assert_eq!(
            consumer.get("partition.assignment.strategy"),
            Some("cooperative-sticky")
        );
        assert_eq!(consumer.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(consumer.get("enable.auto.commit"), Some("false"));
        assert_eq!(consumer.get("fetch.wait.max.ms"), Some("100"));
        assert_eq!(
            consumer.get("enable.ssl.certificate.verification"),
            Some("true")
        );

        let producer = config.producer_client_config();
        assert_eq!(producer.get("compression.codec"), Some("snappy"));
        assert_eq!(producer.get("acks"), Some("all"));
        assert_eq!(producer.get("enable.idempotence"), Some("false"));
        assert_eq!(producer.get("batch.num.messages"), Some("100"));
        assert_eq!(producer.get("group.id"), None);
    }

    #[test]
    fn test_acks_parsing() {
        assert_eq!("none".parse::<RequiredAcks>().unwrap(), RequiredAcks::None);
        assert_eq!("1".parse::<RequiredAcks>().unwrap(), RequiredAcks::Leader);
        assert_eq!("-1".parse::<RequiredAcks>().unwrap(), RequiredAcks::All);
        assert!("most".parse::<RequiredAcks>().is_err());
    }
}
