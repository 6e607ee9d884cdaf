use rdkafka::error::KafkaError;
use thiserror::Error;

/// Failures talking to the remote schema registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("schema registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("schema registry answered {status} for {resource}")]
    Status { resource: String, status: u16 },
    #[error("no schema registered for {0}")]
    NotFound(String),
    #[error("schema {id} is not a valid avro schema: {error}")]
    InvalidSchema {
        id: u32,
        #[source]
        error: apache_avro::Error,
    },
}

/// Errors surfaced synchronously to callers of `produce`. None of them are retried.
#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("producer used before the broker was started")]
    NotStarted,
    #[error("no schema available for topic {topic}: {error}")]
    SchemaUnavailable {
        topic: String,
        #[source]
        error: RegistryError,
    },
    #[error("message does not match the latest schema of topic {topic}: {error}")]
    SchemaMismatch {
        topic: String,
        #[source]
        error: apache_avro::Error,
    },
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to produce to kafka (timeout)")]
    Canceled,
}

/// Every way a consumed payload can fail to become a domain object.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("record has no payload")]
    EmptyPayload,
    #[error("payload of {0} bytes is shorter than the schema header")]
    Truncated(usize),
    #[error("unknown magic byte {0}")]
    UnknownMagicByte(u8),
    #[error("writer schema {id} unavailable: {error}")]
    SchemaUnavailable {
        id: u32,
        #[source]
        error: RegistryError,
    },
    #[error("payload does not match writer schema {id}: {error}")]
    Avro {
        id: u32,
        #[source]
        error: apache_avro::Error,
    },
    #[error("payload does not fit {target}: {error}")]
    TargetType {
        target: &'static str,
        #[source]
        error: apache_avro::Error,
    },
}

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("failed to commit offsets: {0}")]
    Kafka(#[from] KafkaError),
    #[error("offset commit task aborted")]
    Aborted,
}

/// Why a batch window gave up on its buffer. Any of these terminates the subscription.
#[derive(Error, Debug)]
pub enum FlushError {
    #[error("failed to deserialize record {topic}/{partition}@{offset}: {error}")]
    Deserialization {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        error: DecodeError,
    },
    #[error("handler failed: {0:#}")]
    Processing(anyhow::Error),
    #[error(transparent)]
    Commit(#[from] CommitError),
}

impl FlushError {
    pub fn is_deserialization(&self) -> bool {
        matches!(self, FlushError::Deserialization { .. })
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("max batch size for {0} must be at least 1")]
    ZeroBatchSize(String),
    #[error("window for {0} must be longer than zero")]
    ZeroWindow(String),
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka client error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("broker was already started")]
    AlreadyStarted,
}
