use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "http://localhost:8085")]
    pub schema_registry_url: String,

    #[envconfig(default = "5000")]
    pub schema_registry_timeout_ms: EnvMsDuration,

    // A subscription that has not reported within this deadline is considered stalled
    #[envconfig(default = "60000")]
    pub subscription_liveness_deadline_ms: EnvMsDuration,

    #[envconfig(default = "dev.admin.cdc.project.0")]
    pub project_topic: String,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:39092")]
    pub kafka_hosts: String,

    #[envconfig(default = "stream-broker")]
    pub kafka_consumer_group: String,

    // earliest, latest
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_millisecond_durations() {
        let parsed: EnvMsDuration = "1500".parse().unwrap();
        assert_eq!(parsed.0, time::Duration::from_millis(1500));

        assert_eq!(
            "1.5s".parse::<EnvMsDuration>().unwrap_err(),
            ParseEnvMsDurationError
        );
    }

    #[test]
    fn bind_joins_host_and_port() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 3302,
            kafka: KafkaConfig {
                kafka_hosts: "localhost:9092".to_string(),
                kafka_consumer_group: "group".to_string(),
                kafka_consumer_offset_reset: "earliest".to_string(),
                kafka_tls: false,
                kafka_producer_linger_ms: 0,
                kafka_producer_queue_mib: 50,
                kafka_message_timeout_ms: 5000,
                kafka_compression_codec: "none".to_string(),
            },
            schema_registry_url: "http://localhost:8085".to_string(),
            schema_registry_timeout_ms: EnvMsDuration(time::Duration::from_secs(5)),
            subscription_liveness_deadline_ms: EnvMsDuration(time::Duration::from_secs(60)),
            project_topic: "projects".to_string(),
        };

        assert_eq!(config.bind(), "127.0.0.1:3302");
    }
}
