//! Process configuration for the `streamfold` binary.
//!
//! Every option can be given as a flag or through its environment
//! variable; the flag wins when both are present.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;
use crate::processor::changelog_topic;

/// Emit clicks, count them per user, and serve the counts over HTTP.
#[derive(Debug, Clone, Parser)]
#[command(name = "streamfold", version, about)]
pub struct Config {
    /// Topic the emitter publishes clicks to.
    #[arg(long, env = "STREAMFOLD_PRODUCER_TOPIC", default_value = "clicks")]
    pub topic: String,

    /// Topic the processor consumes.
    #[arg(long, env = "STREAMFOLD_CONSUMER_TOPIC", default_value = "clicks")]
    pub consume: String,

    /// Consumer group name. A random one is generated once per process
    /// when unset.
    #[arg(long, env = "STREAMFOLD_CONSUMER_GROUP", default_value_t = uuid::Uuid::new_v4().to_string())]
    pub group: String,

    /// Host the query server binds to.
    #[arg(long, env = "STREAMFOLD_HOST", default_value = "localhost")]
    pub host: String,

    /// Port the query server binds to.
    #[arg(long, env = "STREAMFOLD_PORT", default_value_t = 9999)]
    pub port: u16,

    /// Partition count for newly created topics.
    #[arg(long, env = "STREAMFOLD_PARTITIONS", default_value_t = 4)]
    pub partitions: u32,

    /// Directory for log segments, offsets and snapshots. Everything stays
    /// in memory when unset.
    #[arg(long, env = "STREAMFOLD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Milliseconds between emitted clicks.
    #[arg(long, env = "STREAMFOLD_EMIT_INTERVAL_MS", default_value_t = 100)]
    pub emit_interval_ms: u64,

    /// Number of distinct user keys the emitter rotates through.
    #[arg(long, env = "STREAMFOLD_KEYS", default_value_t = 10)]
    pub keys: u64,
}

impl Config {
    /// `host:port` for the query server.
    pub fn srv_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Emitter tick interval.
    pub fn emit_interval(&self) -> Duration {
        Duration::from_millis(self.emit_interval_ms)
    }

    /// Changelog topic the processor writes and the view reads.
    pub fn changelog_topic(&self) -> String {
        changelog_topic(&self.group)
    }

    /// Reject settings the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// * [`ConfigError::Empty`] -- a topic, group or host is empty.
    /// * [`ConfigError::Zero`] -- partitions, keys or the emit interval is zero.
    /// * [`ConfigError::TopicCollision`] -- an input topic is also the
    ///   changelog topic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("topic", &self.topic),
            ("consume", &self.consume),
            ("group", &self.group),
            ("host", &self.host),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Empty { name });
            }
        }
        for (name, value) in [
            ("partitions", u64::from(self.partitions)),
            ("keys", self.keys),
            ("emit-interval-ms", self.emit_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        let changelog = self.changelog_topic();
        for topic in [&self.topic, &self.consume] {
            if *topic == changelog {
                return Err(ConfigError::TopicCollision(topic.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["streamfold"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).expect("parse")
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--topic",
            "in",
            "--consume",
            "in",
            "--group",
            "counters",
            "--host",
            "0.0.0.0",
            "--port",
            "8080",
            "--partitions",
            "2",
            "--data-dir",
            "/tmp/streamfold",
        ]);
        assert_eq!(config.topic, "in");
        assert_eq!(config.group, "counters");
        assert_eq!(config.partitions, 2);
        assert_eq!(config.srv_addr(), "0.0.0.0:8080");
        assert_eq!(config.changelog_topic(), "counters-table");
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/streamfold")));
        config.validate().expect("valid");
    }

    #[test]
    fn unset_group_gets_a_generated_name() {
        let config = parse(&["--port", "1"]);
        uuid::Uuid::parse_str(&config.group).expect("generated group is a uuid");
        config.validate().expect("valid");
    }

    #[test]
    fn emit_interval_is_milliseconds() {
        let config = parse(&["--emit-interval-ms", "250"]);
        assert_eq!(config.emit_interval(), Duration::from_millis(250));
    }

    #[test]
    fn rejects_bad_port() {
        assert!(Config::try_parse_from(["streamfold", "--port", "99999"]).is_err());
    }

    #[test]
    fn validate_rejects_zero_partitions() {
        let config = parse(&["--partitions", "0"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero { name: "partitions" })
        ));
    }

    #[test]
    fn validate_rejects_empty_topic() {
        let config = parse(&["--topic", ""]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Empty { name: "topic" })
        ));
    }

    #[test]
    fn validate_rejects_changelog_collision() {
        let config = parse(&["--group", "g", "--consume", "g-table"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TopicCollision(topic)) if topic == "g-table"
        ));
    }
}
