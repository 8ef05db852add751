//! Queue configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Error returned for invalid or unreadable configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("topic '{0}' is used for more than one role")]
    DuplicateTopic(String),

    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },
}

/// Options recognized by the task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Broker address. The SQLite log store reads it as a database URL.
    pub bootstrap_servers: String,
    pub group_id: String,
    pub primary_topic: String,
    pub delayed_topic: String,
    /// Where tasks go once `max_task_retries` is exhausted. Dropped if unset.
    pub dead_letter_topic: Option<String>,
    /// Drain period of the delayed topic, and the pause between drained records.
    #[serde(rename = "delayed_base_ms", with = "duration_ms")]
    pub delayed_base: Duration,
    pub max_parallel_tasks: usize,
    pub intake_capacity: usize,
    #[serde(rename = "poll_timeout_ms", with = "duration_ms")]
    pub poll_timeout: Duration,
    /// Pause after a failed poll before trying again.
    #[serde(rename = "error_pause_ms", with = "duration_ms")]
    pub error_pause: Duration,
    pub max_task_retries: u32,
    pub republish_attempts: u32,
    #[serde(rename = "republish_budget_ms", with = "duration_ms")]
    pub republish_budget: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "sqlite::memory:".to_string(),
            group_id: "tasklog".to_string(),
            primary_topic: "tasks".to_string(),
            delayed_topic: "tasks-delayed-1".to_string(),
            dead_letter_topic: None,
            delayed_base: Duration::from_secs(60),
            max_parallel_tasks: 100,
            intake_capacity: 10_000,
            poll_timeout: Duration::from_secs(1),
            error_pause: Duration::from_secs(1),
            max_task_retries: 10,
            republish_attempts: 5,
            republish_budget: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// Defaults overridden by `TASKLOG_<FIELD>` environment variables.
    ///
    /// Durations are given in milliseconds, e.g. `TASKLOG_DELAYED_BASE_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Like [`from_env`](Self::from_env) over an explicit variable list.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();
        for (var, value) in vars {
            let Some(field) = var.strip_prefix("TASKLOG_") else {
                continue;
            };
            config.apply(field, &var, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, field: &str, var: &str, value: String) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.clone(),
        };
        let millis = |v: &str| v.parse::<u64>().map(Duration::from_millis).map_err(|_| invalid());

        match field {
            "BOOTSTRAP_SERVERS" => self.bootstrap_servers = value.clone(),
            "GROUP_ID" => self.group_id = value.clone(),
            "PRIMARY_TOPIC" => self.primary_topic = value.clone(),
            "DELAYED_TOPIC" => self.delayed_topic = value.clone(),
            "DEAD_LETTER_TOPIC" => {
                self.dead_letter_topic = Some(value.clone()).filter(|t| !t.is_empty())
            }
            "DELAYED_BASE_MS" => self.delayed_base = millis(&value)?,
            "MAX_PARALLEL_TASKS" => {
                self.max_parallel_tasks = value.parse().map_err(|_| invalid())?
            }
            "INTAKE_CAPACITY" => self.intake_capacity = value.parse().map_err(|_| invalid())?,
            "POLL_TIMEOUT_MS" => self.poll_timeout = millis(&value)?,
            "ERROR_PAUSE_MS" => self.error_pause = millis(&value)?,
            "MAX_TASK_RETRIES" => self.max_task_retries = value.parse().map_err(|_| invalid())?,
            "REPUBLISH_ATTEMPTS" => {
                self.republish_attempts = value.parse().map_err(|_| invalid())?
            }
            "REPUBLISH_BUDGET_MS" => self.republish_budget = millis(&value)?,
            _ => {}
        }
        Ok(())
    }

    /// Check values that would stall or confuse the queue.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group_id.is_empty() {
            return Err(ConfigError::Empty { field: "group_id" });
        }
        if self.primary_topic.is_empty() {
            return Err(ConfigError::Empty {
                field: "primary_topic",
            });
        }
        if self.delayed_topic.is_empty() {
            return Err(ConfigError::Empty {
                field: "delayed_topic",
            });
        }
        if self.max_parallel_tasks == 0 {
            return Err(ConfigError::Zero {
                field: "max_parallel_tasks",
            });
        }
        if self.intake_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "intake_capacity",
            });
        }
        if self.delayed_base.is_zero() {
            return Err(ConfigError::Zero {
                field: "delayed_base_ms",
            });
        }
        if self.republish_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "republish_attempts",
            });
        }

        if self.primary_topic == self.delayed_topic {
            return Err(ConfigError::DuplicateTopic(self.primary_topic.clone()));
        }
        if let Some(dead_letter) = &self.dead_letter_topic {
            if dead_letter == &self.primary_topic || dead_letter == &self.delayed_topic {
                return Err(ConfigError::DuplicateTopic(dead_letter.clone()));
            }
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = QueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.delayed_base, Duration::from_secs(60));
        assert_eq!(config.max_parallel_tasks, 100);
        assert_eq!(config.intake_capacity, 10_000);
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: QueueConfig = serde_json::from_str(
            r#"{"group_id": "crawler", "delayed_base_ms": 250, "dead_letter_topic": "tasks-dead"}"#,
        )
        .unwrap();

        assert_eq!(config.group_id, "crawler");
        assert_eq!(config.delayed_base, Duration::from_millis(250));
        assert_eq!(config.dead_letter_topic.as_deref(), Some("tasks-dead"));
        assert_eq!(config.primary_topic, "tasks");
    }

    #[test]
    fn test_env_overrides() {
        let config = QueueConfig::from_vars(vars(&[
            ("TASKLOG_GROUP_ID", "workers"),
            ("TASKLOG_MAX_PARALLEL_TASKS", "8"),
            ("TASKLOG_REPUBLISH_BUDGET_MS", "1500"),
            ("PATH", "/usr/bin"),
        ]))
        .unwrap();

        assert_eq!(config.group_id, "workers");
        assert_eq!(config.max_parallel_tasks, 8);
        assert_eq!(config.republish_budget, Duration::from_millis(1500));
    }

    #[test]
    fn test_env_rejects_bad_numbers() {
        let err = QueueConfig::from_vars(vars(&[("TASKLOG_INTAKE_CAPACITY", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                var: "TASKLOG_INTAKE_CAPACITY".to_string(),
                value: "lots".to_string()
            }
        );
    }

    #[test]
    fn test_validate_rejects_shared_topics_and_zeroes() {
        let config = QueueConfig {
            delayed_topic: "tasks".to_string(),
            ..QueueConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateTopic("tasks".to_string()))
        );

        let config = QueueConfig {
            max_parallel_tasks: 0,
            ..QueueConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "max_parallel_tasks"
            })
        );
    }
}
