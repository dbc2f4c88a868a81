use std::collections::HashMap;
use std::time::Duration;

use config::{builder::DefaultState, Config as ConfigLib, ConfigBuilder, ConfigError, Environment};
use serde::Deserialize;

use crate::dispatcher::DispatcherConfig;
use crate::retry::{RetryPolicy, StatusPolicy};
use crate::worker::WorkerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub worker: WorkerSettings,
    pub dispatcher: DispatcherSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub concurrency: usize,
    /// Kill deliveries on permanent 4xx instead of retrying them.
    pub strict_client_errors: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSettings {
    pub queue_capacity: usize,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    fn load_with_sources(env_vars: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = Self::set_defaults()?;
        // Explicit overrides keep tests independent of the process environment.
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // WEBHOOKS_DATABASE_URL, WEBHOOKS_WORKER__BATCH_SIZE, ...
            builder = builder.add_source(
                Environment::with_prefix("WEBHOOKS")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }

    fn set_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        ConfigLib::builder()
            .set_default("database_url", "postgres://localhost/webhooks")?
            .set_default("worker.poll_interval_secs", 5)?
            .set_default("worker.batch_size", 10)?
            .set_default("worker.request_timeout_secs", 10)?
            .set_default("worker.max_attempts", 5)?
            .set_default("worker.concurrency", 1)?
            .set_default("worker.strict_client_errors", false)?
            .set_default("dispatcher.queue_capacity", 1024)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_secs(self.worker.poll_interval_secs.max(1)),
            batch_size: self.worker.batch_size.max(1),
            request_timeout: Duration::from_secs(self.worker.request_timeout_secs.max(1)),
            concurrency: self.worker.concurrency.max(1),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let status_policy = if self.worker.strict_client_errors {
            StatusPolicy::DeadOnClientError
        } else {
            StatusPolicy::Uniform
        };
        RetryPolicy::default().with_status_policy(status_policy)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity: self.dispatcher.queue_capacity.max(1),
            max_attempts: self.worker.max_attempts.max(1),
        }
    }
}
