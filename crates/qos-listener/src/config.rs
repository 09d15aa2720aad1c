//! Configuration for a [`QosListener`](crate::QosListener).

use std::time::Duration;

use derive_builder::Builder;
use qos_ratelim::BoundedRetry;
use serde::{Deserialize, Serialize};

use crate::err::ConfigBuildError;

/// Configuration for a [`QosListener`](crate::QosListener).
///
/// The limits given here are only the starting values; they can be changed
/// at any time with [`QosHandle`](crate::QosHandle).
///
/// This type is immutable once constructed. To build one, use
/// [`QosConfigBuilder`], or deserialize a builder from any serde format.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(validate = "Self::validate", error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct QosConfig {
    /// The most bytes per second that any one connection may move, in each
    /// direction.  Zero means "no per-connection limit".
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    pub(crate) limit_per_conn: u64,

    /// The most bytes per second that all connections together may move.
    /// Zero means "no global limit".
    ///
    /// The global limit is split evenly between the active connections.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    pub(crate) limit_global: u64,

    /// Whether to wrap new connections in a throughput-logging wrapper.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    pub(crate) log_throughput: bool,

    /// How long a new connection must wait before it is allowed its first
    /// full burst.
    ///
    /// Without this, a new connection could move a full burst immediately
    /// and then a second one a moment later, doubling its rate for the first
    /// second.
    #[builder(default = "Duration::from_secs(1)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub(crate) burst_delay: Duration,

    /// How often the throughput-logging wrapper reports.
    #[builder(default = "Duration::from_secs(1)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub(crate) log_interval: Duration,

    /// How many times a throttled read or write tries to reserve a chunk
    /// before giving up.
    #[builder(default = "qos_ratelim::DEFAULT_ATTEMPTS")]
    #[builder_field_attr(serde(default))]
    pub(crate) reserve_attempts: u32,
}

impl QosConfig {
    /// Return a new builder for a `QosConfig`.
    pub fn builder() -> QosConfigBuilder {
        QosConfigBuilder::default()
    }

    /// Return the configured per-connection limit.
    pub fn limit_per_conn(&self) -> u64 {
        self.limit_per_conn
    }

    /// Return the configured global limit.
    pub fn limit_global(&self) -> u64 {
        self.limit_global
    }

    /// Return true if new connections should log their throughput.
    pub fn log_throughput(&self) -> bool {
        self.log_throughput
    }

    /// Return the delay before a new connection's first full burst.
    pub fn burst_delay(&self) -> Duration {
        self.burst_delay
    }

    /// Return the interval between throughput reports.
    pub fn log_interval(&self) -> Duration {
        self.log_interval
    }

    /// Return the retry policy for chunk reservations.
    pub(crate) fn retry(&self) -> BoundedRetry {
        BoundedRetry::new(self.reserve_attempts)
    }
}

impl Default for QosConfig {
    fn default() -> Self {
        QosConfigBuilder::default()
            .build()
            .expect("Default builder failed")
    }
}

/// The longest `burst_delay` we accept.
pub(crate) const MAX_BURST_DELAY: Duration = Duration::from_secs(60 * 60);

impl QosConfigBuilder {
    /// Check that the builder will give valid configuration.
    fn validate(&self) -> Result<(), ConfigBuildError> {
        if let Some(delay) = self.burst_delay {
            if delay > MAX_BURST_DELAY {
                return Err(ConfigBuildError::Invalid {
                    field: "burst_delay".to_string(),
                    problem: format!("must be at most {}s", MAX_BURST_DELAY.as_secs()),
                });
            }
        }
        if self.reserve_attempts == Some(0) {
            return Err(ConfigBuildError::Invalid {
                field: "reserve_attempts".to_string(),
                problem: "must be at least 1".to_string(),
            });
        }
        if self.log_interval == Some(Duration::ZERO) {
            return Err(ConfigBuildError::Invalid {
                field: "log_interval".to_string(),
                problem: "must not be zero".to_string(),
            });
        }
        Ok(())
    }
}
