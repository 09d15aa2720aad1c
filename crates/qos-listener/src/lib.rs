#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

mod config;
mod err;
mod listener;
mod logging;
mod state;
mod stream;

#[cfg(test)]
mod testing;

pub use config::{QosConfig, QosConfigBuilder};
pub use err::{is_limiter_exhausted, ConfigBuildError, LimiterExhausted, QosError};
pub use listener::{AcceptedStream, QosHandle, QosListener};
pub use logging::{MaybeLogged, ThroughputLogged};
pub use state::QosStatus;
pub use stream::QosStream;
