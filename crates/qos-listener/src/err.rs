//! Declare error types for the QoS listener.

use std::io;
use std::sync::Arc;

use futures::task::SpawnError;
use thiserror::Error;

pub use qos_ratelim::LimiterExhausted;

/// An error returned by the QoS listener.
///
/// When one of these comes out of an I/O operation (such as
/// [`QosListener::accept`](crate::QosListener::accept)) it is wrapped in a
/// [`std::io::Error`]; use [`QosError::from_io`] to recover it.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum QosError {
    /// We were unable to launch one of our background tasks.
    #[error("Unable to spawn {spawning}")]
    Spawn {
        /// What we were trying to spawn.
        spawning: &'static str,
        /// What happened when we tried to spawn it.
        #[source]
        cause: Arc<SpawnError>,
    },

    /// The listener has been closed, and cannot accept any more connections.
    #[error("Listener has been closed")]
    ListenerClosed,
}

impl QosError {
    /// Construct a new `QosError` from a `SpawnError`.
    pub(crate) fn from_spawn(spawning: &'static str, err: SpawnError) -> QosError {
        QosError::Spawn {
            spawning,
            cause: Arc::new(err),
        }
    }

    /// If `err` wraps a `QosError`, return it.
    pub fn from_io(err: &io::Error) -> Option<&QosError> {
        err.get_ref()?.downcast_ref::<QosError>()
    }
}

impl From<QosError> for io::Error {
    fn from(err: QosError) -> io::Error {
        io::Error::other(err)
    }
}

/// Return true if `err` means that a read or write on a
/// [`QosStream`](crate::QosStream) could not get permission from its rate
/// limiter.
///
/// Such an error is fatal to the call, but not to the stream.
pub fn is_limiter_exhausted(err: &io::Error) -> bool {
    LimiterExhausted::from_io(err).is_some()
}

/// An error that occurs while building a [`QosConfig`](crate::QosConfig).
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ConfigBuildError {
    /// A mandatory field was not present.
    #[error("Field was not provided: {field}")]
    MissingField {
        /// The name of the missing field.
        field: String,
    },
    /// A single field had a value that proved to be unusable.
    #[error("Value of {field} was incorrect: {problem}")]
    Invalid {
        /// The name of the invalid field.
        field: String,
        /// A description of the problem.
        problem: String,
    },
}

impl From<derive_builder::UninitializedFieldError> for ConfigBuildError {
    fn from(val: derive_builder::UninitializedFieldError) -> Self {
        ConfigBuildError::MissingField {
            field: val.field_name().to_string(),
        }
    }
}
