//! Implementations of our runtime traits for specific runtimes.

pub(crate) mod tokio;
