#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

#[cfg(feature = "tokio")]
mod impls;
mod traits;

#[cfg(feature = "tokio")]
pub mod tokio;

pub use traits::{NetStream, NetStreamListener, Runtime, SleepProvider};
