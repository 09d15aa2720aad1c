#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

mod bucket;
mod err;
mod io;
mod retry;
mod throttle;

pub use bucket::{Reservation, TokenBucket};
pub use err::{LimiterExhausted, ReserveError, RetryError};
pub use io::LimitedIo;
pub use retry::{BoundedRetry, DEFAULT_ATTEMPTS};
pub use throttle::{Grant, Throttle};
