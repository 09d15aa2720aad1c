//! Entry points for use with Tokio runtimes.

pub use crate::impls::tokio::net::{TcpListener, TcpStream};
pub use crate::impls::tokio::TokioRuntimeHandle;
