//! # keel platform
//!
//! Types shared by every layer of the keel SSH engine.
//!
//! This crate provides the unified error type (`KeelError`, `KeelResult`).
//!
//! # Examples
//!
//! ```
//! use keel_platform::{KeelError, KeelResult};
//!
//! fn require_port(port: u16) -> KeelResult<u16> {
//!     if port == 0 {
//!         return Err(KeelError::Config("port must be non-zero".to_string()));
//!     }
//!     Ok(port)
//! }
//!
//! # fn main() -> KeelResult<()> {
//! assert_eq!(require_port(22)?, 22);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{KeelError, KeelResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
