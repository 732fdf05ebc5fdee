//! # Fjord Platform
//!
//! Core platform types shared by the Fjord crates.
//!
//! This crate provides the unified error type (`FjordError`, `FjordResult`).
//!
//! # Examples
//!
//! ```
//! use fjord_platform::{FjordError, FjordResult};
//!
//! fn example_function() -> FjordResult<String> {
//!     Ok("Hello, Fjord!".to_string())
//! }
//!
//! # fn main() -> FjordResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Fjord!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{FjordError, FjordResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
