//! Logging facade for all tally crates.
//!
//! Events are emitted through [`tracing`]. The binary installs a subscriber once at startup via
//! [`init`], tests install a capturing subscriber with [`init_test!`].
//!
//! # Logging
//!
//! Use the re-exported macros, optionally with structured fields:
//!
//! ```
//! let path = "svc.requests";
//! tally_log::debug!(path, "created adder record");
//! tally_log::warn!("qsort threshold raised to {}", 2048);
//! ```
//!
//! # Errors
//!
//! [`LogError`] renders an error together with its chain of sources:
//!
//! ```
//! use tally_log::LogError;
//!
//! if let Err(error) = std::env::var("FOO") {
//!     tally_log::error!("env failed: {}", LogError(&error));
//! }
//! ```

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
mod test;
#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

// Expose the minimal log facade.
#[doc(inline)]
pub use tracing::{debug, error, info, trace, warn};
