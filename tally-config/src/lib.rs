//! Configuration for the tally daemon.
//!
//! The configuration is read from `config.yml` inside a config folder. Every section and value
//! is optional, missing values take their defaults:
//!
//! ```yaml
//! logging:
//!   level: info
//! metrics:
//!   statsd: 127.0.0.1:8125
//! engine:
//!   period_ms: 10000
//!   stats:
//!     thresholds: "90,99,999m"
//!   synths:
//!     - target: errors.ratio
//!       source: [errors.count, requests.count]
//!       operation: ratio
//! ```

#![warn(missing_docs)]

mod config;

pub use self::config::*;
