#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Small building blocks shared by the `restkit` crates.
//!
//! - [`SecretString`]: zeroize-on-drop string with redacted formatting, used for access tokens
//! - [`humantime_serde`]: serde adapters for `"800ms"` / `"1m 30s"` style durations

#[cfg(feature = "humantime-serde")]
pub mod humantime_serde;
mod secret_string;

pub use secret_string::SecretString;
