#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Authentication policies for `RestKit` pipelines
//!
//! - [`BearerTokenPolicy`] sets `Authorization: Bearer <token>` from a
//!   [`TokenCredential`] and answers `WWW-Authenticate` challenges, including
//!   continuous access evaluation (claims) challenges
//! - [`RegistryChallengePolicy`] probes registry-style services for their
//!   challenge before the first real request
//! - [`TemporalResource`] is the single-flight token cache behind both
//!
//! Tokens are only sent over HTTPS unless a policy is explicitly configured
//! otherwise. Every authentication failure is non-retriable.
//!
//! ```ignore
//! use restkit_auth::{BearerChallengeHandler, BearerTokenOptions, BearerTokenPolicy};
//!
//! let auth = BearerTokenPolicy::new(
//!     Some(credential),
//!     vec!["https://vault.example.com/.default".to_owned()],
//!     BearerTokenOptions {
//!         handler: Some(Arc::new(BearerChallengeHandler::new())),
//!         ..Default::default()
//!     },
//! );
//! let pipeline = Pipeline::builder().per_retry(Arc::new(auth)).build()?;
//! ```

mod bearer;
pub mod challenge;
mod credential;
mod error;
mod registry;
mod temporal;

pub use bearer::{
    AuthorizationHandler, BearerChallengeHandler, BearerTokenOptions, BearerTokenPolicy,
};
pub use challenge::Challenge;
pub use credential::{AccessToken, StaticTokenCredential, TokenCredential, TokenRequestOptions};
pub use error::AuthError;
pub use registry::{RegistryChallengeOptions, RegistryChallengePolicy};
pub use temporal::{AcquireError, Acquired, DEFAULT_REFRESH_WINDOW, TemporalResource};
