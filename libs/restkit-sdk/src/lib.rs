#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! # `restkit-sdk` - drivers for service clients built on `restkit-http`
//!
//! - **Pagination** (`pager` module) - lazy cursor over a paginated listing,
//!   page by page or as a `Stream`
//! - **Long-running operations** (`poller` module) - follows
//!   `Operation-Location`, `Location` and provisioning-state operations to
//!   completion, with resume tokens
//!
//! Both own a [`Pipeline`](restkit_http::Pipeline) and issue every request
//! through it, so authentication, retries and logging apply unchanged.
//!
//! ## Example
//!
//! ```rust,ignore
//! use restkit_sdk::poller::{Poller, PollerOptions};
//!
//! let mut request = Request::parse(http::Method::PUT, &format!("{base}/widgets/7"))?;
//! request.set_json(&widget)?;
//! let initial = pipeline.send(&ctx, &mut request).await?;
//!
//! let mut poller: Poller<Widget> =
//!     Poller::new(pipeline.clone(), initial, PollerOptions::default()).await?;
//! let created = poller.poll_until_done(&ctx, Duration::from_secs(5)).await?;
//! ```

pub mod pager;
pub mod poller;

pub use pager::{Pager, PagerError, PagingHandler};
pub use poller::{
    FinalStateVia, MIN_POLL_INTERVAL, OperationStatus, Poller, PollerError, PollerOptions,
};
