//! CDN edge IP ranges.
//!
//! - [`cidr`]: the immutable [`CidrSet`] and its line parser
//! - [`source`]: [`RangeSource`] and the HTTP implementation
//! - [`cache`]: [`RangeCache`], lock-free reads and throttled refresh

pub mod cache;
pub mod cidr;
pub mod source;

pub use cache::{DEFAULT_REFRESH_INTERVAL, RangeCache};
pub use cidr::CidrSet;
pub use source::{HttpRangeSource, RangeSource};
