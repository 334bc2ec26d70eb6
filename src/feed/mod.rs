//! Live feeds (jobs, freelancers, ...) that survive query-capability errors.
//!
//! A feed prefers a server-ordered query. If the store rejects the ordering
//! (missing composite index, unsupported filter/order pairing), the
//! subscriber swaps to a filter-only query and orders each snapshot itself.
//! Consumers see the same ordered sequences either way.
//!
//! # Example
//!
//! ```ignore
//! let spec = FeedSpec::new("jobs", "createdAt")
//!     .descending()
//!     .filter(Filter::eq("category", "design"))
//!     .limit(50);
//! let mut feed = ResilientQuerySubscriber::watch(store.clone(), spec);
//!
//! for update in feed.poll() {
//!     match update {
//!         FeedUpdate::Items(items) => render(items),
//!         FeedUpdate::AccessDenied(_) => show_access_denied(),
//!         FeedUpdate::Failed(err) => show_error(err),
//!     }
//! }
//! ```

mod subscriber;

pub use subscriber::{FeedSpec, FeedState, FeedUpdate, ResilientQuerySubscriber};
