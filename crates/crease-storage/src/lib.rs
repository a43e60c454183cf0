//! Politeness + raw persistence primitives for Crease.
//!
//! Everything that touches the network funnels through [`PoliteFetcher`]: one
//! shared [`RateLimiter`], randomized politeness delay, retry with capped
//! exponential backoff, URL allow/block policy, conditional GET, and
//! content-hash-deduplicated persistence into [`SnapshotStore`].

pub mod fetcher;
pub mod limit;
pub mod policy;
pub mod snapshot;
pub mod transport;

pub use fetcher::{FetchOutcome, FetchRequest, FetcherConfig, PoliteFetcher};
pub use limit::{classify_reqwest_error, classify_status, BackoffPolicy, RateLimiter, RetryDisposition};
pub use policy::UrlPolicy;
pub use snapshot::{SnapshotStore, StoredSnapshot};
pub use transport::{FetchError, HttpTransport, Transport, TransportRequest, TransportResponse};

pub const CRATE_NAME: &str = "crease-storage";
