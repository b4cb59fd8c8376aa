//! S3-backed parent access: configuration, SigV4 signing and ranged GETs.

pub mod config;
pub mod fetcher;
pub mod retry;
pub mod signer;
pub mod tls;

pub use self::config::S3Config;
pub use self::fetcher::{FetchError, FetchOptions, FetchReply, FetchStats, HttpRangeFetcher};
pub use self::retry::RetryPolicy;
pub use self::signer::SigV4Signer;
