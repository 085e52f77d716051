//! Transfer plumbing shared by uploads and downloads: rate limiting,
//! metered byte streams and progress reporting.

pub mod progress;
pub mod rate_limiter;
pub mod stream;

pub use progress::{LogProgressSink, NullProgressSink, ProgressSink, TransferProgress};
pub use rate_limiter::{effective_rate, RateLimiter, MIN_TRANSFER_RATE};
pub use stream::ByteStream;
