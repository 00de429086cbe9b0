//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod key;
mod limiter;

pub use bucket::{BucketPolicy, Consumption, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{normalize, ClientKey};
pub use limiter::{validate, Decision, RateLimiter};
