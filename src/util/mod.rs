pub mod backoff;
pub mod clock;

pub use backoff::{BackoffSettings, ExponentialBackoff};
pub use clock::{Clock, ManualClock, SystemClock};
