//! Rate limiting logic and window state.

mod backend;
mod clock;
mod limiter;
mod window;

pub use backend::{two_step_hit, WindowStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{Consistency, Decision, LimiterOptions, RateLimiter, DEFAULT_KEY_PREFIX};
pub use window::{Hit, RecordTtl, WindowPolicy, WindowState};
