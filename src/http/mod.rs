//! HTTP glue: client key resolution, middleware and the server.

mod key;
mod middleware;
mod server;

pub use key::{ClientIpResolver, KeyResolver, UNKNOWN_CLIENT};
pub use middleware::{
    apply_headers, rate_limit, RateLimitState, StoreErrorPolicy, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::{router, HttpServer};
