//! Turnstile - Fixed-Window HTTP Rate Limiting
//!
//! This crate decides, per request, whether a client may proceed based on how
//! many requests it has made in the current fixed window. Window state lives
//! in a pluggable key-value store (in-process or Redis) so the limiter itself
//! stays stateless between requests.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
