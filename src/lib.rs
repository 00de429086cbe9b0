//! Tollgate - Per-Client Admission Control
//!
//! This crate implements a token bucket rate limiter keyed by client IP
//! address. Each client gets its own bucket that refills continuously and
//! lazily, so bursts up to the bucket capacity are admitted while the
//! sustained rate stays bounded. An axum middleware and a small HTTP server
//! put the limiter in front of request handling.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
