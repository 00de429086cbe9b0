//! HTTP front end: the rate limiting middleware and a server that uses it.

mod middleware;
mod server;

pub use middleware::{client_addr, rate_limit, GateState, LIMIT_HEADER, REMAINING_HEADER};
pub use server::HttpServer;
