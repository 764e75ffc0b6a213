//! HTTP surface of the proxy.

pub mod error;
pub mod images;
pub mod middleware;
pub mod routes;
pub mod status;

pub use routes::*;
