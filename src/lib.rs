//! Read-through image cache proxy that keeps a slow origin from being
//! stampeded by concurrent requests for the same cold resource.

pub mod app;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod logging;
pub mod origin;
pub mod state;
pub mod store;
pub mod utils;
pub mod web;
