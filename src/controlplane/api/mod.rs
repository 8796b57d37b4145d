//! API Module
//!
//! REST routes for instances and applications, plus the server that runs
//! them alongside the bootstrap endpoint.

pub mod rest;
pub mod server;

pub use rest::{RestRouter, PROVIDER_HEADER};
pub use server::{ApiServer, ApiServerConfig};
