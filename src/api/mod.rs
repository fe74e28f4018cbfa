//! Crash Round HTTP API
//!
//! Round creation, operator overrides, bets, cashouts, fairness verification,
//! a WebSocket event stream and Prometheus metrics.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod websocket;

pub use handlers::AppState;
pub use server::{create_app, ApiServer};
