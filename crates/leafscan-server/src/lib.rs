//! leafscan server
//!
//! The HTTP API and command-line front end around the leafscan predictor.
//! The binary lives in `main.rs`; the router, state and configuration are
//! exposed here so they can be exercised in tests.

pub mod config;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use routes::create_router;
pub use state::AppState;
