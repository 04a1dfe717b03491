//! popgen gateway - HTTP API over the run manager

pub mod api;
pub mod auth;
pub mod server;

pub use api::AppState;
pub use auth::{IdentityProvider, TokenIdentityProvider};
pub use server::{build_manager, build_state, router, start_gateway};
