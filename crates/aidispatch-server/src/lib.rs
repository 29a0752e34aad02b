//! AI dispatch node: HTTP surface and application state.

pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
