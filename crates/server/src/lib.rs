//! HTTP surface of kbqa.
//!
//! Routes:
//! - `POST /search` (alias `POST /conversation`): answer a question
//! - `POST /feedback`: rate an answer
//! - `GET /health`: component health
//! - `POST /admin/index/rebuild`, `GET /admin/index/status`: index control

pub mod error;
pub mod health;
pub mod routes;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use server::{build_router, serve};
pub use state::AppState;
