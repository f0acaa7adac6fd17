//! Eddy Web - streaming server and action API
//!
//! Serves torrent files over HTTP range requests while they download,
//! pushes per-file status over server-sent events and exposes the engine
//! through a single action dispatch endpoint.

pub mod error;
pub mod handlers;
pub mod server;
pub mod state;

pub use error::WebError;
pub use server::{build_router, run_server};
pub use state::AppState;
