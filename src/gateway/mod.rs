//! Gateway server wiring: router, listener, and built-in assets.

pub mod assets;
pub mod router;
pub mod server;

pub use router::{create_router, AppState};
pub use server::Gateway;
