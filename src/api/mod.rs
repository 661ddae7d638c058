pub mod error;
pub mod handlers;
pub mod server;
pub mod websocket;

pub use error::ApiError;
pub use server::{create_router, serve, AppState};
