pub mod api;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod providers;
pub mod storage;
pub mod types;

pub use config::Config;
pub use engine::Hub;
pub use error::{HubError, Result};
pub use types::*;
