pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod media;
pub mod mesh;
pub mod models;
pub mod registry;
pub mod relay;
pub mod state;
pub mod ws;

pub use config::Config;
pub use error::{AppError, Result};
pub use state::AppState;
