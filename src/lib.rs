pub mod api;
pub mod config;
pub mod error;
pub mod errors;
pub mod security;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use errors::AppError;
pub use security::SecurityService;
