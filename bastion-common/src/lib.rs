pub mod config;
pub mod error;
pub mod fs;
pub mod logging;

pub use config::Config;
pub use error::BastionError;
