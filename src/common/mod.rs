pub mod config;
pub mod paths;

pub use config::AppConfig;
