pub mod admission;
pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod infra;
pub mod logging;
pub mod model;
pub mod repository;
pub mod server;
pub mod service;
pub mod worker;

pub use config::AppConfig;
pub use error::{Result, ServerError};
pub use server::LimiterApp;
