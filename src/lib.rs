pub mod app;
pub mod cli;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod platform;

pub use error::{Error, Result};
