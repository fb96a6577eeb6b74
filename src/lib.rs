pub mod access;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod stats;
pub mod storage;

pub use error::{Error, Result};
