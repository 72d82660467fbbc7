pub mod audit;
pub mod config;
pub mod error;
pub mod findings;
pub mod lifecycle;
pub mod network;
pub mod rate_limit;
pub mod scanning;
pub mod vendors;

pub use error::{Error, Result};
