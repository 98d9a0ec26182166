pub mod config;
pub mod error;
pub mod token;

pub use error::{CryptoKeyError, Result};
