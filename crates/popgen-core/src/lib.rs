//! popgen core - types, configuration and error handling

pub mod config;
pub mod error;
pub mod types;

pub use config::*;
pub use error::{Error, ErrorKind, Result};
pub use types::*;
