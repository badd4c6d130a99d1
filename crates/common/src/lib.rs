//! Common utilities and types shared across proxy-manager components.

pub mod error;
pub mod logging;

pub use error::{Error, ErrorKind, Result};
