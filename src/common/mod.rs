//! Common utilities and types

pub mod error;
pub mod fs;
pub mod http;
pub mod net;
pub mod process;

pub use error::{Error, Result};
