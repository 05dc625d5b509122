//! Common utilities shared by the service components

pub mod config;
pub mod error;
pub mod paths;

pub use error::{Error, Result};
