//! HTTP request handlers

pub mod service;
pub mod stream;

pub use service::*;
pub use stream::*;
