//! HTTP transport for the upload engine.
//!
//! [`HttpUploadServer`] implements [`sliceup_engine::UploadServer`] with
//! `reqwest`. Endpoint paths, timeouts and extra headers come from
//! [`HttpConfig`].

mod client;
mod config;

pub use client::{Error, HttpUploadServer};
pub use config::{Endpoints, HttpConfig};
