//! Network side of the interceptor: the request/response contract and the
//! clients that fulfil it.

pub mod client;
#[cfg(test)]
pub mod stub;
pub mod types;

pub use client::{HttpNetwork, Network};
pub use types::{Request, Response};
