//! Application services between the HTTP surface and the cache.

pub mod data;
pub mod error;
