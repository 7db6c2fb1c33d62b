//! Stale-while-revalidate cache with request coalescing and a live update
//! stream, sitting in front of a slow upstream API.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
pub mod live;
pub mod upstream;
