#![forbid(unsafe_code)]

//! Shared library behind the podcast audio binaries.
//!
//! The backend and the cache-warming tool both build a
//! [`resolver::ResolutionEngine`] from the catalog file, the on-disk audio
//! cache and the relay client, so every piece lives here.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fallback;
pub mod relay;
pub mod resolver;
pub mod security;
