//! Wayback fan-out library.
//!
//! Archives URLs to several web archives concurrently through a bounded
//! worker pool, captures readable artifacts of the archived pages and
//! publishes the results to chat, issue tracker and search index sinks.

#![allow(clippy::needless_raw_string_hashes)]

pub mod archive_today;
pub mod archiver;
pub mod config;
pub mod constants;
pub mod ipfs;
pub mod pooling;
pub mod publish;
pub mod reduxer;
pub mod s3;
pub mod service;
pub mod telegraph;
pub mod throttle;
pub mod urls;
pub mod wayback;
pub mod web;
