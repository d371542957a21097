#![forbid(unsafe_code)]

//! Video bookmarks with a background download pipeline that mirrors media
//! into object storage.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod jobs;
pub mod logging;
pub mod metadata;
pub mod naming;
pub mod scheduler;
pub mod storage;
