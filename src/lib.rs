#![forbid(unsafe_code)]

//! Shared library behind the mediadrop binaries: URL platform detection, the
//! yt-dlp process wrapper, metadata and download pipelines, and the libsql
//! backed job/settings stores.

pub mod config;
pub mod download;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod media_info;
pub mod platform;
pub mod process;
pub mod settings;
pub mod store;
