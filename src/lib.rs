#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod data;
pub mod feed;
pub mod media;
pub mod notify;
pub mod profile;
pub mod session;
pub mod storage;
pub mod upload;
pub mod watch;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
