#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod cache;
pub mod config;
pub mod data;
pub mod feed;
pub mod history;
pub mod platform;
pub mod ui;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
