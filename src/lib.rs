pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod loader;
pub mod metrics;
pub mod persist;
pub mod run;
pub mod state;
pub mod types;
