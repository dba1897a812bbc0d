//! Danbooru bulk downloader
//! Fetches tagged images from the catalog, validates them and keeps the folder clean

pub mod catalog_client;
pub mod config_loader;
pub mod dedup;
pub mod download_engine;
pub mod integrity;
pub mod logger;
pub mod orchestration;
pub mod tag_tools;

#[cfg(test)]
mod test_support;

// Re-export commonly used types for convenience
pub use catalog_client::CatalogClient;
pub use config_loader::{AppConfig, ConfigManager};
pub use dedup::dedupe;
pub use integrity::sweep;
pub use logger::init_logger;
pub use orchestration::{Orchestrator, RunReport};
pub use tag_tools::{delete_by_tag, escape_tag_files, TagClassifier};
