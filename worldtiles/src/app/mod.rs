//! Engine bootstrap and lifecycle management.
//!
//! [`TileEngine`] builds every component from an [`AppConfig`] in one place:
//!
//! ```text
//! ConfigFile ──► AppConfig ──► TileEngine
//!                                 ├── RetrievalService (RetrieverRouter over HTTP/file/zip+)
//!                                 ├── TileCache + DiskCache (disk GC daemon)
//!                                 ├── DownloadPostProcessor
//!                                 └── TileRequestOrchestrator
//! ```
//!
//! # Example
//!
//! ```ignore
//! use worldtiles::app::{AppConfig, TileEngine};
//! use worldtiles::config::ConfigFile;
//!
//! let config = AppConfig::from_config_file(&ConfigFile::load()?);
//! let engine = TileEngine::start(config).await?;
//! let status = engine.orchestrator().ensure(&key, 1.0, EnsureMode::Immediate).await?;
//! engine.shutdown().await;
//! ```

mod bootstrap;
mod config;
mod error;

pub use bootstrap::TileEngine;
pub use config::{AppConfig, DEFAULT_GC_INTERVAL_SECS, DEFAULT_WRITE_ATTEMPTS, DEFAULT_WRITE_RETRY_DELAY};
pub use error::AppError;
