//! # page2img
//!
//! Rendering core of a page-to-image service: turns a URL or an HTML
//! document into a PNG by driving a remote Chrome over the DevTools protocol.
//!
//! Three pieces sit between a caller and the browser:
//!
//! - **Concurrency gate**: at most `maxConcurrent` renders run at once;
//!   the rest wait in FIFO order, and callers beyond `maxQueueSize` waiting
//!   renders are turned away with `QueueFull`.
//! - **Result cache**: finished images are keyed by a fingerprint of the
//!   request, expire after `cacheExpireTime` and are evicted oldest-first
//!   once `cacheCapacity` is reached.
//! - **Render pipeline**: validates, consults the cache, takes a gate slot,
//!   loads the page under a timeout and captures it. The page is closed and
//!   the slot handed back on every exit path.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use page2img::{ChromeConnector, Config, RenderOptions, RenderService};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let chrome = Arc::new(ChromeConnector::new());
//!     chrome.connect(&config.chrome_endpoint).await?;
//!
//!     let service = RenderService::new(&config, chrome.clone());
//!     let png = service
//!         .render_html("<h1>Hello</h1>", &RenderOptions::default())
//!         .await?;
//!     println!("Rendered {} bytes", png.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! page2img url https://example.com --output example.png
//! page2img html page.html --width 800 --height 600
//! page2img batch urls.txt --output renders/
//! page2img status
//! ```

/// Configuration and render request types
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Result cache keyed by request fingerprint
pub mod cache;

/// FIFO admission control for concurrent renders
pub mod gate;

/// Browser capability and the Chrome DevTools implementation
pub mod browser;

/// Render pipeline orchestrating cache, gate and browser
pub mod render_service;

/// Command-line interface implementation
pub mod cli;

/// Metrics handles and Prometheus exporter
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use browser::*;
pub use cache::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use gate::*;
pub use metrics::*;
pub use render_service::*;
pub use utils::*;
