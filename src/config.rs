//! Configuration management with serde serialization/deserialization
//!
//! This module provides the service configuration (stored as camelCase JSON so
//! existing plugin config files load unchanged) and the per-request render
//! types: what to render and how the page should be shaped.

use crate::{RenderError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound on `maxConcurrent` accepted by [`Config::validate`].
pub const MAX_CONCURRENT_LIMIT: usize = 10;

/// Service configuration for the render core
///
/// Every field has a default, so a partial JSON file is merged over
/// [`Config::default`].
///
/// # Examples
///
/// ```rust
/// use page2img::Config;
///
/// let config = Config {
///     max_concurrent: 5,
///     cache_expire_time: 60_000,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Chrome DevTools endpoint, e.g. `http://127.0.0.1:9222` (default: empty)
    ///
    /// An empty endpoint leaves the service disconnected; renders then fail
    /// with `BrowserUnavailable`.
    pub chrome_endpoint: String,

    /// Maximum number of renders running at once (default: 3)
    pub max_concurrent: usize,

    /// Maximum number of renders waiting for a slot (default: 100)
    ///
    /// Requests beyond this depth are rejected immediately with `QueueFull`.
    pub max_queue_size: usize,

    /// Whether rendered images are cached (default: true)
    pub cache_enabled: bool,

    /// Cache entry lifetime in milliseconds (default: 300000)
    pub cache_expire_time: u64,

    /// Maximum number of cached images (default: 100)
    pub cache_capacity: usize,

    /// Default viewport width in pixels (default: 1920)
    pub default_width: u32,

    /// Default viewport height in pixels (default: 1080)
    pub default_height: u32,

    /// Default page load timeout in milliseconds (default: 30000)
    pub default_timeout: u64,

    /// Timeout for the optional wait selector in milliseconds (default: 5000)
    pub selector_timeout: u64,

    /// Largest accepted HTML document, in UTF-16 code units (default: 10,000,000)
    pub max_html_length: usize,

    /// Close the browser process on shutdown instead of only disconnecting
    /// (default: false)
    pub auto_close_browser: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chrome_endpoint: String::new(),
            max_concurrent: 3,
            max_queue_size: 100,
            cache_enabled: true,
            cache_expire_time: 300_000,
            cache_capacity: 100,
            default_width: 1920,
            default_height: 1080,
            default_timeout: 30_000,
            selector_timeout: 5_000,
            max_html_length: 10_000_000,
            auto_close_browser: false,
        }
    }
}

impl Config {
    /// Load a JSON config file, falling back to defaults when it does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Write the config as pretty JSON, creating parent directories as needed.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let endpoint = self.chrome_endpoint.trim();
        if !endpoint.is_empty() && url::Url::parse(endpoint).is_err() {
            return Err(RenderError::ConfigurationError(format!(
                "chromeEndpoint is not a valid URL: {endpoint}"
            )));
        }

        if !(1..=MAX_CONCURRENT_LIMIT).contains(&self.max_concurrent) {
            return Err(RenderError::ConfigurationError(format!(
                "maxConcurrent must be between 1 and {MAX_CONCURRENT_LIMIT}, got {}",
                self.max_concurrent
            )));
        }

        if !(1_000..=300_000).contains(&self.default_timeout) {
            return Err(RenderError::ConfigurationError(format!(
                "defaultTimeout must be between 1000 and 300000 ms, got {}",
                self.default_timeout
            )));
        }

        if self.max_queue_size == 0 {
            return Err(RenderError::ConfigurationError(
                "maxQueueSize must be greater than 0".to_string(),
            ));
        }

        if self.cache_capacity == 0 {
            return Err(RenderError::ConfigurationError(
                "cacheCapacity must be greater than 0".to_string(),
            ));
        }

        if self.default_width == 0 || self.default_height == 0 {
            return Err(RenderError::ConfigurationError(
                "Default viewport dimensions must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn cache_expiry(&self) -> Duration {
        Duration::from_millis(self.cache_expire_time)
    }

    pub fn render_defaults(&self) -> RenderDefaults {
        RenderDefaults {
            width: self.default_width,
            height: self.default_height,
            timeout: Duration::from_millis(self.default_timeout),
            selector_timeout: Duration::from_millis(self.selector_timeout),
        }
    }
}

/// Values applied to options a request leaves unset
#[derive(Debug, Clone, PartialEq)]
pub struct RenderDefaults {
    pub width: u32,
    pub height: u32,
    pub timeout: Duration,
    pub selector_timeout: Duration,
}

impl Default for RenderDefaults {
    fn default() -> Self {
        Config::default().render_defaults()
    }
}

/// Browser viewport used for a single render
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
        }
    }
}

/// What a render request points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderKind {
    Url,
    Html,
}

/// Caller-supplied render options; anything left `None` is defaulted
///
/// Zero values count as "not given", so `width: Some(0)` falls back to the
/// configured default width.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub device_scale_factor: Option<f64>,
    /// Page load timeout in milliseconds
    pub timeout: Option<u64>,
    pub full_page: Option<bool>,
    /// CSS selector to wait for after navigation (URL renders only)
    pub selector: Option<String>,
}

impl RenderOptions {
    pub fn resolve(&self, defaults: &RenderDefaults) -> ResolvedOptions {
        let device_scale_factor = self
            .device_scale_factor
            .filter(|factor| *factor > 0.0)
            .unwrap_or(1.0);
        let timeout = self
            .timeout
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.timeout);

        ResolvedOptions {
            viewport: Viewport {
                width: self.width.filter(|w| *w > 0).unwrap_or(defaults.width),
                height: self.height.filter(|h| *h > 0).unwrap_or(defaults.height),
                device_scale_factor,
            },
            timeout,
            full_page: self.full_page.unwrap_or(false),
            selector: self.selector.clone().filter(|s| !s.trim().is_empty()),
            selector_timeout: defaults.selector_timeout,
        }
    }
}

/// Options after defaulting; this is what the pipeline and the fingerprint see
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub viewport: Viewport,
    pub timeout: Duration,
    pub full_page: bool,
    pub selector: Option<String>,
    pub selector_timeout: Duration,
}

/// A complete render request
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RenderRequest {
    pub kind: RenderKind,
    pub content: String,
    #[serde(default)]
    pub options: RenderOptions,
}

impl RenderRequest {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            kind: RenderKind::Url,
            content: url.into(),
            options: RenderOptions::default(),
        }
    }

    pub fn html(html: impl Into<String>) -> Self {
        Self {
            kind: RenderKind::Html,
            content: html.into(),
            options: RenderOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RenderOptions) -> Self {
        self.options = options;
        self
    }
}
