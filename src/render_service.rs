//! Render pipeline tying the cache, the admission gate and the browser together
//!
//! Every render goes through the same steps: validate, look up the cache,
//! take a gate slot, open a page, load and capture, store the image, then
//! close the page and give the slot back. The last two happen on every exit
//! path, including timeouts and a caller dropping the render future.

use crate::{
    utf16_len, utf16_len_within, validate_url, BrowserConnector, CacheSettings, CacheStore, ConcurrencyGate,
    Config, Fingerprint, GateLimits, PageHandle, RenderDefaults, RenderError, RenderKind,
    RenderMetrics, RenderOptions, RenderRequest, ResolvedOptions, Result,
};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Point-in-time view of the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderStats {
    pub connected: bool,
    pub active_tasks: usize,
    pub queue_length: usize,
    pub cache_size: usize,
}

#[derive(Debug, Clone)]
struct PipelineSettings {
    defaults: RenderDefaults,
    max_html_length: usize,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            defaults: config.render_defaults(),
            max_html_length: config.max_html_length,
        }
    }
}

/// Page-to-image render service
///
/// Owns the process-wide cache and gate; share it behind an `Arc`.
///
/// # Examples
///
/// ```rust,no_run
/// use page2img::{ChromeConnector, Config, RenderOptions, RenderService};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let chrome = Arc::new(ChromeConnector::new());
///     chrome.connect("http://127.0.0.1:9222").await?;
///
///     let service = RenderService::new(&config, chrome.clone());
///     let image = service
///         .render_url("https://example.com", &RenderOptions::default())
///         .await?;
///     println!("Rendered {} bytes", image.len());
///
///     chrome.disconnect(false).await?;
///     Ok(())
/// }
/// ```
pub struct RenderService {
    browser: Arc<dyn BrowserConnector>,
    cache: CacheStore,
    gate: ConcurrencyGate,
    settings: RwLock<PipelineSettings>,
    metrics: RenderMetrics,
}

impl RenderService {
    pub fn new(config: &Config, browser: Arc<dyn BrowserConnector>) -> Self {
        Self {
            browser,
            cache: CacheStore::new(CacheSettings::from(config)),
            gate: ConcurrencyGate::new(GateLimits::from(config)),
            settings: RwLock::new(PipelineSettings::from(config)),
            metrics: RenderMetrics::new(),
        }
    }

    pub async fn render_url(&self, url: &str, options: &RenderOptions) -> Result<Arc<[u8]>> {
        self.render_content(RenderKind::Url, url, options).await
    }

    pub async fn render_html(&self, html: &str, options: &RenderOptions) -> Result<Arc<[u8]>> {
        self.render_content(RenderKind::Html, html, options).await
    }

    pub async fn render(&self, request: &RenderRequest) -> Result<Arc<[u8]>> {
        self.render_content(request.kind, &request.content, &request.options)
            .await
    }

    async fn render_content(
        &self,
        kind: RenderKind,
        content: &str,
        options: &RenderOptions,
    ) -> Result<Arc<[u8]>> {
        let request_id = Uuid::new_v4();
        let settings = self.settings();
        let options = options.resolve(&settings.defaults);

        match kind {
            RenderKind::Url => {
                validate_url(content)?;
            }
            RenderKind::Html => {
                if utf16_len_within(content, settings.max_html_length).is_none() {
                    return Err(RenderError::PayloadTooLarge {
                        size: utf16_len(content),
                        limit: settings.max_html_length,
                    });
                }
            }
        }

        let fingerprint = Fingerprint::compute(kind, content, &options);
        if let Some(image) = self.cache.lookup(&fingerprint) {
            debug!("Render {} served from cache ({} bytes)", request_id, image.len());
            self.metrics.record_cache_hit();
            return Ok(image);
        }
        self.metrics.record_cache_miss();

        let permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!("Render {} not admitted: {}", request_id, e);
                self.metrics.record_error(&e);
                return Err(e);
            }
        };
        self.publish_gate();

        debug!("Render {} started ({:?})", request_id, kind);
        let started = Instant::now();
        let result = self
            .render_on_page(kind, content, &options, fingerprint)
            .await;

        permit.release();
        self.publish_gate();
        self.metrics.record_render(started.elapsed(), result.is_ok());

        match &result {
            Ok(image) => {
                self.metrics.set_cache_size(self.cache.size());
                debug!(
                    "Render {} finished in {:?} ({} bytes)",
                    request_id,
                    started.elapsed(),
                    image.len()
                );
            }
            Err(e) => {
                self.metrics.record_error(e);
                warn!("Render {} failed: {}", request_id, e);
            }
        }

        result
    }

    /// Open a page, drive it, cache the capture and always close the page.
    async fn render_on_page(
        &self,
        kind: RenderKind,
        content: &str,
        options: &ResolvedOptions,
        fingerprint: Fingerprint,
    ) -> Result<Arc<[u8]>> {
        let page = PageGuard::new(self.browser.open_page().await?);

        let outcome = drive_page(page.page(), kind, content, options).await;
        if let Ok(image) = &outcome {
            self.cache.store(fingerprint, image.clone());
        }

        page.close().await;
        outcome
    }

    fn settings(&self) -> PipelineSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish_gate(&self) {
        self.metrics
            .set_gate(self.gate.active_count(), self.gate.queue_length());
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        self.metrics.set_cache_size(0);
        info!("Render cache cleared");
    }

    pub fn sweep_expired(&self) -> usize {
        let removed = self.cache.sweep_expired();
        self.metrics.set_cache_size(self.cache.size());
        removed
    }

    pub fn stats(&self) -> RenderStats {
        RenderStats {
            connected: self.browser.is_connected(),
            active_tasks: self.gate.active_count(),
            queue_length: self.gate.queue_length(),
            cache_size: self.cache.size(),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn browser(&self) -> &Arc<dyn BrowserConnector> {
        &self.browser
    }

    /// Apply an updated configuration to the cache, gate and defaults in place.
    pub fn reconfigure(&self, config: &Config) {
        self.cache.reconfigure(CacheSettings::from(config));
        self.gate.set_limits(GateLimits::from(config));
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) =
            PipelineSettings::from(config);
        info!(
            "Render service reconfigured: max_concurrent={}, cache_enabled={}, cache_expire={}ms",
            config.max_concurrent, config.cache_enabled, config.cache_expire_time
        );
    }

    /// Cancel queued renders and forget active slots.
    pub fn shutdown(&self) {
        info!("Shutting down render service...");
        self.gate.reset();
        self.publish_gate();
        info!("Render service shutdown complete");
    }

    /// Periodically drop expired cache entries until the service is dropped.
    pub fn spawn_cache_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(service) = weak.upgrade() else {
                    break;
                };
                let removed = service.sweep_expired();
                if removed > 0 {
                    debug!("Cache sweeper removed {} expired entries", removed);
                }
            }
        })
    }
}

async fn drive_page(
    page: &dyn PageHandle,
    kind: RenderKind,
    content: &str,
    options: &ResolvedOptions,
) -> Result<Arc<[u8]>> {
    page.set_viewport(&options.viewport).await?;

    match kind {
        RenderKind::Url => {
            timeout(options.timeout, page.navigate(content))
                .await
                .map_err(|_| RenderError::NavigationTimeout(options.timeout))??;

            if let Some(selector) = &options.selector {
                timeout(options.selector_timeout, page.wait_for_selector(selector))
                    .await
                    .map_err(|_| RenderError::SelectorTimeout {
                        selector: selector.clone(),
                        timeout: options.selector_timeout,
                    })??;
            }
        }
        RenderKind::Html => {
            timeout(options.timeout, page.set_content(content))
                .await
                .map_err(|_| RenderError::ContentLoadTimeout(options.timeout))??;
        }
    }

    let data = page.capture(options.full_page).await?;
    if data.is_empty() {
        return Err(RenderError::CaptureFailed("empty image".to_string()));
    }
    Ok(Arc::from(data))
}

/// Owns an open page; closes it in the background if dropped unclosed.
struct PageGuard {
    page: Arc<dyn PageHandle>,
    closed: bool,
}

impl PageGuard {
    fn new(page: Box<dyn PageHandle>) -> Self {
        Self {
            page: Arc::from(page),
            closed: false,
        }
    }

    fn page(&self) -> &dyn PageHandle {
        &*self.page
    }

    async fn close(mut self) {
        self.closed = true;
        if let Err(e) = self.page.close().await {
            warn!("Failed to close page: {}", e);
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        let page = self.page.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = page.close().await {
                        warn!("Failed to close abandoned page: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime to close abandoned page"),
        }
    }
}
