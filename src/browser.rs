//! Browser automation capability
//!
//! The render pipeline only needs two things from a browser: whether one is
//! connected, and a fresh page to drive. [`BrowserConnector`] and
//! [`PageHandle`] describe that contract; [`ChromeConnector`] implements it
//! over a remote Chrome reached through the DevTools protocol.

use crate::{RenderError, Result, Viewport};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often `wait_for_selector` re-checks the DOM.
const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often a loading page is checked for `readyState == "complete"`.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BrowserStatus {
    pub connected: bool,
    pub version: Option<String>,
}

/// Source of pages for the render pipeline
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserConnector: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Open a blank page; `BrowserUnavailable` when no browser is connected.
    async fn open_page(&self) -> Result<Box<dyn PageHandle>>;

    async fn status(&self) -> BrowserStatus {
        BrowserStatus {
            connected: self.is_connected(),
            version: None,
        }
    }
}

/// A single open page
///
/// Calls may block for as long as the page takes; the pipeline puts its own
/// timeouts around them.
#[async_trait]
pub trait PageHandle: Send + Sync {
    async fn set_viewport(&self, viewport: &Viewport) -> Result<()>;

    /// Navigate and wait until the page has settled.
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Replace the document with `html` and wait until it has settled.
    async fn set_content(&self, html: &str) -> Result<()>;

    async fn wait_for_selector(&self, selector: &str) -> Result<()>;

    async fn capture(&self, full_page: bool) -> Result<Vec<u8>>;

    async fn close(&self) -> Result<()>;
}

/// Re-run `check` every `interval` until it reports `true`.
///
/// Errors count as "not yet": a document swapped out mid-load fails the
/// check once and then succeeds. Callers bound the wait with a timeout.
pub async fn poll_until<F, Fut, E>(interval: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<bool, E>>,
    E: Display,
{
    loop {
        match check().await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => debug!("Page not ready yet: {}", e),
        }
        tokio::time::sleep(interval).await;
    }
}

struct Connection {
    endpoint: String,
    browser: Browser,
    handler: JoinHandle<()>,
}

/// Connection to a remote Chrome over the DevTools protocol
#[derive(Default)]
pub struct ChromeConnector {
    connection: Mutex<Option<Connection>>,
    connected: Arc<AtomicBool>,
}

impl ChromeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to `endpoint` (an `http://host:port` debugging address or a
    /// `ws://` URL). Does nothing if already connected.
    pub async fn connect(&self, endpoint: &str) -> Result<()> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(RenderError::ConfigurationError(
                "chromeEndpoint is not configured".to_string(),
            ));
        }

        let mut connection = self.connection.lock().await;
        if connection.is_some() && self.is_connected() {
            debug!("Already connected to Chrome, skipping connect");
            return Ok(());
        }
        if let Some(stale) = connection.take() {
            stale.handler.abort();
        }

        let (browser, mut handler) =
            Browser::connect(endpoint)
                .await
                .map_err(|e| RenderError::BrowserConnectFailed {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;

        // The handler drives the DevTools websocket and must be polled until it ends.
        let connected = self.connected.clone();
        connected.store(true, Ordering::SeqCst);
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("Chrome handler error: {}", e);
                    break;
                }
            }
            info!("Chrome handler stream ended");
            connected.store(false, Ordering::SeqCst);
        });

        info!("Connected to Chrome at {}", endpoint);
        *connection = Some(Connection {
            endpoint: endpoint.to_string(),
            browser,
            handler: handler_task,
        });
        Ok(())
    }

    /// Drop the connection. With `close_browser` the Chrome process is asked
    /// to exit as well; otherwise it keeps running.
    pub async fn disconnect(&self, close_browser: bool) -> Result<()> {
        let Some(mut connection) = self.connection.lock().await.take() else {
            return Ok(());
        };

        let result = if close_browser {
            connection
                .browser
                .close()
                .await
                .map(|_| ())
                .map_err(|e| RenderError::PageError(format!("failed to close browser: {e}")))
        } else {
            Ok(())
        };

        connection.handler.abort();
        self.connected.store(false, Ordering::SeqCst);
        info!(
            "Disconnected from Chrome at {} (browser closed: {})",
            connection.endpoint, close_browser
        );
        result
    }

    pub async fn endpoint(&self) -> Option<String> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.endpoint.clone())
    }
}

#[async_trait]
impl BrowserConnector for ChromeConnector {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn open_page(&self) -> Result<Box<dyn PageHandle>> {
        if !self.is_connected() {
            return Err(RenderError::BrowserUnavailable);
        }

        let connection = self.connection.lock().await;
        let connection = connection.as_ref().ok_or(RenderError::BrowserUnavailable)?;
        let page = connection
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| RenderError::PageError(e.to_string()))?;

        Ok(Box::new(ChromePage { page }))
    }

    async fn status(&self) -> BrowserStatus {
        if !self.is_connected() {
            return BrowserStatus::default();
        }

        let connection = self.connection.lock().await;
        let version = match connection.as_ref() {
            Some(connection) => match connection.browser.version().await {
                Ok(version) => Some(version.product),
                Err(e) => {
                    warn!("Failed to query Chrome version: {}", e);
                    return BrowserStatus::default();
                }
            },
            None => return BrowserStatus::default(),
        };

        BrowserStatus {
            connected: true,
            version,
        }
    }
}

struct ChromePage {
    page: Page,
}

impl ChromePage {
    /// Poll until the document and its subresources have finished loading.
    async fn wait_until_settled(&self) {
        let page = &self.page;
        poll_until(READY_POLL_INTERVAL, move || async move {
            let state = page.evaluate("document.readyState").await?;
            Ok::<_, chromiumoxide::error::CdpError>(
                state.into_value::<String>().ok().as_deref() == Some("complete"),
            )
        })
        .await
    }
}

#[async_trait]
impl PageHandle for ChromePage {
    async fn set_viewport(&self, viewport: &Viewport) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(false)
            .build()
            .map_err(RenderError::PageError)?;

        self.page
            .execute(params)
            .await
            .map_err(|e| RenderError::PageError(e.to_string()))?;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| RenderError::NavigationFailed(e.to_string()))?;
        self.wait_until_settled().await;
        Ok(())
    }

    async fn set_content(&self, html: &str) -> Result<()> {
        self.page
            .set_content(html)
            .await
            .map_err(|e| RenderError::ContentLoadFailed(e.to_string()))?;
        self.wait_until_settled().await;
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str) -> Result<()> {
        let page = &self.page;
        poll_until(SELECTOR_POLL_INTERVAL, move || async move {
            page.find_element(selector).await.map(|_| true)
        })
        .await;
        Ok(())
    }

    async fn capture(&self, full_page: bool) -> Result<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(full_page)
            .build();

        self.page
            .screenshot(params)
            .await
            .map_err(|e| RenderError::CaptureFailed(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.page
            .clone()
            .close()
            .await
            .map_err(|e| RenderError::PageError(format!("failed to close page: {e}")))
    }
}
