/// In-memory browser used by the pipeline tests.
pub(crate) mod fakes {
    use crate::{BrowserConnector, PageHandle, RenderError, Result, Viewport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Semaphore;

    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeBehavior {
        pub fail_navigation: bool,
        /// Navigation and content loading never finish.
        pub hang_navigation: bool,
        pub hang_selector: bool,
        /// Capture returns no bytes.
        pub fail_capture: bool,
        pub fail_close: bool,
        /// Loading waits for a permit from [`FakeBrowser::release_loads`].
        pub gated_loads: bool,
    }

    #[derive(Debug)]
    pub(crate) struct FakeShared {
        behavior: FakeBehavior,
        connected: AtomicBool,
        opened: AtomicUsize,
        closed: AtomicUsize,
        events: Mutex<Vec<String>>,
        valve: Semaphore,
    }

    impl FakeShared {
        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        async fn pass_valve(&self) {
            if self.behavior.gated_loads {
                self.valve.acquire().await.unwrap().forget();
            }
        }
    }

    pub(crate) struct FakeBrowser {
        shared: Arc<FakeShared>,
    }

    impl FakeBrowser {
        pub fn new() -> Self {
            Self::with_behavior(FakeBehavior::default())
        }

        pub fn with_behavior(behavior: FakeBehavior) -> Self {
            Self {
                shared: Arc::new(FakeShared {
                    behavior,
                    connected: AtomicBool::new(true),
                    opened: AtomicUsize::new(0),
                    closed: AtomicUsize::new(0),
                    events: Mutex::new(Vec::new()),
                    valve: Semaphore::new(0),
                }),
            }
        }

        pub fn gated() -> Self {
            Self::with_behavior(FakeBehavior {
                gated_loads: true,
                ..Default::default()
            })
        }

        pub fn shared(&self) -> Arc<FakeShared> {
            self.shared.clone()
        }

        pub fn set_connected(&self, connected: bool) {
            self.shared.connected.store(connected, Ordering::SeqCst);
        }

        pub fn release_loads(&self, count: usize) {
            self.shared.valve.add_permits(count);
        }

        pub fn opened(&self) -> usize {
            self.shared.opened.load(Ordering::SeqCst)
        }

        pub fn closed(&self) -> usize {
            self.shared.closed.load(Ordering::SeqCst)
        }

        pub fn events(&self) -> Vec<String> {
            self.shared.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrowserConnector for FakeBrowser {
        fn is_connected(&self) -> bool {
            self.shared.connected.load(Ordering::SeqCst)
        }

        async fn open_page(&self) -> Result<Box<dyn PageHandle>> {
            if !self.is_connected() {
                return Err(RenderError::BrowserUnavailable);
            }
            Ok(Box::new(FakePage::new(self.shared.clone())))
        }
    }

    pub(crate) struct FakePage {
        shared: Arc<FakeShared>,
        loaded: Mutex<String>,
    }

    impl FakePage {
        pub fn new(shared: Arc<FakeShared>) -> Self {
            shared.opened.fetch_add(1, Ordering::SeqCst);
            Self {
                shared,
                loaded: Mutex::new(String::new()),
            }
        }

        async fn load(&self, content: &str) {
            if self.shared.behavior.hang_navigation {
                std::future::pending::<()>().await;
            }
            self.shared.pass_valve().await;
            *self.loaded.lock().unwrap() = content.to_string();
        }
    }

    #[async_trait]
    impl PageHandle for FakePage {
        async fn set_viewport(&self, viewport: &Viewport) -> Result<()> {
            self.shared.record(format!(
                "viewport {}x{}@{}",
                viewport.width, viewport.height, viewport.device_scale_factor
            ));
            Ok(())
        }

        async fn navigate(&self, url: &str) -> Result<()> {
            self.shared.record(format!("navigate {url}"));
            if self.shared.behavior.fail_navigation {
                return Err(RenderError::NavigationFailed(
                    "net::ERR_NAME_NOT_RESOLVED".to_string(),
                ));
            }
            self.load(url).await;
            Ok(())
        }

        async fn set_content(&self, html: &str) -> Result<()> {
            self.shared
                .record(format!("content {} chars", html.chars().count()));
            self.load(html).await;
            Ok(())
        }

        async fn wait_for_selector(&self, selector: &str) -> Result<()> {
            self.shared.record(format!("selector {selector}"));
            if self.shared.behavior.hang_selector {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn capture(&self, full_page: bool) -> Result<Vec<u8>> {
            self.shared.record(format!("capture full_page={full_page}"));
            if self.shared.behavior.fail_capture {
                return Ok(Vec::new());
            }
            let loaded = self.loaded.lock().unwrap().clone();
            Ok(format!("png:{loaded}").into_bytes())
        }

        async fn close(&self) -> Result<()> {
            self.shared.record("close".to_string());
            self.shared.closed.fetch_add(1, Ordering::SeqCst);
            if self.shared.behavior.fail_close {
                return Err(RenderError::PageError("target already detached".to_string()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod integration_tests {
    use super::fakes::FakeBrowser;
    use crate::{Config, RenderError, RenderOptions, RenderService};
    use std::sync::Arc;
    use std::time::Duration;

    fn config(max_concurrent: usize, max_queue_size: usize) -> Config {
        Config {
            max_concurrent,
            max_queue_size,
            ..Default::default()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    fn spawn_url(
        service: &Arc<RenderService>,
        url: &str,
    ) -> tokio::task::JoinHandle<crate::Result<Arc<[u8]>>> {
        let service = service.clone();
        let url = url.to_string();
        tokio::spawn(async move { service.render_url(&url, &RenderOptions::default()).await })
    }

    #[tokio::test]
    async fn test_third_render_waits_for_a_free_slot() {
        let browser = Arc::new(FakeBrowser::gated());
        let service = Arc::new(RenderService::new(&config(2, 100), browser.clone()));

        let first = spawn_url(&service, "https://a.example");
        let second = spawn_url(&service, "https://b.example");
        let third = spawn_url(&service, "https://c.example");

        wait_until(|| service.gate().active_count() == 2 && service.gate().queue_length() == 1)
            .await;
        assert_eq!(browser.opened(), 2);

        browser.release_loads(1);
        wait_until(|| browser.closed() == 1 && browser.opened() == 3).await;
        assert_eq!(service.gate().active_count(), 2);
        assert_eq!(service.gate().queue_length(), 0);

        browser.release_loads(2);
        for handle in [first, second, third] {
            assert!(handle.await.unwrap().is_ok());
        }

        let stats = service.stats();
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.queue_length, 0);
        assert_eq!(stats.cache_size, 3);
        assert_eq!(browser.closed(), 3);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_opening_a_page() {
        let browser = Arc::new(FakeBrowser::gated());
        let service = Arc::new(RenderService::new(&config(1, 1), browser.clone()));

        let running = spawn_url(&service, "https://a.example");
        let queued = spawn_url(&service, "https://b.example");
        wait_until(|| service.gate().active_count() == 1 && service.gate().queue_length() == 1)
            .await;

        let err = service
            .render_url("https://c.example", &RenderOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::QueueFull { limit: 1 }));
        assert_eq!(browser.opened(), 1);
        assert_eq!(service.gate().active_count(), 1);
        assert_eq!(service.gate().queue_length(), 1);

        browser.release_loads(2);
        assert!(running.await.unwrap().is_ok());
        assert!(queued.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_render_closes_page_and_frees_slot() {
        let browser = Arc::new(FakeBrowser::gated());
        let service = Arc::new(RenderService::new(&config(1, 100), browser.clone()));

        let abandoned = spawn_url(&service, "https://slow.example");
        wait_until(|| browser.opened() == 1).await;
        assert_eq!(service.gate().active_count(), 1);

        abandoned.abort();
        assert!(abandoned.await.unwrap_err().is_cancelled());

        wait_until(|| browser.closed() == 1).await;
        assert_eq!(service.gate().active_count(), 0);
        assert_eq!(service.cache().size(), 0);

        browser.release_loads(1);
        assert!(service
            .render_url("https://next.example", &RenderOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_renders() {
        let browser = Arc::new(FakeBrowser::gated());
        let service = Arc::new(RenderService::new(&config(1, 100), browser.clone()));

        let running = spawn_url(&service, "https://a.example");
        let queued = spawn_url(&service, "https://b.example");
        wait_until(|| service.gate().queue_length() == 1).await;

        service.shutdown();
        assert!(matches!(
            queued.await.unwrap(),
            Err(RenderError::Cancelled)
        ));

        browser.release_loads(1);
        assert!(running.await.unwrap().is_ok());
        assert_eq!(service.gate().active_count(), 0);
        assert_eq!(browser.opened(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_browser_is_reported() {
        let browser = Arc::new(FakeBrowser::new());
        browser.set_connected(false);
        let service = RenderService::new(&Config::default(), browser.clone());

        let err = service
            .render_html("<p>offline</p>", &RenderOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::BrowserUnavailable));
        assert!(err.is_retryable());

        let stats = service.stats();
        assert!(!stats.connected);
        assert_eq!(stats.active_tasks, 0);
    }

    #[tokio::test]
    async fn test_stats_serialize_in_camel_case() {
        let service = RenderService::new(&Config::default(), Arc::new(FakeBrowser::new()));
        service
            .render_html("<p>stats</p>", &RenderOptions::default())
            .await
            .unwrap();

        let json = serde_json::to_value(service.stats()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "connected": true,
                "activeTasks": 0,
                "queueLength": 0,
                "cacheSize": 1,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_drops_expired_entries() {
        let browser = Arc::new(FakeBrowser::new());
        let config = Config {
            cache_expire_time: 1_000,
            ..Default::default()
        };
        let service = Arc::new(RenderService::new(&config, browser.clone()));

        service
            .render_html("<p>ephemeral</p>", &RenderOptions::default())
            .await
            .unwrap();
        assert_eq!(service.cache().size(), 1);

        let sweeper = service.spawn_cache_sweeper(Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(1_600)).await;
        tokio::task::yield_now().await;
        assert_eq!(service.cache().size(), 0);

        drop(service);
        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(sweeper.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_rendered_again() {
        let browser = Arc::new(FakeBrowser::new());
        let config = Config {
            cache_expire_time: 100,
            ..Default::default()
        };
        let service = RenderService::new(&config, browser.clone());
        let options = RenderOptions::default();

        service.render_url("https://example.com", &options).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.render_url("https://example.com", &options).await.unwrap();
        assert_eq!(browser.opened(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        service.render_url("https://example.com", &options).await.unwrap();
        assert_eq!(browser.opened(), 2);
    }
}
