use crate::{
    output_filename, format_bytes, format_duration, BrowserConnector, ChromeConnector, Config,
    RenderError, RenderOptions, RenderService,
};
use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "page2img")]
#[command(about = "Render web pages and HTML documents to PNG images")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Chrome DevTools endpoint, e.g. http://127.0.0.1:9222")]
    pub endpoint: Option<String>,

    #[arg(long, global = true, help = "Maximum concurrent renders")]
    pub max_concurrent: Option<usize>,

    #[arg(long, global = true, help = "Default page load timeout in milliseconds")]
    pub timeout: Option<u64>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Print Prometheus metrics on exit")]
    pub metrics: bool,
}

impl Cli {
    /// Apply command-line overrides on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(endpoint) = &self.endpoint {
            config.chrome_endpoint = endpoint.clone();
        }
        if let Some(max_concurrent) = self.max_concurrent {
            config.max_concurrent = max_concurrent;
        }
        if let Some(timeout) = self.timeout {
            config.default_timeout = timeout;
        }
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct RenderArgs {
    #[arg(long, help = "Viewport width")]
    pub width: Option<u32>,

    #[arg(long, help = "Viewport height")]
    pub height: Option<u32>,

    #[arg(long, help = "Device scale factor")]
    pub scale: Option<f64>,

    #[arg(long, help = "Capture the full scrollable page")]
    pub full_page: bool,

    #[arg(long, help = "Page load timeout in milliseconds")]
    pub load_timeout: Option<u64>,
}

impl RenderArgs {
    pub fn to_options(&self, selector: Option<String>) -> RenderOptions {
        RenderOptions {
            width: self.width,
            height: self.height,
            device_scale_factor: self.scale,
            timeout: self.load_timeout,
            full_page: self.full_page.then_some(true),
            selector,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Render a single URL
    Url {
        #[arg(help = "URL to render")]
        url: String,

        #[arg(short, long, help = "Output file (defaults to a name derived from the URL)")]
        output: Option<PathBuf>,

        #[arg(long, help = "CSS selector to wait for before capturing")]
        selector: Option<String>,

        #[command(flatten)]
        render: RenderArgs,
    },

    /// Render a local HTML file
    Html {
        #[arg(help = "HTML file to render")]
        input: PathBuf,

        #[arg(short, long, help = "Output file (defaults to the input name with .png)")]
        output: Option<PathBuf>,

        #[command(flatten)]
        render: RenderArgs,
    },

    /// Render every URL listed in a file
    Batch {
        #[arg(help = "Input file containing URLs (one per line)")]
        input: PathBuf,

        #[arg(short, long, default_value = "renders", help = "Output directory")]
        output: PathBuf,

        #[command(flatten)]
        render: RenderArgs,
    },

    /// Connect to the browser and show service status
    Status,

    /// Validate a configuration file
    Validate {
        #[arg(help = "Configuration file to validate")]
        config: PathBuf,
    },
}

/// Outcome counts of a batch run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub rejected: usize,
}

impl BatchSummary {
    fn record(&mut self, result: &Result<(), RenderError>) {
        match result {
            Ok(()) => self.succeeded += 1,
            Err(RenderError::QueueFull { .. }) => {
                self.failed += 1;
                self.rejected += 1;
            }
            Err(_) => self.failed += 1,
        }
    }
}

pub struct CliRunner {
    pub config: Config,
    pub chrome: Arc<ChromeConnector>,
    pub service: Arc<RenderService>,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        let chrome = Arc::new(ChromeConnector::new());
        let service = Arc::new(RenderService::new(&config, chrome.clone()));

        Self {
            config,
            chrome,
            service,
        }
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Url {
                url,
                output,
                selector,
                render,
            } => {
                let output = output.unwrap_or_else(|| PathBuf::from(output_filename(&url)));
                self.connect().await?;
                self.run_url(&url, &output, render.to_options(selector)).await
            }
            Commands::Html {
                input,
                output,
                render,
            } => {
                let output = output.unwrap_or_else(|| input.with_extension("png"));
                self.connect().await?;
                self.run_html(&input, &output, render.to_options(None)).await
            }
            Commands::Batch {
                input,
                output,
                render,
            } => {
                self.connect().await?;
                let summary = self
                    .run_batch(&input, &output, render.to_options(None))
                    .await?;
                if summary.succeeded == 0 && summary.failed > 0 {
                    bail!("every render in the batch failed");
                }
                Ok(())
            }
            Commands::Status => {
                self.connect().await?;
                self.show_status().await
            }
            Commands::Validate { config } => validate_config(&config).await,
        }
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.chrome
            .connect(&self.config.chrome_endpoint)
            .await
            .context("could not reach Chrome")?;
        Ok(())
    }

    pub async fn run_url(
        &self,
        url: &str,
        output: &Path,
        options: RenderOptions,
    ) -> anyhow::Result<()> {
        info!("Rendering URL: {}", url);
        let started = Instant::now();
        let image = self.service.render_url(url, &options).await?;

        write_image(output, &image).await?;
        println!("Rendered {url}");
        println!("  Output: {}", output.display());
        println!("  Size: {}", format_bytes(image.len()));
        println!("  Duration: {}", format_duration(started.elapsed()));
        Ok(())
    }

    pub async fn run_html(
        &self,
        input: &Path,
        output: &Path,
        options: RenderOptions,
    ) -> anyhow::Result<()> {
        let html = fs::read_to_string(input)
            .await
            .with_context(|| format!("failed to read {}", input.display()))?;

        info!("Rendering HTML file: {}", input.display());
        let started = Instant::now();
        let image = self.service.render_html(&html, &options).await?;

        write_image(output, &image).await?;
        println!("Rendered {}", input.display());
        println!("  Output: {}", output.display());
        println!("  Size: {}", format_bytes(image.len()));
        println!("  Duration: {}", format_duration(started.elapsed()));
        Ok(())
    }

    /// Submit every URL at once; the gate decides what runs and what is turned away.
    pub async fn run_batch(
        &self,
        input: &Path,
        output: &Path,
        options: RenderOptions,
    ) -> anyhow::Result<BatchSummary> {
        let urls = read_urls_from_file(input).await?;
        info!("Loaded {} URLs from {}", urls.len(), input.display());
        fs::create_dir_all(output).await?;

        let started = Instant::now();
        let renders = urls.iter().map(|url| {
            let options = &options;
            async move {
                let image = self.service.render_url(url, options).await?;
                let path = output.join(output_filename(url));
                fs::write(&path, &*image).await?;
                info!("Saved render: {}", path.display());
                Ok::<(), RenderError>(())
            }
        });
        let results = join_all(renders).await;

        let mut summary = BatchSummary::default();
        for (url, result) in urls.iter().zip(&results) {
            if let Err(e) = result {
                warn!("Failed to render {}: {}", url, e);
            }
            summary.record(result);
        }

        println!(
            "Batch completed in {}: {} succeeded, {} failed ({} rejected by a full queue)",
            format_duration(started.elapsed()),
            summary.succeeded,
            summary.failed,
            summary.rejected
        );
        Ok(summary)
    }

    pub async fn show_status(&self) -> anyhow::Result<()> {
        let browser = self.chrome.status().await;
        let stats = self.service.stats();

        println!("Service Status");
        println!("==============");
        println!("Browser:");
        println!("  Connected: {}", browser.connected);
        if let Some(version) = &browser.version {
            println!("  Version: {version}");
        }
        if let Some(endpoint) = self.chrome.endpoint().await {
            println!("  Endpoint: {endpoint}");
        }
        println!("\nRenders:");
        println!("  Active: {}", stats.active_tasks);
        println!("  Queued: {}", stats.queue_length);
        println!("  Cached: {}", stats.cache_size);
        println!("\n{}", serde_json::to_string_pretty(&stats)?);
        Ok(())
    }

    /// Cancel queued work and drop the browser connection.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.service.shutdown();
        if self.service.browser().is_connected() {
            self.chrome
                .disconnect(self.config.auto_close_browser)
                .await?;
        }
        Ok(())
    }
}

async fn write_image(path: &Path, image: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    fs::write(path, image)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

pub async fn read_urls_from_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

pub async fn validate_config(path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());

    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config = serde_json::from_str(&content)?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Chrome endpoint: {}", display_endpoint(&config.chrome_endpoint));
    println!("  Max concurrent: {}", config.max_concurrent);
    println!("  Max queue size: {}", config.max_queue_size);
    println!(
        "  Cache: {} (capacity {}, expiry {} ms)",
        if config.cache_enabled { "enabled" } else { "disabled" },
        config.cache_capacity,
        config.cache_expire_time
    );
    println!(
        "  Default viewport: {}x{}",
        config.default_width, config.default_height
    );
    println!("  Default timeout: {} ms", config.default_timeout);
    Ok(())
}

fn display_endpoint(endpoint: &str) -> &str {
    if endpoint.trim().is_empty() {
        "(not set)"
    } else {
        endpoint
    }
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))
}
