use clap::Parser;
use page2img::{install_prometheus_recorder, setup_logging, Cli, CliRunner, Config};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting page2img v{}", env!("CARGO_PKG_VERSION"));

    // Metric handles bind to the recorder present when the service is built.
    let prometheus = if args.metrics {
        Some(install_prometheus_recorder()?)
    } else {
        None
    };

    let config = load_config(&args).await?;
    let runner = CliRunner::new(config);

    let result = tokio::select! {
        result = runner.run(args.command) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, stopping");
            Ok(())
        }
    };

    info!("Shutting down...");
    if let Err(e) = runner.shutdown().await {
        error!("Shutdown error: {:#}", e);
    }

    if let Some(handle) = prometheus {
        println!("{}", handle.render());
    }

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("page2img stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };

    args.apply_overrides(&mut config);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!(
        "Max concurrent renders: {}, queue limit: {}",
        config.max_concurrent, config.max_queue_size
    );
    info!("Default timeout: {} ms", config.default_timeout);

    Ok(config)
}
