//! `fmcsa-enrich` - command line entry point

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fmcsa_enrich::enrichment::{
    EnrichmentMode, FileRegisterSource, FmcsaStages, LiveRegisterSource, Orchestrator, RegisterSource,
};
use fmcsa_enrich::infrastructure::config::ConfigManager;
use fmcsa_enrich::infrastructure::logging::{init_logging_with_config, log_directory, log_system_info};
use fmcsa_enrich::infrastructure::{
    BrowserLauncher, CaptchaSolver, DisabledSolver, FmcsaExtractor, HttpLauncher, HttpNavigatorConfig,
    PageExtractor, TwoCaptchaSolver,
};

#[derive(Parser, Debug)]
#[command(name = "fmcsa-enrich", version)]
#[command(about = "Enrich newly registered FMCSA motor carriers with SAFER, SMS and insurance data")]
struct Cli {
    /// Configuration file (JSON); defaults to the per-user config
    #[arg(long, env = "FMCSA_CONFIG")]
    config: Option<PathBuf>,

    /// Register rows to enrich (.json or .csv); the live register is read otherwise
    #[arg(long)]
    input: Option<PathBuf>,

    /// Directory for the progress log and exports
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Log level (e.g. info, debug, fmcsa_enrich=trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Only revisit logged carriers still missing insurance, via their stored L&I link
    #[arg(long)]
    insurance_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.insurance_only {
        EnrichmentMode::InsuranceOnly
    } else {
        EnrichmentMode::Full
    };

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let mut config = manager.load().await?;
    if let Some(dir) = cli.output_dir {
        config.output.output_dir = dir;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    let log_dir = log_directory(&config.logging, &config.output.output_dir);
    init_logging_with_config(&config.logging, &log_dir).context("Failed to initialize logging")?;
    log_system_info();
    info!("Configuration: {:?}", manager.config_path());

    let launcher: Arc<dyn BrowserLauncher> = Arc::new(HttpLauncher::new(HttpNavigatorConfig {
        request_timeout: config.timeouts.navigation(),
        ..HttpNavigatorConfig::default()
    }));
    let extractor: Arc<dyn PageExtractor> = Arc::new(FmcsaExtractor);

    let solver: Arc<dyn CaptchaSolver> = match config.captcha.api_key.as_deref() {
        Some(key) => Arc::new(
            TwoCaptchaSolver::new(key, &config.captcha, config.timeouts.captcha())
                .context("Failed to build CAPTCHA solver")?,
        ),
        None => {
            warn!("⚠️ No 2Captcha API key configured; reCAPTCHA pages will be submitted without a token");
            Arc::new(DisabledSolver)
        }
    };

    let source: Arc<dyn RegisterSource> = match cli.input {
        Some(path) => Arc::new(FileRegisterSource::new(path)),
        None => Arc::new(LiveRegisterSource::new(
            Arc::clone(&launcher),
            Arc::clone(&extractor),
            config.register.clone(),
            config.timeouts.clone(),
        )),
    };

    let pipeline = Arc::new(FmcsaStages::new(
        extractor,
        solver,
        config.timeouts.clone(),
        &config.batch,
    )
    .with_mode(mode));

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let orchestrator = Orchestrator::builder(config)
        .with_register_source(source)
        .with_launcher(launcher)
        .with_pipeline(pipeline)
        .with_mode(mode)
        .with_cancellation(cancel)
        .build()?;

    let summary = orchestrator.run().await.context("Enrichment run failed")?;
    info!("✅ Done: {} record(s) exported", summary.exported);
    Ok(())
}

/// First Ctrl-C stops dispatching new batches; a second one exits immediately
fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("🛑 Interrupt received, finishing in-flight batches (Ctrl-C again to abort)");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Aborting");
            // give the non-blocking log writer a moment to flush
            tokio::time::sleep(Duration::from_millis(200)).await;
            std::process::exit(130);
        }
    });
}
