pub mod artifact;
pub mod builder;
pub mod cli;
pub mod communicator;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod hook;
pub mod provider;
pub mod provisioner;
pub mod runner;
pub mod state;
pub mod step;
pub mod steps;
pub mod ui;
pub mod wait;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::CommandFactory;
use tracing::info;
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

use crate::builder::Builder;
use crate::communicator::SshCommunicator;
use crate::config::{BuildConfig, EipMode, KeypairMode, RawConfig, SecurityGroupMode};
use crate::context::BuildContext;
use crate::executor::RealCommandExecutor;
use crate::provider::SimulatedProvider;
use crate::ui::LogUi;

/// Address handed out for a pre-existing elastic IP in `plan`.
const PLAN_EIP_ADDRESS: &str = "198.51.100.10";

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(filter).finish(),
    )
    .context("failed to set global default tracing subscriber")
}

fn load_template(file: &camino::Utf8Path) -> Result<RawConfig> {
    RawConfig::from_file(file).with_context(|| format!("failed to load template from {}", file))
}

pub fn run_validate(opts: &cli::ValidateArgs) -> Result<()> {
    let raw = load_template(&opts.common.file)?;
    let (config, warnings) = raw.validate().context("template validation failed")?;
    for warning in &warnings {
        tracing::warn!("{}", warning);
    }
    info!("validation successful:\n{:#?}", config);
    Ok(())
}

/// A simulated cloud that already holds every resource the template
/// references by id.
fn plan_provider(config: &BuildConfig) -> SimulatedProvider {
    let zone = config.zone.as_str();
    let mut provider = SimulatedProvider::new();
    if let SecurityGroupMode::Existing(id) = &config.security_group {
        provider = provider.with_security_group(zone, id);
    }
    if let KeypairMode::Existing(id) = &config.keypair {
        provider = provider.with_keypair(zone, id);
    }
    if let EipMode::Existing(id) = &config.eip {
        provider = provider.with_eip(zone, id, PLAN_EIP_ADDRESS);
    }
    provider
}

/// Runs the whole pipeline against [`SimulatedProvider`] with remote
/// commands printed instead of executed.
pub fn run_plan(opts: &cli::PlanArgs) -> Result<()> {
    let raw = load_template(&opts.common.file)?;
    let (config, _) = raw.validate().context("template validation failed")?;

    let provider = Arc::new(plan_provider(&config));
    let communicator = SshCommunicator::new(Arc::new(RealCommandExecutor { dry_run: true }))
        .with_retry_interval(config.interval);
    let mut builder = Builder::new(provider, Arc::new(communicator));
    builder.prepare(&raw)?;

    let ctx = match opts.timeout {
        Some(secs) => BuildContext::with_timeout(Duration::from_secs(secs)),
        None => BuildContext::new(),
    };
    let artifact = builder
        .run(&ctx, Arc::new(LogUi), None)
        .context("planned build failed")?;
    println!("{} ({})", artifact, artifact.builder_id());
    Ok(())
}

pub fn run_completions(opts: &cli::CompletionsArgs) -> Result<()> {
    let mut cmd = cli::Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(opts.shell, &mut cmd, name, &mut io::stdout());
    Ok(())
}
