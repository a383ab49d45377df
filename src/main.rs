use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use hashswitch::algorithm::{default_catalog, ExcavatorAlgorithm};
use hashswitch::benchmark::{benchmark_targets, run_benchmarks, BENCHMARK_DURATION};
use hashswitch::cli::{display_banner, Args};
use hashswitch::devices::{enumerate_nvidia, Device};
use hashswitch::excavator::{ephemeral_address, ExcavatorServer, ServerConfig};
use hashswitch::format::{format_speeds, format_time};
use hashswitch::nicehash::NiceHashApi;
use hashswitch::session::MiningSession;
use hashswitch::settings::{self, BenchmarkTable, Settings, SettingsError};
use hashswitch::switching::NaiveSwitcher;

fn list_devices(devices: &[Device]) {
    let mut devices = devices.to_vec();
    devices.sort();
    if devices.is_empty() {
        println!("{}", "No devices found".yellow());
    }
    for device in devices {
        println!("CUDA device: {} ({})", device.name.green(), device.uuid);
    }
}

fn build_server(args: &Args, config_dir: &Path, settings: &Settings) -> Result<Arc<ExcavatorServer>> {
    let executable = args
        .excavator
        .clone()
        .unwrap_or_else(|| config_dir.join("excavator").join("excavator"));
    let address = match settings.excavator.listen_address()? {
        Some(address) => address,
        None => ephemeral_address().context("picking a port for excavator")?,
    };
    let mut config = ServerConfig::new(executable, address);
    config.extra_args = settings.excavator.extra_args();
    Ok(Arc::new(ExcavatorServer::new(config)))
}

/// Benchmark each target, printing a live progress line.
async fn benchmark_sweep(
    targets: &[(Device, Arc<ExcavatorAlgorithm>)],
    benchmarks: &mut BenchmarkTable,
    cancel: &CancellationToken,
) -> usize {
    if targets.is_empty() {
        return 0;
    }
    println!("\n{}", "=== Benchmarking ===".cyan().bold());

    let mut last_device: Option<Device> = None;
    let mut status_dot = 0usize;
    let mut progress = |device: &Device, algorithm: &ExcavatorAlgorithm, sample: &[f64], remaining: f64| {
        if last_device.as_ref() != Some(device) {
            println!("\nCUDA device: {} ({})", device.name.green(), device.uuid);
            last_device = Some(device.clone());
        }
        status_dot = (status_dot + 1) % 3;
        let dots: String = (0..3).map(|i| if i == status_dot { '.' } else { ' ' }).collect();
        let phase = if remaining < 0.0 { "warming up" } else { "sampling" };
        print!(
            "  {} {} {} ({}, {})   \r",
            algorithm.name(),
            dots,
            format_speeds(sample),
            phase,
            format_time(remaining.abs().round() as u64)
        );
        let _ = std::io::stdout().flush();
    };

    let recorded = run_benchmarks(targets, benchmarks, BENCHMARK_DURATION, cancel, &mut progress).await;

    for (device, algorithm) in targets.iter().take(recorded) {
        let speeds = benchmarks
            .get(device)
            .and_then(|b| b.get(algorithm.name()))
            .cloned()
            .unwrap_or_default();
        if speeds.iter().all(|s| *s == 0.0) {
            println!("  {}: {}", algorithm.name(), "failed to complete benchmark".red());
        } else {
            println!("  {}: {}{}", algorithm.name(), format_speeds(&speeds), " ".repeat(22));
        }
    }
    if recorded < targets.len() && cancel.is_cancelled() {
        println!("\n{}", "Benchmarking aborted (completed benchmarks saved).".yellow());
    }
    recorded
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_filter())),
        )
        .init();

    let config_dir = args.configdir.clone().unwrap_or_else(settings::default_config_dir);
    let devices = enumerate_nvidia().context("enumerating devices")?;

    if args.list_devices {
        list_devices(&devices);
        return Ok(());
    }

    display_banner();

    let nx_settings = match args.prepare_settings(&config_dir) {
        Ok(nx_settings) => nx_settings,
        Err(SettingsError::MissingWallet) => {
            eprintln!("{}", "Error: no wallet configured".red().bold());
            eprintln!("{}", "Run once with --wallet <ADDRESS> [--worker NAME] [--region REGION].".yellow());
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };
    let subscription = nx_settings.nicehash.subscription()?;
    let mut benchmarks = settings::load_benchmarks(&config_dir, &devices)?;
    let mining = !args.benchmark_all && !args.benchmark_missing;

    println!("\n{}", "=== Configuration ===".cyan().bold());
    println!("{:<15} {}", "Config dir:".green(), config_dir.display().to_string().bright_white());
    println!("{:<15} {}", "Wallet:".green(), nx_settings.nicehash.wallet.bright_white());
    println!("{:<15} {}", "Worker:".green(), nx_settings.nicehash.workername.bright_white());
    println!("{:<15} {}", "Region:".green(), nx_settings.nicehash.region.bright_white());
    println!("{:<15} {}", "Devices:".green(), devices.len().to_string().bright_white());

    let server = build_server(&args, &config_dir, &nx_settings)?;
    server.set_subscription(subscription).await?;
    let algorithms = ExcavatorAlgorithm::from_catalog(&default_catalog(), &server);

    // Ctrl+C cancels whatever is running
    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                println!("\n{}", "Interrupt signal received, shutting down...".yellow().bold());
                cancel_on_signal.cancel();
            }
            Err(err) => {
                eprintln!("Unable to listen for shutdown signal: {}", err);
            }
        }
    });

    let targets = benchmark_targets(&devices, &algorithms, &benchmarks, !args.benchmark_all);
    if !targets.is_empty() {
        server.start().await.context("starting excavator")?;
        benchmark_sweep(&targets, &mut benchmarks, &cancel).await;
        settings::save_benchmarks(&config_dir, &benchmarks)?;
    }

    if mining && !cancel.is_cancelled() {
        println!("\n{}", "=== Mining ===".cyan().bold());
        let prices = Arc::new(NiceHashApi::new()?);
        let mut session = MiningSession::new(server.clone(), algorithms, devices, benchmarks, prices)
            .with_switcher(Box::new(NaiveSwitcher::new(nx_settings.switching.threshold)))
            .with_intervals(nx_settings.switching_interval(), nx_settings.watchdog_interval());
        session.run(cancel.clone()).await?;
    } else {
        server.stop().await?;
    }
    Ok(())
}
