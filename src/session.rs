//! Mining session: the periodic switching loop and the excavator watchdog.

use crate::algorithm::{AlgorithmSpec, ExcavatorAlgorithm};
use crate::devices::Device;
use crate::excavator::{ExcavatorResult, ExcavatorServer};
use crate::format::format_revenue;
use crate::nicehash::{Payrates, PriceSource};
use crate::settings::BenchmarkTable;
use crate::switching::{Assignment, NaiveSwitcher, ProfitSwitcher, RevenueTable};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delay between pricing attempts before the first table arrives
pub const PRICING_RETRY: Duration = Duration::from_secs(5);

/// Expected BTC/day of `spec` given its benchmarked `speeds`.
///
/// Sub-algorithms without a pay rate, or a missing benchmark, count as zero.
pub fn revenue(spec: &AlgorithmSpec, speeds: Option<&Vec<f64>>, payrates: &Payrates) -> f64 {
    let Some(speeds) = speeds else {
        return 0.0;
    };
    spec.algorithms
        .iter()
        .zip(speeds)
        .map(|(sub, speed)| payrates.get(sub).copied().unwrap_or(0.0) * speed)
        .sum()
}

/// Revenue of every accepted (device, algorithm) pair.
pub fn compute_revenues(
    devices: &[Device],
    algorithms: &[Arc<ExcavatorAlgorithm>],
    benchmarks: &BenchmarkTable,
    payrates: &Payrates,
) -> RevenueTable {
    devices
        .iter()
        .map(|device| {
            let device_benchmarks = benchmarks.get(device);
            let revenues = algorithms
                .iter()
                .filter(|algorithm| algorithm.accepts(device))
                .map(|algorithm| {
                    let speeds = device_benchmarks.and_then(|b| b.get(algorithm.name()));
                    (
                        algorithm.name().to_string(),
                        revenue(algorithm.spec(), speeds, payrates),
                    )
                })
                .collect::<BTreeMap<_, _>>();
            (device.clone(), revenues)
        })
        .collect()
}

/// Sleep for `duration` unless cancelled first. Returns false on cancellation.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// One watchdog pass: restart excavator if it is down. Returns whether a
/// restart happened.
pub async fn check_once(server: &ExcavatorServer) -> ExcavatorResult<bool> {
    if server.is_running().await {
        return Ok(false);
    }
    server.ensure_running().await
}

/// Check excavator health every `interval` until cancelled.
///
/// Returns an error only when excavator can no longer be started; other
/// restart failures are logged and retried on the next pass.
pub async fn run_watchdog(
    server: Arc<ExcavatorServer>,
    interval: Duration,
    cancel: CancellationToken,
) -> ExcavatorResult<()> {
    tracing::debug!("Watchdog started ({:?})", interval);
    while sleep_or_cancel(interval, &cancel).await {
        match check_once(&server).await {
            Ok(true) => tracing::warn!("Excavator was down and has been restarted"),
            Ok(false) => {}
            Err(e) if e.is_start_failure() => {
                tracing::error!("Excavator cannot be started: {}", e);
                return Err(e);
            }
            Err(e) => tracing::error!("Failed to restart excavator: {}", e),
        }
    }
    tracing::debug!("Watchdog stopped");
    Ok(())
}

pub struct MiningSession {
    server: Arc<ExcavatorServer>,
    algorithms: Vec<Arc<ExcavatorAlgorithm>>,
    devices: Vec<Device>,
    benchmarks: BenchmarkTable,
    prices: Arc<dyn PriceSource>,
    switcher: Box<dyn ProfitSwitcher>,
    interval: Duration,
    watchdog_interval: Duration,
    pricing_retry: Duration,
    payrates: Option<(Payrates, DateTime<Local>)>,
    assignment: Assignment,
}

impl MiningSession {
    pub fn new(
        server: Arc<ExcavatorServer>,
        algorithms: Vec<Arc<ExcavatorAlgorithm>>,
        devices: Vec<Device>,
        benchmarks: BenchmarkTable,
        prices: Arc<dyn PriceSource>,
    ) -> Self {
        Self {
            server,
            algorithms,
            devices,
            benchmarks,
            prices,
            switcher: Box::new(NaiveSwitcher::new(0.1)),
            interval: Duration::from_secs(60),
            watchdog_interval: Duration::from_secs(10),
            pricing_retry: PRICING_RETRY,
            payrates: None,
            assignment: Assignment::new(),
        }
    }

    pub fn with_switcher(mut self, switcher: Box<dyn ProfitSwitcher>) -> Self {
        self.switcher = switcher;
        self
    }

    pub fn with_intervals(mut self, switching: Duration, watchdog: Duration) -> Self {
        self.interval = switching;
        self.watchdog_interval = watchdog;
        self
    }

    pub fn with_pricing_retry(mut self, retry: Duration) -> Self {
        self.pricing_retry = retry;
        self
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    /// Mine until `cancel` fires, then detach everything and stop excavator.
    ///
    /// If excavator stops being startable the session shuts down and
    /// returns the failure.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Querying NiceHash for pay rates...");
        loop {
            match self.prices.payrates().await {
                Ok(rates) => {
                    self.payrates = Some((rates, Local::now()));
                    break;
                }
                Err(e) => {
                    tracing::warn!("NiceHash stats: {:#}, retrying in {:?}", e, self.pricing_retry);
                    if !sleep_or_cancel(self.pricing_retry, &cancel).await {
                        return Ok(());
                    }
                }
            }
        }

        self.server.start().await.context("starting excavator")?;
        self.switcher.reset();

        let halt = CancellationToken::new();
        let watchdog_cancel = cancel.child_token();
        let watchdog = {
            let halt = halt.clone();
            let checks = run_watchdog(
                self.server.clone(),
                self.watchdog_interval,
                watchdog_cancel.clone(),
            );
            tokio::spawn(async move {
                let result = checks.await;
                if result.is_err() {
                    halt.cancel();
                }
                result
            })
        };

        let mut failure = None;
        loop {
            if let Err(e) = self.switch_once().await {
                failure = Some(e);
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = halt.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        watchdog_cancel.cancel();
        match watchdog.await {
            Ok(Err(e)) if failure.is_none() => failure = Some(e),
            Ok(_) => {}
            Err(e) => tracing::error!("Watchdog task failed: {}", e),
        }

        let Some(e) = failure else {
            tracing::info!("Quit signal received, stopping miners");
            return self.shutdown().await;
        };
        tracing::error!("Stopping: {}", e);
        if let Err(stop) = self.shutdown().await {
            tracing::warn!("Shutdown after failure: {:#}", stop);
        }
        Err(anyhow::Error::new(e).context("excavator cannot be started"))
    }

    /// Refresh prices, decide and apply one assignment.
    ///
    /// Failures are logged; a failed pricing call reuses the last table.
    /// Only a start failure of excavator is returned.
    pub async fn switch_once(&mut self) -> ExcavatorResult<&Assignment> {
        match self.prices.payrates().await {
            Ok(rates) => self.payrates = Some((rates, Local::now())),
            Err(e) => tracing::warn!("NiceHash stats: {:#}, using last known pay rates", e),
        }
        let Some((payrates, timestamp)) = &self.payrates else {
            tracing::warn!("No pay rates yet, skipping switch");
            return Ok(&self.assignment);
        };

        let revenues = compute_revenues(&self.devices, &self.algorithms, &self.benchmarks, payrates);
        for (device, device_revenues) in &revenues {
            for (algorithm, revenue) in device_revenues {
                tracing::debug!("{} {}: {}", device, algorithm, format_revenue(*revenue));
            }
        }
        let decision = self.switcher.decide(&revenues, *timestamp);
        self.apply(&decision).await?;
        self.assignment = decision;
        Ok(&self.assignment)
    }

    /// Detach devices that move away before attaching anywhere, so a device
    /// never runs two algorithms at once.
    async fn apply(&self, decision: &Assignment) -> ExcavatorResult<()> {
        let targets: Vec<(Arc<ExcavatorAlgorithm>, Vec<Device>)> = self
            .algorithms
            .iter()
            .map(|algorithm| {
                let devices = decision
                    .iter()
                    .filter(|(_, name)| name.as_str() == algorithm.name())
                    .map(|(device, _)| device.clone())
                    .collect();
                (algorithm.clone(), devices)
            })
            .collect();

        for (algorithm, target) in &targets {
            let keep: Vec<Device> = algorithm
                .devices()
                .await
                .into_iter()
                .filter(|d| target.contains(d))
                .collect();
            match algorithm.set_devices(&keep).await {
                Err(e) if e.is_start_failure() => return Err(e),
                Err(e) => tracing::error!("Failed to detach devices from {}: {}", algorithm.name(), e),
                Ok(()) => {}
            }
        }
        for (algorithm, target) in &targets {
            match algorithm.set_devices(target).await {
                Err(e) if e.is_start_failure() => return Err(e),
                Err(e) => tracing::error!("Failed to assign devices to {}: {}", algorithm.name(), e),
                Ok(()) => {}
            }
        }
        Ok(())
    }

    /// Detach every device and stop excavator.
    ///
    /// A dead excavator is not restarted just to detach from it.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.server.is_alive().await {
            for algorithm in &self.algorithms {
                if let Err(e) = algorithm.set_devices(&[]).await {
                    tracing::warn!("Failed to detach {}: {}", algorithm.name(), e);
                }
            }
        }
        self.assignment.clear();
        self.server.stop().await.context("stopping excavator")
    }
}
