//! Benchmark sampling: run one algorithm on one device, sample its speed
//! every tick and reduce the samples to an average speed vector.

use crate::algorithm::ExcavatorAlgorithm;
use crate::devices::Device;
use crate::settings::BenchmarkTable;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Measurement window after warmup
pub const BENCHMARK_DURATION: Duration = Duration::from_secs(60);

/// Time between speed samples
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// How a benchmark run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchmarkOutcome {
    Completed,
    Cancelled,
    /// Excavator died or stopped answering
    Crashed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkReport {
    /// Average speed per sub-algorithm; all zeros unless `Completed`
    pub speeds: Vec<f64>,
    pub outcome: BenchmarkOutcome,
    /// Samples taken during the measurement window
    pub samples: usize,
}

impl BenchmarkReport {
    fn aborted(width: usize, outcome: BenchmarkOutcome, samples: usize) -> Self {
        Self {
            speeds: vec![0.0; width],
            outcome,
            samples,
        }
    }

    pub fn completed(&self) -> bool {
        self.outcome == BenchmarkOutcome::Completed
    }
}

/// Element-wise mean of `samples`. With no samples, all zeros of `width`.
pub fn average_samples(samples: &[Vec<f64>], width: usize) -> Vec<f64> {
    if samples.is_empty() {
        return vec![0.0; width];
    }
    let mut sums = vec![0.0; width];
    for sample in samples {
        for (sum, speed) in sums.iter_mut().zip(sample) {
            *sum += speed;
        }
    }
    let count = samples.len() as f64;
    sums.into_iter().map(|sum| sum / count).collect()
}

/// Benchmark `algorithm` on `device`.
///
/// Takes `warmup / interval` warmup ticks and then `duration / interval`
/// measurement ticks. Every tick reads the current speeds and hands them to
/// `on_sample` along with the seconds remaining in the phase; warmup reports
/// the remaining time as a negative number.
///
/// Cancellation is checked once per tick. Sampling never restarts excavator:
/// a cancelled or crashed run yields all zeros. The device is always detached
/// from the algorithm afterwards.
pub async fn run_benchmark<F>(
    algorithm: &ExcavatorAlgorithm,
    device: &Device,
    warmup: Duration,
    duration: Duration,
    interval: Duration,
    mut on_sample: F,
    cancel: &CancellationToken,
) -> BenchmarkReport
where
    F: FnMut(&[f64], f64),
{
    let width = algorithm.spec().algorithms.len();
    tracing::info!(
        "Benchmarking {} on {} (warmup {:?}, sampling {:?})",
        algorithm.name(),
        device,
        warmup,
        duration
    );

    let report = match attach_for_benchmark(algorithm, device).await {
        Ok(()) => sample_loop(algorithm, warmup, duration, interval, &mut on_sample, cancel).await,
        Err(e) => {
            tracing::error!("Failed to start benchmark of {}: {}", algorithm.name(), e);
            BenchmarkReport::aborted(width, BenchmarkOutcome::Crashed, 0)
        }
    };

    if let Err(e) = algorithm.set_devices(&[]).await {
        tracing::warn!("Failed to detach {} from {}: {}", device, algorithm.name(), e);
    }
    if let Err(e) = algorithm.set_benchmarking(false).await {
        tracing::warn!("Failed to leave benchmark mode for {}: {}", algorithm.name(), e);
    }

    match report.outcome {
        BenchmarkOutcome::Completed => tracing::info!(
            "Benchmark {} on {}: {:?} over {} samples",
            algorithm.name(),
            device,
            report.speeds,
            report.samples
        ),
        outcome => tracing::warn!(
            "Benchmark {} on {} ended early: {:?}",
            algorithm.name(),
            device,
            outcome
        ),
    }
    report
}

async fn attach_for_benchmark(
    algorithm: &ExcavatorAlgorithm,
    device: &Device,
) -> crate::excavator::ExcavatorResult<()> {
    algorithm.set_devices(&[]).await?;
    algorithm.set_benchmarking(true).await?;
    algorithm.set_devices(std::slice::from_ref(device)).await
}

async fn sample_loop<F>(
    algorithm: &ExcavatorAlgorithm,
    warmup: Duration,
    duration: Duration,
    interval: Duration,
    on_sample: &mut F,
    cancel: &CancellationToken,
) -> BenchmarkReport
where
    F: FnMut(&[f64], f64),
{
    let width = algorithm.spec().algorithms.len();
    let interval = interval.max(Duration::from_millis(1));
    let interval_secs = interval.as_secs_f64();
    let warmup_ticks = (warmup.as_nanos() / interval.as_nanos()) as u64;
    let sample_ticks = (duration.as_nanos() / interval.as_nanos()) as u64;

    let mut samples: Vec<Vec<f64>> = Vec::with_capacity(sample_ticks as usize);
    for tick in 0..warmup_ticks + sample_ticks {
        if cancel.is_cancelled() {
            return BenchmarkReport::aborted(width, BenchmarkOutcome::Cancelled, samples.len());
        }
        if !algorithm.server().is_alive().await {
            return BenchmarkReport::aborted(width, BenchmarkOutcome::Crashed, samples.len());
        }
        let sample = match algorithm.read_speeds().await {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!("Speed query failed during benchmark: {}", e);
                return BenchmarkReport::aborted(width, BenchmarkOutcome::Crashed, samples.len());
            }
        };

        if tick < warmup_ticks {
            let remaining = (warmup_ticks - tick) as f64 * interval_secs;
            on_sample(&sample, -remaining);
        } else {
            let remaining = (warmup_ticks + sample_ticks - tick) as f64 * interval_secs;
            on_sample(&sample, remaining);
            samples.push(sample);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return BenchmarkReport::aborted(width, BenchmarkOutcome::Cancelled, samples.len());
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }

    BenchmarkReport {
        speeds: average_samples(&samples, width),
        outcome: BenchmarkOutcome::Completed,
        samples: samples.len(),
    }
}

/// Every (device, algorithm) pair an algorithm accepts, in device order.
/// With `only_missing`, pairs already present in `table` are skipped.
pub fn benchmark_targets(
    devices: &[Device],
    algorithms: &[Arc<ExcavatorAlgorithm>],
    table: &BenchmarkTable,
    only_missing: bool,
) -> Vec<(Device, Arc<ExcavatorAlgorithm>)> {
    let mut devices = devices.to_vec();
    devices.sort();
    devices
        .into_iter()
        .flat_map(|device| {
            algorithms
                .iter()
                .filter(|algorithm| algorithm.accepts(&device))
                .filter(|algorithm| {
                    !only_missing
                        || !table
                            .get(&device)
                            .is_some_and(|done| done.contains_key(algorithm.name()))
                })
                .map(|algorithm| (device.clone(), algorithm.clone()))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Benchmark every target in turn, recording results in `table`.
///
/// Crashed runs are recorded as zeros. Cancellation ends the sweep; the
/// interrupted run is not recorded and earlier results are kept.
pub async fn run_benchmarks<F>(
    targets: &[(Device, Arc<ExcavatorAlgorithm>)],
    table: &mut BenchmarkTable,
    duration: Duration,
    cancel: &CancellationToken,
    mut on_sample: F,
) -> usize
where
    F: FnMut(&Device, &ExcavatorAlgorithm, &[f64], f64),
{
    let mut recorded = 0;
    for (device, algorithm) in targets {
        if cancel.is_cancelled() {
            break;
        }
        let report = run_benchmark(
            algorithm,
            device,
            algorithm.spec().warmup.duration(),
            duration,
            SAMPLE_INTERVAL,
            |sample, remaining| on_sample(device, algorithm.as_ref(), sample, remaining),
            cancel,
        )
        .await;

        if report.outcome == BenchmarkOutcome::Cancelled {
            tracing::warn!("Benchmarking aborted, completed benchmarks kept");
            break;
        }
        table
            .entry(device.clone())
            .or_default()
            .insert(algorithm.name().to_string(), report.speeds);
        recorded += 1;
    }
    recorded
}
