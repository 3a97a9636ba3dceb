use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vfec_core::exec::{CommandRunner, CommandSpec};
use vfec_core::{AggregatedMetric, CalibrationResult, EnergyConfig, EnergyMeasurement, UnitKey, VfecError};

use crate::calibrate::EnergyCalibrator;
use crate::perf::PerfSession;

/// Mean, median, and sample standard deviation of `values`.
///
/// Non-finite values are ignored. No values at all yields
/// [`AggregatedMetric::absent`]; a single value has stdev 0.
///
/// # Examples
///
/// ```
/// use vfec_energy::summarize;
///
/// let m = summarize(&[10.0, 12.0, 14.0]);
/// assert_eq!(m.mean, Some(12.0));
/// assert_eq!(m.median, Some(12.0));
/// assert_eq!(m.sample_count, 3);
///
/// assert!(summarize(&[]).is_absent());
/// ```
pub fn summarize(values: &[f64]) -> AggregatedMetric {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return AggregatedMetric::absent();
    }
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let mean = sorted.iter().sum::<f64>() / n as f64;
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };
    let stdev = if n > 1 {
        let ss: f64 = sorted.iter().map(|v| (v - mean).powi(2)).sum();
        (ss / (n - 1) as f64).sqrt()
    } else {
        0.0
    };

    AggregatedMetric {
        mean: Some(mean),
        median: Some(median),
        stdev: Some(stdev),
        sample_count: n,
    }
}

fn summarize_by<F>(samples: &[EnergyMeasurement], pick: F) -> AggregatedMetric
where
    F: Fn(&EnergyMeasurement) -> Option<f64>,
{
    let values: Vec<f64> = samples.iter().filter_map(pick).collect();
    summarize(&values)
}

/// Energy cost of one test, aggregated over successful repetitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<UnitKey>,
    pub calibration: CalibrationResult,
    pub repetitions_requested: u32,
    pub repetitions_failed: u32,
    pub time_sec: AggregatedMetric,
    pub energy_j: AggregatedMetric,
    pub cycles: AggregatedMetric,
    pub instructions: AggregatedMetric,
    pub ipc: AggregatedMetric,
    #[serde(default)]
    pub energy_domains: BTreeMap<String, AggregatedMetric>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<EnergyMeasurement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl EnergyReport {
    pub fn from_samples(
        calibration: CalibrationResult,
        repetitions_requested: u32,
        samples: Vec<EnergyMeasurement>,
        failures: Vec<String>,
    ) -> Self {
        let mut domains: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for s in &samples {
            for (name, v) in &s.energy_domains {
                domains.entry(name.clone()).or_default().push(*v);
            }
        }

        Self {
            key: None,
            calibration,
            repetitions_requested,
            repetitions_failed: u32::try_from(failures.len()).unwrap_or(u32::MAX),
            time_sec: summarize_by(&samples, |s| Some(s.time_sec)),
            energy_j: summarize_by(&samples, |s| s.energy_j),
            cycles: summarize_by(&samples, |s| s.cycles),
            instructions: summarize_by(&samples, |s| s.instructions),
            ipc: summarize_by(&samples, |s| s.ipc),
            energy_domains: domains
                .into_iter()
                .map(|(name, values)| (name, summarize(&values)))
                .collect(),
            samples,
            failures,
        }
    }

    pub fn with_key(mut self, key: UnitKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Drop raw samples, keeping only aggregates.
    pub fn without_samples(mut self) -> Self {
        self.samples.clear();
        self
    }

    pub fn successful_repetitions(&self) -> usize {
        self.time_sec.sample_count
    }

    /// True when no repetition succeeded.
    pub fn is_empty(&self) -> bool {
        self.time_sec.is_absent()
    }
}

/// Repeats a [`PerfSession`] with a cool-down between repetitions.
pub struct MetricAggregator<'s, 'r> {
    session: &'s PerfSession<'r>,
    repetitions: u32,
    cool_down: Duration,
}

impl<'s, 'r> MetricAggregator<'s, 'r> {
    pub fn new(session: &'s PerfSession<'r>, config: &EnergyConfig) -> Self {
        Self {
            session,
            repetitions: config.repetitions,
            cool_down: config.cool_down(),
        }
    }

    pub fn with_repetitions(mut self, repetitions: u32) -> Self {
        self.repetitions = repetitions;
        self
    }

    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    /// Sample `cmd` the configured number of times.
    ///
    /// Failed repetitions are excluded from the statistics and listed in
    /// [`EnergyReport::failures`].
    pub async fn measure(&self, cmd: &CommandSpec, calibration: &CalibrationResult) -> EnergyReport {
        let mut samples = Vec::new();
        let mut failures = Vec::new();

        for run_index in 1..=self.repetitions {
            if run_index > 1 && !self.cool_down.is_zero() {
                tokio::time::sleep(self.cool_down).await;
            }
            match self.session.sample(cmd, calibration, run_index).await {
                Ok(m) => samples.push(m),
                Err(e) => {
                    tracing::warn!(command = %cmd, run_index, error = %e, "discarding repetition");
                    failures.push(e.to_string());
                }
            }
        }

        let report =
            EnergyReport::from_samples(*calibration, self.repetitions, samples, failures);
        tracing::info!(
            command = %cmd,
            successful = report.successful_repetitions(),
            failed = report.repetitions_failed,
            energy_median = ?report.energy_j.median,
            "energy measured"
        );
        report
    }
}

/// Calibration, probing, and repeated sampling behind one call.
pub struct EnergyMeter<'r> {
    runner: &'r dyn CommandRunner,
    config: EnergyConfig,
    output_path: PathBuf,
    energy_events: Option<Vec<String>>,
}

impl<'r> EnergyMeter<'r> {
    pub fn new(runner: &'r dyn CommandRunner, config: &EnergyConfig, output_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            config: config.clone(),
            output_path: output_path.into(),
            energy_events: None,
        }
    }

    /// Probe the host's energy events once; later sessions reuse them.
    pub async fn probe(&mut self) -> &[String] {
        if self.energy_events.is_none() {
            let events = crate::perf::probe_energy_events(self.runner, &self.config).await;
            self.energy_events = Some(events);
        }
        self.energy_events.as_deref().unwrap_or_default()
    }

    pub async fn calibrate(&self, cmd: &CommandSpec) -> Result<CalibrationResult, VfecError> {
        EnergyCalibrator::new(self.runner, &self.config).calibrate(cmd).await
    }

    /// Sample an already calibrated command.
    pub async fn sample(&mut self, cmd: &CommandSpec, calibration: &CalibrationResult) -> EnergyReport {
        let events = self.probe().await.to_vec();
        let session = PerfSession::new(self.runner, &self.config, events, &self.output_path);
        MetricAggregator::new(&session, &self.config)
            .measure(cmd, calibration)
            .await
    }

    /// Calibrate `cmd`, then sample it.
    ///
    /// # Errors
    ///
    /// Returns [`VfecError::Calibration`] if the dry run fails; no sampling
    /// is attempted then.
    pub async fn measure(&mut self, cmd: &CommandSpec) -> Result<EnergyReport, VfecError> {
        let calibration = self.calibrate(cmd).await?;
        Ok(self.sample(cmd, &calibration).await)
    }
}
