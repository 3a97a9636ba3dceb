use std::time::Duration;

use vfec_core::exec::{CommandRunner, CommandSpec};
use vfec_core::{CalibrationResult, EnergyConfig, VfecError};

/// Loop multiplier needed for a command of duration `d` to reach `floor`.
///
/// `d >= floor` gives 1. Otherwise `ceil(floor / d)` clamped to
/// `[1, max_loops]`; an unmeasurably short dry run gets `max_loops`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vfec_energy::calibrate::loop_count_for;
///
/// let floor = Duration::from_millis(500);
/// assert_eq!(loop_count_for(Duration::from_millis(2), floor, 2000), 250);
/// assert_eq!(loop_count_for(Duration::from_millis(600), floor, 2000), 1);
/// assert_eq!(loop_count_for(Duration::from_micros(10), floor, 2000), 2000);
/// ```
pub fn loop_count_for(d: Duration, floor: Duration, max_loops: u32) -> u32 {
    let max_loops = max_loops.max(1);
    if d >= floor {
        return 1;
    }
    let d_ns = d.as_nanos();
    if d_ns == 0 {
        return max_loops;
    }
    let needed = floor.as_nanos().div_ceil(d_ns);
    u32::try_from(needed).unwrap_or(u32::MAX).clamp(1, max_loops)
}

/// Times one dry run of a command and derives its loop multiplier.
pub struct EnergyCalibrator<'r> {
    runner: &'r dyn CommandRunner,
    min_duration: Duration,
    max_loops: u32,
}

impl<'r> EnergyCalibrator<'r> {
    pub fn new(runner: &'r dyn CommandRunner, config: &EnergyConfig) -> Self {
        Self {
            runner,
            min_duration: config.min_duration(),
            max_loops: config.max_loops,
        }
    }

    /// Run `cmd` once and compute its [`CalibrationResult`].
    ///
    /// # Errors
    ///
    /// Returns [`VfecError::Calibration`] if the dry run cannot be spawned,
    /// times out, or exits unsuccessfully. Energy must not be measured for
    /// the command in that case.
    pub async fn calibrate(&self, cmd: &CommandSpec) -> Result<CalibrationResult, VfecError> {
        let output = self
            .runner
            .run(cmd)
            .await
            .map_err(|e| VfecError::Calibration(format!("dry run of `{cmd}` failed: {e}")))?;

        if !output.success() {
            return Err(VfecError::Calibration(format!(
                "dry run of `{cmd}` ended with {}: {}",
                output.status_label(),
                output.tail(5)
            )));
        }

        let loop_count = loop_count_for(output.elapsed, self.min_duration, self.max_loops);
        let result = CalibrationResult {
            loop_count,
            dry_run_duration_sec: output.elapsed.as_secs_f64(),
        };

        if result.is_batched() {
            tracing::info!(
                command = %cmd,
                duration_sec = result.dry_run_duration_sec,
                loop_count,
                "command below measurable duration, batching"
            );
        } else {
            tracing::debug!(command = %cmd, duration_sec = result.dry_run_duration_sec, "no batching needed");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vfec_core::exec::{ExecOutput, ScriptedRunner};

    fn runner_with(exit_code: Option<i32>, elapsed: Duration) -> ScriptedRunner {
        ScriptedRunner::new(move |_| {
            Ok(ExecOutput {
                exit_code,
                stderr: "Segmentation fault".into(),
                elapsed,
                ..Default::default()
            })
        })
    }

    #[test]
    fn loop_count_boundaries() {
        let floor = Duration::from_millis(500);
        assert_eq!(loop_count_for(floor, floor, 2000), 1);
        assert_eq!(loop_count_for(Duration::from_millis(499), floor, 2000), 2);
        assert_eq!(loop_count_for(Duration::from_millis(3), floor, 2000), 167);
        assert_eq!(loop_count_for(Duration::ZERO, floor, 2000), 2000);
        assert_eq!(loop_count_for(Duration::from_nanos(1), floor, 2000), 2000);
        assert_eq!(loop_count_for(Duration::from_millis(1), floor, 0), 1);
    }

    #[tokio::test]
    async fn fast_command_is_batched() {
        let runner = runner_with(Some(0), Duration::from_millis(2));
        let calibrator = EnergyCalibrator::new(&runner, &EnergyConfig::default());
        let result = calibrator.calibrate(&CommandSpec::new("./unit1300")).await.unwrap();
        assert_eq!(result.loop_count, 250);
        assert!((result.dry_run_duration_sec - 0.002).abs() < 1e-9);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn slow_command_runs_once() {
        let runner = runner_with(Some(0), Duration::from_millis(600));
        let calibrator = EnergyCalibrator::new(&runner, &EnergyConfig::default());
        let result = calibrator.calibrate(&CommandSpec::new("make")).await.unwrap();
        assert_eq!(result.loop_count, 1);
        assert!(!result.is_batched());
    }

    #[tokio::test]
    async fn crashed_dry_run_fails_calibration() {
        let runner = runner_with(None, Duration::from_millis(1));
        let calibrator = EnergyCalibrator::new(&runner, &EnergyConfig::default());
        let err = calibrator.calibrate(&CommandSpec::new("./crash")).await.unwrap_err();
        assert!(matches!(err, VfecError::Calibration(ref m) if m.contains("Segmentation fault")));
    }

    #[tokio::test]
    async fn timed_out_dry_run_fails_calibration() {
        let runner = ScriptedRunner::new(|spec| {
            Err(VfecError::Timeout {
                program: spec.program.clone(),
                limit: Duration::from_secs(1),
            })
        });
        let calibrator = EnergyCalibrator::new(&runner, &EnergyConfig::default());
        let err = calibrator.calibrate(&CommandSpec::new("./hang")).await.unwrap_err();
        assert!(matches!(err, VfecError::Calibration(ref m) if m.contains("timed out")));
    }
}
