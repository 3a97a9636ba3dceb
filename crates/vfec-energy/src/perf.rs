//! One hardware-counter sampling session per repetition.
//!
//! The (possibly looped) command runs under `perf stat -x<sep> -o <file>`,
//! and the counter file is parsed into an [`EnergyMeasurement`] normalized
//! to a single logical run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vfec_core::exec::{CommandRunner, CommandSpec};
use vfec_core::{CalibrationResult, EnergyConfig, EnergyMeasurement, VfecError};

/// Name `$0` is set to inside the loop wrapper.
const LOOP_ARGV0: &str = "vfec-loop";

/// Upper bound on a `perf list` probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Keep the candidate energy events that `perf list` reports for this host.
///
/// Falls back to all candidates when probing fails or matches nothing;
/// unsupported rows are then dropped at parse time.
pub async fn probe_energy_events(runner: &dyn CommandRunner, config: &EnergyConfig) -> Vec<String> {
    let spec = CommandSpec::new(&config.perf_program)
        .arg("list")
        .timeout(PROBE_TIMEOUT);
    let listing = match runner.run(&spec).await {
        Ok(out) if out.success() => out.stdout,
        Ok(out) => {
            tracing::warn!(status = %out.status_label(), "perf list failed, requesting all candidate energy events");
            String::new()
        }
        Err(e) => {
            tracing::warn!(error = %e, "perf list unavailable, requesting all candidate energy events");
            String::new()
        }
    };

    let supported: Vec<String> = config
        .candidate_energy_events
        .iter()
        .filter(|ev| listing.contains(ev.as_str()))
        .cloned()
        .collect();

    if supported.is_empty() {
        config.candidate_energy_events.clone()
    } else {
        tracing::debug!(events = ?supported, "probed energy events");
        supported
    }
}

/// Run `cmd` `loop_count` times in one process, without shell interpolation
/// of its arguments. Any failing iteration ends the loop with its status.
///
/// # Examples
///
/// ```
/// use vfec_core::exec::CommandSpec;
/// use vfec_energy::perf::wrap_loop;
///
/// let once = wrap_loop(&CommandSpec::new("./t").arg("a b"), 1);
/// assert_eq!(once.argv(), vec!["./t", "a b"]);
///
/// let looped = wrap_loop(&CommandSpec::new("./t").arg("a b"), 250);
/// assert_eq!(looped.program, "sh");
/// assert!(looped.args[1].contains("-lt 250"));
/// assert_eq!(&looped.args[2..], &["vfec-loop", "./t", "a b"]);
/// ```
pub fn wrap_loop(cmd: &CommandSpec, loop_count: u32) -> CommandSpec {
    if loop_count <= 1 {
        return cmd.clone();
    }
    let script = format!(
        "i=0; while [ \"$i\" -lt {loop_count} ]; do \"$@\" >/dev/null 2>&1 || exit $?; i=$((i+1)); done"
    );
    CommandSpec {
        program: "sh".into(),
        args: ["-c".to_string(), script, LOOP_ARGV0.to_string()]
            .into_iter()
            .chain(cmd.argv())
            .collect(),
        env: cmd.env.clone(),
        cwd: cmd.cwd.clone(),
        timeout: cmd.timeout,
    }
}

/// Parse a counter value, normalizing locale punctuation.
///
/// With both `.` and `,` present the last one is the decimal mark. A lone
/// mark repeated, or a single `,` followed by exactly three digits after a
/// non-zero group of at most three digits, is a thousands separator.
///
/// # Examples
///
/// ```
/// use vfec_energy::perf::parse_number;
///
/// assert_eq!(parse_number("2,306.32"), Some(2306.32));
/// assert_eq!(parse_number("2.306,32"), Some(2306.32));
/// assert_eq!(parse_number("1,234,567"), Some(1234567.0));
/// assert_eq!(parse_number("0,53"), Some(0.53));
/// assert_eq!(parse_number("<not counted>"), None);
/// ```
pub fn parse_number(raw: &str) -> Option<f64> {
    let s: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '\'' | '\u{a0}' | '\u{202f}'))
        .collect();
    if s.is_empty() {
        return None;
    }

    let dots = s.matches('.').count();
    let commas = s.matches(',').count();

    let canonical = match (dots, commas) {
        (_, 0) if dots > 1 => s.replace('.', ""),
        (_, 0) => s,
        (0, 1) => {
            let (int_part, frac) = s.split_once(',')?;
            let grouped = frac.len() == 3
                && frac.bytes().all(|b| b.is_ascii_digit())
                && (1..=3).contains(&int_part.len())
                && int_part != "0";
            if grouped {
                s.replace(',', "")
            } else {
                s.replace(',', ".")
            }
        }
        (0, _) => s.replace(',', ""),
        _ => {
            let last_dot = s.rfind('.')?;
            let last_comma = s.rfind(',')?;
            if last_dot > last_comma {
                s.replace(',', "")
            } else {
                s.replace('.', "").replace(',', ".")
            }
        }
    };

    let value: f64 = canonical.parse().ok()?;
    value.is_finite().then_some(value)
}

/// Reduce a perf event name to the logical event it counts.
///
/// Hybrid-core PMU prefixes (`cpu_atom/cycles/`) and modifiers (`cycles:u`)
/// are stripped; `power/<domain>/` energy events keep their full name.
///
/// # Examples
///
/// ```
/// use vfec_energy::perf::normalize_event_name;
///
/// assert_eq!(normalize_event_name("cpu_atom/cycles/"), "cycles");
/// assert_eq!(normalize_event_name("instructions:u"), "instructions");
/// assert_eq!(normalize_event_name("power/energy-pkg/"), "power/energy-pkg/");
/// ```
pub fn normalize_event_name(raw: &str) -> String {
    let name = raw.trim();
    if name.starts_with("power/") {
        return name.to_string();
    }
    let base = match name.split_once('/') {
        Some((_pmu, rest)) => rest.split('/').next().unwrap_or(rest),
        None => name,
    };
    let base = base.split(':').next().unwrap_or(base);
    base.split(',').next().unwrap_or(base).trim().to_string()
}

/// Sum counter values per logical event from `perf stat -x` output.
///
/// Rows are `value<sep>unit<sep>event<sep>…`. Rows whose value is
/// `<not counted>` or `<not supported>` are skipped, never read as zero;
/// repeated events (one row per core cluster) are summed.
///
/// # Examples
///
/// ```
/// use vfec_energy::perf::parse_counters;
///
/// let text = "100,,cpu_atom/cycles/,1000,100.00,,\n<not counted>,,cpu_core/cycles/,0,0.00,,\n";
/// let counters = parse_counters(text, ",");
/// assert_eq!(counters.get("cycles"), Some(&100.0));
/// ```
pub fn parse_counters(text: &str, separator: &str) -> BTreeMap<String, f64> {
    let mut counters = BTreeMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(separator).collect();
        if fields.len() < 3 {
            continue;
        }
        let raw_value = fields[0].trim();
        if raw_value.starts_with('<') {
            tracing::debug!(row = %line, "skipping uncounted event");
            continue;
        }
        let event = normalize_event_name(fields[2]);
        if event.is_empty() {
            continue;
        }
        match parse_number(raw_value) {
            Some(value) => *counters.entry(event).or_insert(0.0) += value,
            None => tracing::debug!(row = %line, "unparseable counter value"),
        }
    }

    counters
}

/// Build one normalized measurement from parsed counters.
///
/// # Errors
///
/// Returns [`VfecError::Measurement`] if no counters were read at all.
pub fn measurement_from_counters(
    counters: &BTreeMap<String, f64>,
    elapsed: Duration,
    loop_count: u32,
    run_index: u32,
    config: &EnergyConfig,
) -> Result<EnergyMeasurement, VfecError> {
    if counters.is_empty() {
        return Err(VfecError::Measurement("no counters in perf output".into()));
    }
    let n = f64::from(loop_count.max(1));

    let energy_domains: BTreeMap<String, f64> = counters
        .iter()
        .filter(|(name, _)| name.starts_with("power/"))
        .map(|(name, v)| (name.clone(), v / n))
        .collect();

    let energy_j = energy_domains
        .get(&config.primary_energy_event)
        .or_else(|| {
            config
                .candidate_energy_events
                .iter()
                .find_map(|ev| energy_domains.get(ev))
        })
        .or_else(|| energy_domains.values().next())
        .copied();

    let cycles = counters
        .get(&normalize_event_name(&config.cycles_event))
        .map(|v| v / n);
    let instructions = counters
        .get(&normalize_event_name(&config.instructions_event))
        .map(|v| v / n);
    let ipc = match (instructions, cycles) {
        (Some(_), Some(c)) if c == 0.0 => Some(0.0),
        (Some(i), Some(c)) => Some(i / c),
        _ => None,
    };

    Ok(EnergyMeasurement {
        run_index,
        time_sec: elapsed.as_secs_f64() / n,
        energy_j,
        energy_domains,
        cycles,
        instructions,
        ipc,
    })
}

/// Runs a calibrated command under `perf stat` and parses the result.
pub struct PerfSession<'r> {
    runner: &'r dyn CommandRunner,
    config: EnergyConfig,
    energy_events: Vec<String>,
    output_path: PathBuf,
}

impl<'r> PerfSession<'r> {
    /// `output_path` is the counter file; it is removed before and after
    /// every repetition.
    pub fn new(
        runner: &'r dyn CommandRunner,
        config: &EnergyConfig,
        energy_events: Vec<String>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            config: config.clone(),
            energy_events,
            output_path: output_path.into(),
        }
    }

    /// Probe the host's energy events, then build the session.
    pub async fn probe(
        runner: &'r dyn CommandRunner,
        config: &EnergyConfig,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        let events = probe_energy_events(runner, config).await;
        Self::new(runner, config, events, output_path)
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Comma-joined `-e` argument.
    pub fn event_list(&self) -> String {
        let mut events = self.energy_events.clone();
        events.push(self.config.cycles_event.clone());
        events.push(self.config.instructions_event.clone());
        events.join(",")
    }

    /// The full sampling command for `cmd` looped `loop_count` times.
    pub fn build_command(&self, cmd: &CommandSpec, loop_count: u32) -> CommandSpec {
        let inner = wrap_loop(cmd, loop_count);

        let mut argv: Vec<String> = self.config.perf_prefix.clone();
        argv.push(self.config.perf_program.clone());
        argv.push("stat".into());
        if self.config.system_wide {
            argv.push("-a".into());
        }
        argv.extend([
            "-e".to_string(),
            self.event_list(),
            "-x".to_string(),
            self.config.field_separator.clone(),
            "-o".to_string(),
            self.output_path.to_string_lossy().into_owned(),
            "--".to_string(),
        ]);
        argv.extend(inner.argv());

        let (program, args) = match argv.split_first() {
            Some((p, rest)) => (p.clone(), rest.to_vec()),
            None => (self.config.perf_program.clone(), Vec::new()),
        };

        let timeout = self.config.timeout().or_else(|| {
            cmd.timeout
                .and_then(|t| t.checked_mul(loop_count.max(1)))
        });

        CommandSpec {
            program,
            args,
            env: cmd.env.clone(),
            cwd: cmd.cwd.clone(),
            timeout,
        }
    }

    /// Run one repetition.
    ///
    /// # Errors
    ///
    /// Returns [`VfecError::Measurement`] if the session cannot run, exits
    /// unsuccessfully, or yields no counters. Partial output is discarded.
    pub async fn sample(
        &self,
        cmd: &CommandSpec,
        calibration: &CalibrationResult,
        run_index: u32,
    ) -> Result<EnergyMeasurement, VfecError> {
        self.discard_output().await;
        let spec = self.build_command(cmd, calibration.loop_count);

        let output = match self.runner.run(&spec).await {
            Ok(out) => out,
            Err(e) => {
                self.discard_output().await;
                return Err(VfecError::Measurement(format!(
                    "sampling run {run_index} of `{cmd}` failed: {e}"
                )));
            }
        };

        if !output.success() {
            self.discard_output().await;
            return Err(VfecError::Measurement(format!(
                "sampling run {run_index} of `{cmd}` ended with {}: {}",
                output.status_label(),
                output.tail(5)
            )));
        }

        let text = tokio::fs::read_to_string(&self.output_path)
            .await
            .map_err(|e| {
                VfecError::Measurement(format!(
                    "counter output {} unreadable: {e}",
                    self.output_path.display()
                ))
            });
        self.discard_output().await;
        let text = text?;

        let counters = parse_counters(&text, &self.config.field_separator);
        let measurement = measurement_from_counters(
            &counters,
            output.elapsed,
            calibration.loop_count,
            run_index,
            &self.config,
        )?;
        tracing::debug!(
            run_index,
            time_sec = measurement.time_sec,
            energy_j = ?measurement.energy_j,
            cycles = ?measurement.cycles,
            "sampled"
        );
        Ok(measurement)
    }

    async fn discard_output(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.output_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.output_path.display(), error = %e, "could not remove counter output");
            }
        }
    }
}
