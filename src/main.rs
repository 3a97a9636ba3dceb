use std::io::IsTerminal;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use miette::{Context, IntoDiagnostic, Result};

use vfec_core::exec::{CommandSpec, ProcessRunner};
use vfec_core::{
    secs_to_duration, CalibrationResult, OutputFormat, PairKey, UnitStage, VfecConfig,
};
use vfec_coverage::joiner::{CoverageDiffReport, DiffCoverageJoiner};
use vfec_coverage::lcov::{CoverageIndex, LcovOptions};
use vfec_coverage::output::{format_json, format_markdown, format_text, View};
use vfec_difflens::mapper::{HunkMapper, MappedDiff};
use vfec_energy::{EnergyMeter, EnergyReport};
use vfec_pipeline::{GitWorkTree, PairOutcome, Pipeline, RunContext, StateLedger, UnitStatus};

const DEFAULT_CONFIG_PATH: &str = "vfec.toml";

#[derive(Parser)]
#[command(
    name = "vfec",
    version,
    about = "Coverage differentials and energy cost of vulnerability fixes",
    long_about = "vfec correlates the lines a security fix changed with the tests that execute them,\n\
                   and measures the energy those tests cost before and after the fix.\n\n\
                   Examples:\n  \
                     vfec map --repo . --fix HEAD             Align changed lines of the last commit\n  \
                     vfec coverage --diff fix.diff --vuln-lcov v.info --fix-lcov f.info\n  \
                     vfec measure -- ./tests/unit1300         Calibrated energy for one command\n  \
                     vfec run --project curl --repo ../curl --fix 192c4f7"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (default: vfec.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        global = true,
        default_value = "text",
        long_help = "Output format for command results.\n\n\
                       Formats:\n  \
                         text      Human-readable tables and summaries (default)\n  \
                         json      Machine-readable JSON with camelCase keys\n  \
                         markdown  GitHub-flavored Markdown"
    )]
    format: OutputFormat,

    /// Enable verbose output (debug logging unless RUST_LOG is set)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// When to use colors
    #[arg(long, global = true, default_value = "auto")]
    color: ColorChoice,
}

#[derive(Subcommand)]
enum Command {
    /// Align changed lines between the vulnerable and fixed revisions
    #[command(long_about = "Align changed lines between the vulnerable and fixed revisions.\n\n\
        Reads a zero-context unified diff from a file, stdin, or two commits of a\n\
        repository, and prints one correspondence per changed line offset.\n\n\
        Examples:\n  git diff -U0 A B | vfec map\n  vfec map --repo . --vuln HEAD~1 --fix HEAD")]
    Map {
        /// Read the diff from a file instead of stdin
        #[arg(long, conflicts_with = "repo")]
        file: Option<PathBuf>,

        /// Compute the diff between two commits of this repository
        #[arg(long, requires = "fix")]
        repo: Option<PathBuf>,

        /// Vulnerable commit (default: first parent of --fix)
        #[arg(long, requires = "repo")]
        vuln: Option<String>,

        /// Fixed commit
        #[arg(long, requires = "repo")]
        fix: Option<String>,
    },
    /// Join a diff with the LCOV reports of both revisions
    #[command(long_about = "Join a diff with the LCOV reports of both revisions.\n\n\
        Every changed line is classified by its hit counts on each side; lines with no\n\
        coverage data on either side are not executable.\n\n\
        Examples:\n  vfec coverage --diff fix.diff --vuln-lcov vuln.info --fix-lcov fix.info --root /src/curl")]
    Coverage {
        /// Zero-context unified diff
        #[arg(long)]
        diff: PathBuf,

        /// LCOV report of the vulnerable revision
        #[arg(long)]
        vuln_lcov: PathBuf,

        /// LCOV report of the fixed revision
        #[arg(long)]
        fix_lcov: PathBuf,

        /// Source root stripped from absolute LCOV paths
        #[arg(long)]
        root: Option<PathBuf>,

        /// Show executable rows only
        #[arg(long)]
        clean: bool,
    },
    /// Time one dry run of a command and derive its loop count
    Calibrate {
        /// Command to calibrate
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
    /// Measure the energy of a command under perf stat
    #[command(long_about = "Measure the energy of a command under perf stat.\n\n\
        The command is calibrated first; short commands are looped inside one\n\
        perf session and the counters normalized back to a single run.\n\n\
        Examples:\n  vfec measure -- ./tests/unit1300\n  vfec measure --repetitions 10 --cool-down 2 -- ./runtests.pl 1300")]
    Measure {
        /// Number of sampling repetitions (default from config)
        #[arg(long)]
        repetitions: Option<u32>,

        /// Seconds to wait between repetitions (default from config)
        #[arg(long)]
        cool_down: Option<f64>,

        /// Command to measure
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
    /// Run the full pipeline for one commit pair
    #[command(long_about = "Run the full pipeline for one commit pair.\n\n\
        Builds both revisions with coverage instrumentation, runs each test, keeps\n\
        the tests that touch a changed file, rebuilds without instrumentation, and\n\
        measures those tests. Finished units are recorded in the state ledger and\n\
        reused on the next run.\n\n\
        Examples:\n  vfec run --project curl --repo ../curl --fix 192c4f7\n  vfec run --project curl --repo ../curl --fix 192c4f7 --test 1300 --test 1301")]
    Run {
        /// Project name, selecting [projects.<name>] in the config
        #[arg(long)]
        project: String,

        /// Repository work tree (default: current directory)
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Fixed commit
        #[arg(long)]
        fix: String,

        /// Vulnerable commit (default: first parent of --fix)
        #[arg(long)]
        vuln: Option<String>,

        /// Restrict the run to these tests
        #[arg(long = "test")]
        tests: Vec<String>,
    },
    /// List the units recorded in the state ledger
    #[command(long_about = "List the units recorded in the state ledger.\n\n\
        Each (project, commit, test) unit shows its last stage and when it changed.\n\
        Failed units are skipped by later runs until they are retried.\n\n\
        Examples:\n  vfec status\n  vfec status --project curl --retry-failed")]
    Status {
        /// Only units of this project
        #[arg(long)]
        project: Option<String>,

        /// Drop failed units so the next run processes them again
        #[arg(long)]
        retry_failed: bool,
    },
    /// Create a default vfec.toml configuration file
    Init,
    /// Generate shell completions
    #[command(hide = true)]
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, PartialEq, Eq, ValueEnum)]
enum ColorChoice {
    /// Auto-detect based on terminal
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

fn print_welcome(use_color: bool) {
    let version = env!("CARGO_PKG_VERSION");

    if use_color {
        println!("\x1b[1mvfec\x1b[0m v{version}: coverage differentials and energy cost of security fixes\n");

        println!("Quick start:");
        println!("  \x1b[36mvfec init\x1b[0m                     Create a vfec.toml config file");
        println!("  \x1b[36mvfec map --repo . --fix HEAD\x1b[0m  Align the lines changed by a commit\n");

        println!("All commands:");
        println!("  \x1b[32mmap\x1b[0m        Line correspondences of a diff");
        println!("  \x1b[32mcoverage\x1b[0m   Join a diff with two LCOV reports");
        println!("  \x1b[32mcalibrate\x1b[0m  Loop count for a short command");
        println!("  \x1b[32mmeasure\x1b[0m    Calibrated energy of a command");
        println!("  \x1b[32mrun\x1b[0m        Full pipeline for one commit pair");
        println!("  \x1b[32mstatus\x1b[0m     Units recorded in the state ledger");
        println!("  \x1b[32minit\x1b[0m       Create default configuration\n");
    } else {
        println!("vfec v{version}: coverage differentials and energy cost of security fixes\n");

        println!("Quick start:");
        println!("  vfec init                     Create a vfec.toml config file");
        println!("  vfec map --repo . --fix HEAD  Align the lines changed by a commit\n");

        println!("All commands:");
        println!("  map        Line correspondences of a diff");
        println!("  coverage   Join a diff with two LCOV reports");
        println!("  calibrate  Loop count for a short command");
        println!("  measure    Calibrated energy of a command");
        println!("  run        Full pipeline for one commit pair");
        println!("  status     Units recorded in the state ledger");
        println!("  init       Create default configuration\n");
    }

    println!("Run 'vfec <command> --help' for details.");
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<VfecConfig> {
    let config = match path {
        Some(path) => VfecConfig::from_file(path)
            .wrap_err_with(|| format!("loading {}", path.display()))?,
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                VfecConfig::from_file(default_path).wrap_err("loading vfec.toml")?
            } else {
                VfecConfig::default()
            }
        }
    };
    Ok(config)
}

fn read_diff_input(file: &Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err(format!("reading {}", path.display())),
        None => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .into_diagnostic()
                .wrap_err("reading stdin")?;
            Ok(input)
        }
    }
}

fn resolve_pair(repo: &Path, project: &str, vuln: Option<&str>, fix: &str) -> Result<PairKey> {
    let fix = vfec_gitpulse::resolve_commit(repo, fix)?;
    let vuln = match vuln {
        Some(spec) => vfec_gitpulse::resolve_commit(repo, spec)?,
        None => vfec_gitpulse::parent_of(repo, &fix)
            .wrap_err("no --vuln given and the fixed commit has no parent")?,
    };
    Ok(PairKey::new(project, vuln, fix))
}

fn line_label(line: Option<u32>) -> String {
    line.map_or_else(|| "N/A".to_string(), |l| l.to_string())
}

fn print_mapped(mapped: &MappedDiff, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(mapped).into_diagnostic()?);
        }
        OutputFormat::Markdown => {
            println!("| File | Vulnerable | Fixed |");
            println!("|------|-----------:|------:|");
            for c in &mapped.correspondences {
                println!(
                    "| `{}` | {} | {} |",
                    c.file.display(),
                    line_label(c.vuln_line),
                    line_label(c.fix_line)
                );
            }
        }
        OutputFormat::Text => {
            if mapped.correspondences.is_empty() {
                println!("no changed lines");
            }
            let width = mapped
                .correspondences
                .iter()
                .map(|c| c.file.display().to_string().len())
                .max()
                .unwrap_or(4);
            for c in &mapped.correspondences {
                println!(
                    "{:<width$}  {:>6}  {:>6}",
                    c.file.display().to_string(),
                    line_label(c.vuln_line),
                    line_label(c.fix_line)
                );
            }
            println!(
                "\n{} hunk(s), {} line(s), {} file(s)",
                mapped.hunks.len(),
                mapped.correspondences.len(),
                mapped.changed_files().len()
            );
        }
    }
    for skip in &mapped.skips {
        eprintln!(
            "warning: skipped diff line {}: {} ({})",
            skip.line_number, skip.reason, skip.line
        );
    }
    Ok(())
}

fn print_coverage(report: &CoverageDiffReport, view: View, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", format_json(report, view)?),
        OutputFormat::Markdown => print!("{}", format_markdown(report, view)),
        OutputFormat::Text => print!("{}", format_text(report, view)),
    }
    Ok(())
}

fn metric(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{v:.6} {unit}"),
        None => "N/A".to_string(),
    }
}

fn energy_lines(report: &EnergyReport) -> Vec<String> {
    let mut lines = vec![
        format!(
            "loop count {} (dry run {:.4}s), {}/{} repetitions succeeded",
            report.calibration.loop_count,
            report.calibration.dry_run_duration_sec,
            report.successful_repetitions(),
            report.repetitions_requested
        ),
        format!(
            "energy  median {}  mean {}  stdev {}",
            metric(report.energy_j.median, "J"),
            metric(report.energy_j.mean, "J"),
            metric(report.energy_j.stdev, "J")
        ),
        format!(
            "time    median {}  mean {}",
            metric(report.time_sec.median, "s"),
            metric(report.time_sec.mean, "s")
        ),
        format!(
            "cycles  {}  instructions {}  ipc {}",
            metric(report.cycles.median, ""),
            metric(report.instructions.median, ""),
            metric(report.ipc.median, "")
        ),
    ];
    for (domain, m) in &report.energy_domains {
        lines.push(format!("{domain}  median {}", metric(m.median, "J")));
    }
    for failure in &report.failures {
        lines.push(format!("failed: {failure}"));
    }
    lines
}

fn print_energy(report: &EnergyReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report).into_diagnostic()?);
        }
        OutputFormat::Markdown => {
            for line in energy_lines(report) {
                println!("- {line}");
            }
        }
        OutputFormat::Text => {
            for line in energy_lines(report) {
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn print_calibration(calibration: &CalibrationResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(calibration).into_diagnostic()?);
        }
        OutputFormat::Markdown | OutputFormat::Text => {
            println!(
                "dry run {:.4}s, loop count {}{}",
                calibration.dry_run_duration_sec,
                calibration.loop_count,
                if calibration.is_batched() { " (batched)" } else { "" }
            );
        }
    }
    Ok(())
}

fn print_outcome(outcome: &PairOutcome, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(outcome).into_diagnostic()?);
        return Ok(());
    }

    let md = format == OutputFormat::Markdown;
    if md {
        println!("# {} {}\n", outcome.pair.project, outcome.pair.label());
    } else {
        println!("{} {}", outcome.pair.project, outcome.pair.label());
    }
    println!(
        "{} hunk(s) in {} file(s), {} test(s), {} relevant\n",
        outcome.hunks,
        outcome.changed_files.len(),
        outcome.tests.len(),
        outcome.relevant_tests().count()
    );

    for test in outcome.relevant_tests() {
        print_coverage(&test.coverage, View::Clean, format)?;
        for (side, energy) in [("vulnerable", &test.vuln_energy), ("fixed", &test.fix_energy)] {
            let Some(report) = energy else { continue };
            if md {
                println!("\n**{side} energy**\n");
            } else {
                println!("{side} energy:");
            }
            for line in energy_lines(report) {
                if md {
                    println!("- {line}");
                } else {
                    println!("  {line}");
                }
            }
        }
        println!();
    }

    if !outcome.failures.is_empty() {
        if md {
            println!("## Failures\n");
        } else {
            println!("failures:");
        }
        for f in &outcome.failures {
            let prefix = if md { "- " } else { "  " };
            println!("{prefix}{} [{}] at {}: {}", f.key, f.kind, f.stage, f.message);
        }
    }
    Ok(())
}

fn print_units(units: &[UnitStatus], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(units).into_diagnostic()?);
        }
        OutputFormat::Markdown => {
            println!("| Unit | Stage | Updated |");
            println!("|------|-------|---------|");
            for u in units {
                println!("| `{}` | {} | {} |", u.key, u.stage, u.updated_at.to_rfc3339());
            }
        }
        OutputFormat::Text => {
            if units.is_empty() {
                println!("no units recorded");
            }
            for u in units {
                println!(
                    "{:<40}  {:<16}  {}",
                    u.key.to_string(),
                    u.stage.to_string(),
                    u.updated_at.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}

/// Directory for the ledger, counter files, and coverage reports.
fn state_dir(config: &VfecConfig) -> PathBuf {
    match config.state.ledger_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn progress_bar() -> Option<indicatif::ProgressBar> {
    if !std::io::stderr().is_terminal() {
        return None;
    }
    let pb = indicatif::ProgressBar::new_spinner();
    if let Ok(style) = indicatif::ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    Some(pb)
}

const DEFAULT_CONFIG: &str = r#"# vfec configuration

[coverage]
# project_root = "/src/curl"
# exclude_patterns = ["/usr/*", "*/tests/*"]
# source_extensions = ["c", "h", "cc", "cpp", "cxx", "hpp"]
# accumulator_extension = "gcda"
# default_source_extension = "c"

[energy]
# min_duration_secs = 0.5
# max_loops = 2000
# repetitions = 3
# cool_down_secs = 1.0
# perf_program = "perf"
# perf_prefix = ["sudo", "-n"]
# system_wide = true
# only_relevant_tests = true

[execution]
# build_timeout_secs = 1200
# test_timeout_secs = 600
# jobs = 8

[state]
# ledger_path = ".vfec/state.db"

# Per-project build profiles
# [projects.curl]
# build_system = "autotools"
# tests = ["1300", "1301"]
# test = ["make", "check", "TESTS={test}"]
"#;

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .into_diagnostic()?;
    human_panic::setup_panic!();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    tracing::debug!(
        config = ?cli.config,
        projects = config.projects.len(),
        format = %cli.format,
        "configuration loaded"
    );

    let use_color = match cli.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => std::io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    };

    match cli.command {
        None => {
            print_welcome(use_color);
            return Ok(());
        }
        Some(Command::Map {
            ref file,
            ref repo,
            ref vuln,
            ref fix,
        }) => {
            let diff = match (repo, fix) {
                (Some(repo), Some(fix)) => {
                    let pair = resolve_pair(repo, "", vuln.as_deref(), fix)?;
                    vfec_gitpulse::diff_text(repo, &pair.vuln_commit, &pair.fix_commit)?
                }
                _ => read_diff_input(file)?,
            };
            let mapped = HunkMapper::map(&diff);
            print_mapped(&mapped, cli.format)?;
        }
        Some(Command::Coverage {
            ref diff,
            ref vuln_lcov,
            ref fix_lcov,
            ref root,
            clean,
        }) => {
            let diff_text = std::fs::read_to_string(diff)
                .into_diagnostic()
                .wrap_err(format!("reading {}", diff.display()))?;
            for lcov in [vuln_lcov, fix_lcov] {
                if !lcov.exists() {
                    miette::bail!("coverage report {} does not exist", lcov.display());
                }
            }

            let mut options = LcovOptions::from_config(&config.coverage);
            if let Some(root) = root.clone().or_else(|| config.coverage.project_root.clone()) {
                options = options.with_root(root);
            }
            let vuln = CoverageIndex::from_file(vuln_lcov, &options);
            let fix = CoverageIndex::from_file(fix_lcov, &options);

            let mapped = HunkMapper::map(&diff_text);
            let report = DiffCoverageJoiner::new(&vuln, &fix).join(&mapped.correspondences);
            let view = if clean { View::Clean } else { View::Master };
            print_coverage(&report, view, cli.format)?;
        }
        Some(Command::Calibrate { ref cmd }) => {
            let runner = ProcessRunner;
            let spec = CommandSpec::from_argv(cmd)?
                .timeout(Duration::from_secs(config.execution.test_timeout_secs));
            let meter = EnergyMeter::new(&runner, &config.energy, PathBuf::new());
            let calibration = meter.calibrate(&spec).await?;
            print_calibration(&calibration, cli.format)?;
        }
        Some(Command::Measure {
            repetitions,
            cool_down,
            ref cmd,
        }) => {
            let mut energy = config.energy.clone();
            if let Some(n) = repetitions {
                if n == 0 {
                    miette::bail!("--repetitions must be at least 1");
                }
                energy.repetitions = n;
            }
            if let Some(secs) = cool_down {
                secs_to_duration("--cool-down", secs)?;
                energy.cool_down_secs = secs;
            }

            let dir = state_dir(&config);
            std::fs::create_dir_all(&dir)
                .into_diagnostic()
                .wrap_err(format!("creating {}", dir.display()))?;

            let runner = ProcessRunner;
            let spec = CommandSpec::from_argv(cmd)?
                .timeout(Duration::from_secs(config.execution.test_timeout_secs));
            let mut meter = EnergyMeter::new(&runner, &energy, dir.join("perf-counters.csv"));
            let report = meter.measure(&spec).await?;
            print_energy(&report, cli.format)?;
            if report.is_empty() {
                miette::bail!("no repetition of `{spec}` produced counters");
            }
        }
        Some(Command::Run {
            ref project,
            ref repo,
            ref fix,
            ref vuln,
            ref tests,
        }) => {
            let pair = resolve_pair(repo, project, vuln.as_deref(), fix)?;

            let dir = state_dir(&config);
            std::fs::create_dir_all(&dir)
                .into_diagnostic()
                .wrap_err(format!("creating {}", dir.display()))?;
            let ledger = StateLedger::open(&config.state.ledger_path)?;

            let runner = ProcessRunner;
            let mut worktree = GitWorkTree::new(&runner, repo);
            let repo_abs = repo.canonicalize().into_diagnostic()?;
            let dir_abs = dir.canonicalize().into_diagnostic()?;
            if let Ok(inside) = dir_abs.strip_prefix(&repo_abs) {
                if inside.as_os_str().is_empty() {
                    miette::bail!(miette::miette!(
                        help = "set [state] ledger_path to a subdirectory or outside the repository",
                        "state directory {} is the work tree itself",
                        dir.display()
                    ));
                }
                worktree = worktree.preserve(inside);
            }

            let pipeline = Pipeline::new(
                &runner,
                &worktree,
                &ledger,
                &config,
                project.clone(),
                dir.join("scratch"),
            )
            .with_tests(tests.clone());

            let spinner = progress_bar();
            let mut ctx = RunContext::new();
            if let Some(pb) = &spinner {
                pb.set_message(format!("{} {}", project, pair.label()));
                let pb = pb.clone();
                ctx = ctx.with_observer(move |key, stage| {
                    pb.set_message(format!("{key} {stage}"));
                });
            }

            let outcome = pipeline.run_pair(&mut ctx, &pair).await.inspect_err(|_e| {
                if let Some(pb) = &spinner {
                    pb.finish_with_message("Failed");
                }
            })?;
            if let Some(pb) = spinner {
                pb.finish_and_clear();
            }

            print_outcome(&outcome, cli.format)?;
        }
        Some(Command::Status {
            ref project,
            retry_failed,
        }) => {
            if !config.state.ledger_path.exists() {
                print_units(&[], cli.format)?;
                return Ok(());
            }
            let ledger = StateLedger::open(&config.state.ledger_path)?;
            let mut units = ledger.units(project.as_deref())?;
            if retry_failed {
                let mut retried = 0;
                for unit in units.iter().filter(|u| u.stage == UnitStage::Failed) {
                    if ledger.forget(&unit.key)? {
                        retried += 1;
                    }
                }
                units.retain(|u| u.stage != UnitStage::Failed);
                eprintln!("{retried} failed unit(s) will run again");
            }
            print_units(&units, cli.format)?;
        }
        Some(Command::Init) => {
            let path = Path::new(DEFAULT_CONFIG_PATH);
            if path.exists() {
                miette::bail!("vfec.toml already exists");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created vfec.toml with default configuration");
        }
        Some(Command::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "vfec", &mut std::io::stdout());
        }
    }

    Ok(())
}
