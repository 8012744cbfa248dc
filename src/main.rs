use autocr::*;

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::log::*;

/// Logging options shared by every subcommand
#[derive(clap::Args, Debug)]
struct LogArgs {
    /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
    /// use.
    #[clap(long)]
    debug_disable_terminal_logging: bool,
    /// Force blocking for terminal logging. If too many messages are being spewed the logger,
    /// by default, does not block, but instead dumps a dropped-messages alert. This option
    /// forces it to block and dump even if too many are being sent.
    #[clap(long)]
    debug_forced_blocking_terminal_logging: bool,
    /// Path to send log (as JSON) to
    ///
    /// Error or higher severity alerts will still continue being shown at stderr (in addition
    /// to being added to the log)
    #[clap(long = "log")]
    log_file: Option<PathBuf>,
    /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
    #[clap(short, long, parse(from_occurrences))]
    debug: usize,
}

impl LogArgs {
    fn install(self) -> slog_scope::GlobalLoggerGuard {
        let logger = crate::log::FileAndTermDrain::new(
            self.debug,
            self.debug_disable_terminal_logging,
            self.debug_forced_blocking_terminal_logging,
            self.log_file,
        )
        .unwrap_or_else(|e| {
            eprintln!("Could not set up logging: {}", e);
            std::process::exit(2)
        });
        slog_scope::set_global_logger(logger)
    }
}

/// Automatic checkpoint/restart for SSA programs
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Insert checkpoint/restart instrumentation into a function
    Instrument {
        /// Path to the program, in textual IL form
        input: PathBuf,
        /// The function to instrument
        #[clap(long, default_value = "main")]
        function: String,
        /// Path to output file for the instrumented program (stdout if absent)
        #[clap(long)]
        output: Option<PathBuf>,
        /// Output the instrumented control flow graph as a GraphViz `.dot` file to the given path
        #[clap(long)]
        output_dot: Option<PathBuf>,
        /// Advanced configuration options to tweak the instrumentation
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<instrument_config::CommandLineInstrumentConfig>,
        #[clap(flatten)]
        log: LogArgs,
    },
    /// Execute a program with the reference interpreter
    Run {
        /// Path to the program, in textual IL form
        input: PathBuf,
        /// The function to execute
        #[clap(long, default_value = "main")]
        function: String,
        /// Instrument the function before executing it
        #[clap(long)]
        instrument: bool,
        /// Directory that holds the checkpoint runs (current directory if absent)
        #[clap(long)]
        checkpoint_root: Option<PathBuf>,
        /// Minimum number of seconds between two checkpoints; overrides
        /// `AUTOCR_CHECKPOINT_INTERVAL`
        #[clap(long)]
        interval: Option<String>,
        /// Stop, as if killed, once this many checkpoints have been written
        #[clap(long)]
        halt_after_checkpoints: Option<u64>,
        /// Advanced configuration options to tweak the instrumentation
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<instrument_config::CommandLineInstrumentConfig>,
        #[clap(flatten)]
        log: LogArgs,
        /// Arguments passed to the program
        #[clap(last = true)]
        args: Vec<String>,
    },
    /// List the checkpoints under a directory and the one a restart would resume from
    Verify {
        /// Directory that holds the checkpoint runs (current directory if absent)
        #[clap(long)]
        checkpoint_root: Option<PathBuf>,
        #[clap(flatten)]
        log: LogArgs,
    },
}

fn fail(message: impl std::fmt::Display) -> ! {
    error!("{}", message);
    eprintln!("error: {}", message);
    std::process::exit(1)
}

fn read_program(path: &Path) -> il::Program {
    let text = std::fs::read_to_string(path)
        .unwrap_or_else(|e| fail(format!("could not read `{}`: {}", path.display(), e)));
    parser::parse_program(&text)
        .unwrap_or_else(|e| fail(format!("could not parse `{}`: {}", path.display(), e)))
}

fn write_output(path: Option<PathBuf>, contents: &str) {
    match path {
        Some(path) => std::fs::write(&path, contents)
            .unwrap_or_else(|e| fail(format!("could not write `{}`: {}", path.display(), e))),
        None => print!("{}", contents),
    }
}

fn main() {
    let args = Args::parse();

    match args {
        Args::Instrument {
            input,
            function,
            output,
            output_dot,
            advanced_config,
            log,
        } => {
            let _log_guard = log.install();
            let config = instrument_config::InstrumentConfig::from(advanced_config);

            let mut program = read_program(&input);
            let report = instrument::instrument_program(&mut program, &function, &config)
                .unwrap_or_else(|e| fail(e));
            for site in &report.sites {
                info!(
                    "Checkpoint site";
                    "label" => site.label,
                    "block" => &site.block,
                    "values" => ?site.live,
                );
            }

            write_output(output, &program.to_string());

            if let Some(path) = output_dot {
                if let Some(f) = program.function(&function) {
                    let highlight = report
                        .sites
                        .iter()
                        .filter_map(|s| f.block_by_name(&s.block))
                        .collect();
                    write_output(Some(path), &cfg::CfgSummary::generate_dot(f, &highlight));
                }
            }

            trace!("Done");
        }
        Args::Run {
            input,
            function,
            instrument,
            checkpoint_root,
            interval,
            halt_after_checkpoints,
            advanced_config,
            log,
            args,
        } => {
            let _log_guard = log.install();

            let mut program = read_program(&input);
            if instrument {
                let config = instrument_config::InstrumentConfig::from(advanced_config);
                instrument::instrument_program(&mut program, &function, &config)
                    .unwrap_or_else(|e| fail(e));
            }
            let f = program
                .function(&function)
                .unwrap_or_else(|| fail(format!("no function named `{}`", function)));

            let config = runtime::RuntimeConfig::from_env().with_interval_override(interval.as_deref());
            let storage = storage::FsStorage::new(checkpoint_root.unwrap_or_else(|| ".".into()));
            let rt = runtime::CheckpointRuntime::new(config, storage, clock::SystemClock::new());
            let mut interp = interp::Interpreter::new(
                rt,
                interp::ExecConfig {
                    halt_after_checkpoints,
                    ..Default::default()
                },
            );

            let outcome = interp.run_main(f, &args);
            for line in interp.output() {
                println!("{}", line);
            }
            match outcome {
                Ok(interp::Outcome::Returned(v)) => {
                    info!("Returned"; "value" => v.map(|v| v.to_string()));
                }
                Ok(interp::Outcome::Halted { checkpoints }) => {
                    eprintln!("halted after {} checkpoints", checkpoints);
                }
                Err(e) => fail(e),
            }
            let stats = interp.runtime().stats();
            debug!(
                "Checkpoint statistics";
                "performed" => stats.performed,
                "skipped" => stats.skipped,
                "restored" => stats.restored,
            );
        }
        Args::Verify {
            checkpoint_root,
            log,
        } => {
            let _log_guard = log.install();

            let storage = storage::FsStorage::new(checkpoint_root.unwrap_or_else(|| ".".into()));
            let config = runtime::RuntimeConfig::from_env();
            for dir in protocol::candidate_checkpoints(&storage, &config.prefix) {
                match protocol::validate_checkpoint(&storage, &dir) {
                    Ok(info) => println!(
                        "{}: label {}, {} entries",
                        dir.display(),
                        info.label,
                        info.var_count
                    ),
                    Err(e) => println!("{}: invalid ({})", dir.display(), e),
                }
            }

            let mut rt: runtime::CheckpointRuntime<(), _, _> =
                runtime::CheckpointRuntime::new(config, storage, clock::SystemClock::new());
            match rt.restart_get_label() {
                Some(label) => println!(
                    "restart resumes at label {} from {}",
                    label,
                    rt.restart_checkpoint()
                        .map(|d| d.display().to_string())
                        .unwrap_or_default()
                ),
                None => println!("no valid checkpoint; a restart starts from the beginning"),
            }
        }
    }
}
