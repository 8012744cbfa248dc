//! Automatic checkpoint/restart instrumentation for single-entry SSA programs.
//!
//! The pass ([`instrument`]) inserts checkpoint and restart blocks into a function of the
//! [`il`] so that the instrumented program periodically writes its live state to disk
//! ([`runtime`], [`protocol`]) and, when launched again, jumps straight back to the most recent
//! valid checkpoint.

pub mod alias;
pub mod cfg;
pub mod clock;
pub mod containers;
pub mod dataflow;
pub mod error;
pub mod il;
pub mod instrument;
pub mod instrument_config;
pub mod interp;
pub mod liveness;
pub mod parser;
pub mod pointer_analysis;
pub mod protocol;
pub mod runtime;
pub mod selector;
pub mod spill_slots;
pub mod storage;
pub mod transform;

#[cfg(test)]
mod tests;

pub mod log {
    pub use slog_scope::{crit, debug, error, info, trace, warn};

    /// A drain that sends everything to a (JSON) log file when one is requested, and keeps the
    /// terminal for the more severe messages.
    pub struct FileAndTermDrain {
        file_drain: Option<slog::Logger>,
        term_drain: slog::Logger,
    }
    impl FileAndTermDrain {
        /// Build the root logger. `debug_level` counts `-d` flags: 0-warn, 1-info, 2-debug,
        /// 3-trace.
        pub fn new(
            debug_level: usize,
            disable_terminal_logging: bool,
            force_block: bool,
            path: Option<std::path::PathBuf>,
        ) -> Result<slog::Logger, sloggers::Error> {
            use sloggers::types::{Format, OverflowStrategy, Severity};
            use sloggers::Build;

            let severity = match debug_level {
                0 => Severity::Warning,
                1 => Severity::Info,
                2 => Severity::Debug,
                _ => Severity::Trace,
            };

            let term_drain = if disable_terminal_logging {
                sloggers::null::NullLoggerBuilder.build()?
            } else {
                sloggers::terminal::TerminalLoggerBuilder::new()
                    .destination(sloggers::terminal::Destination::Stderr)
                    .level(if path.is_none() {
                        severity
                    } else {
                        Severity::Error
                    })
                    .overflow_strategy(if force_block || path.is_none() {
                        OverflowStrategy::Block
                    } else {
                        OverflowStrategy::DropAndReport
                    })
                    .format(Format::Compact)
                    .build()?
            };

            let file_drain = match path {
                Some(path) => Some(
                    sloggers::file::FileLoggerBuilder::new(path)
                        .truncate()
                        .level(severity)
                        .overflow_strategy(OverflowStrategy::Block)
                        .format(Format::Json)
                        .build()?,
                ),
                None => None,
            };

            Ok(slog::Logger::root(
                Self {
                    file_drain,
                    term_drain,
                },
                slog::o!(),
            ))
        }
    }
    impl slog::Drain for FileAndTermDrain {
        type Ok = ();
        type Err = slog::Never;
        fn log(
            &self,
            r: &slog::Record<'_>,
            kv: &slog::OwnedKVList,
        ) -> Result<<Self as slog::Drain>::Ok, <Self as slog::Drain>::Err> {
            if let Some(f) = &self.file_drain {
                <slog::Logger as slog::Drain>::log(f, r, kv)?;
            }
            <slog::Logger as slog::Drain>::log(&self.term_drain, r, kv)?;
            Ok(())
        }
    }
}
