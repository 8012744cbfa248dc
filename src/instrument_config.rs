//! Flags that can impact instrumentation.
//!
//! The configuration is an ordinary value handed to
//! [`instrument_function`](crate::instrument::instrument_function), so different functions (or
//! tests) can be instrumented with different settings in the same process.

/// The pass configuration. Everything is off by default.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstrumentConfig {
    /// Use an alias oracle that answers "may alias" to every query, instead of comparing the
    /// allocation roots of the two pointers. Alias sets of merged pointers become larger, but
    /// nothing about the program needs to be understood.
    pub use_conservative_alias_oracle: bool,
    /// Keep the merges that dominance repair synthesizes even when they only ever see a single
    /// incoming value (useful when debugging the repair itself).
    pub keep_redundant_repair_merges: bool,
    /// Log the live-in set of every block once liveness converges
    pub trace_live_sets: bool,
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Instrumentation configuration parameters
pub enum CommandLineInstrumentConfig {
    UseConservativeAliasOracle,
    KeepRedundantRepairMerges,
    EnableTraceLiveSets,
}

impl From<Vec<CommandLineInstrumentConfig>> for InstrumentConfig {
    fn from(v: Vec<CommandLineInstrumentConfig>) -> Self {
        use CommandLineInstrumentConfig::*;
        let mut r = InstrumentConfig::default();
        for v in v {
            match v {
                UseConservativeAliasOracle => {
                    r.use_conservative_alias_oracle = true;
                }
                KeepRedundantRepairMerges => {
                    r.keep_redundant_repair_merges = true;
                }
                EnableTraceLiveSets => {
                    r.trace_live_sets = true;
                }
            }
        }
        r
    }
}
