//! The checkpoint/restart pass as a whole

use crate::alias::{AliasOracle, MayAliasAll, ProvenanceOracle};
use crate::cfg::{split_merge_blocks, summarize};
use crate::error::AnalysisError;
use crate::il::{Function, Program};
use crate::instrument_config::InstrumentConfig;
use crate::liveness::Liveness;
use crate::log::*;
use crate::pointer_analysis::PointerAnalysis;
use crate::selector::select;
use crate::transform::{transform, SiteReport};

/// Outcome of instrumenting one function
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstrumentationReport {
    pub function: String,
    pub sites: Vec<SiteReport>,
}

/// Instrument `f` in place. On error `f` is left in an unspecified state and must be discarded.
pub fn instrument_function(
    f: &mut Function,
    config: &InstrumentConfig,
) -> Result<InstrumentationReport, AnalysisError> {
    f.validate().map_err(AnalysisError::Malformed)?;
    if f.is_instrumented() {
        return Err(AnalysisError::AlreadyInstrumented(f.name.clone()));
    }

    let oracle: Box<dyn AliasOracle> = if config.use_conservative_alias_oracle {
        Box::new(MayAliasAll)
    } else {
        Box::new(ProvenanceOracle::new(f))
    };
    let pointers = PointerAnalysis::analyze(f, oracle.as_ref())?;
    debug!("Pointer analysis done"; "function" => &f.name, "pointers" => pointers.pointers().count());

    let merges = split_merge_blocks(f);
    let summary = summarize(f, &merges, Some(&pointers));
    let liveness = Liveness::compute(&summary);
    if config.trace_live_sets {
        for &b in &summary.order {
            trace!(
                "Live set";
                "block" => f.block_name(b),
                "in" => ?liveness
                    .live_in(b)
                    .records()
                    .iter()
                    .map(|u| f.value_name(u.value))
                    .collect::<Vec<_>>(),
            );
        }
    }

    let sites = select(&liveness);
    info!("Selected checkpoint sites"; "function" => &f.name, "count" => sites.len());

    let reports = transform(f, &pointers, &sites, config.keep_redundant_repair_merges)?;

    f.validate().map_err(AnalysisError::Malformed)?;
    f.verify_ssa().map_err(AnalysisError::Malformed)?;

    Ok(InstrumentationReport {
        function: f.name.clone(),
        sites: reports,
    })
}

/// Instrument the entry function `entry` of `program`. Other functions are left alone.
pub fn instrument_program(
    program: &mut Program,
    entry: &str,
    config: &InstrumentConfig,
) -> Result<InstrumentationReport, AnalysisError> {
    let f = program
        .function_mut(entry)
        .ok_or_else(|| AnalysisError::UnknownFunction(entry.to_string()))?;
    instrument_function(f, config)
}
