use crate::clock::ManualClock;
use crate::il::{Function, InstKind, Operand};
use crate::instrument::instrument_function;
use crate::instrument_config::InstrumentConfig;
use crate::interp::{ExecConfig, Interpreter, Outcome, Pointer};
use crate::runtime::{CheckpointRuntime, RuntimeConfig};
use crate::storage::{CheckpointStorage, MemStorage};
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
fn assert_unorderedset_eq<T: Eq + std::hash::Hash + Ord + std::fmt::Debug>(
    a: impl IntoIterator<Item = T>,
    b: impl IntoIterator<Item = T>,
) {
    use crate::containers::unordered::UnorderedSet;
    let a: UnorderedSet<_> = a.into_iter().collect();
    let b: UnorderedSet<_> = b.into_iter().collect();
    assert_eq!(a, b)
}

pub fn loop_array() -> Function {
    crate::parser::parse_function(include_str!("../tests/loop-array.il")).unwrap()
}

pub fn swap_pointers() -> Function {
    crate::parser::parse_function(include_str!("../tests/swap-pointers.il")).unwrap()
}

pub fn heap_sum() -> Function {
    crate::parser::parse_function(include_str!("../tests/heap-sum.il")).unwrap()
}

pub fn straight_line() -> Function {
    crate::parser::parse_function(include_str!("../tests/straight-line.il")).unwrap()
}

pub fn merged_addresses() -> Function {
    crate::parser::parse_function(include_str!("../tests/merged-addresses.il")).unwrap()
}

pub fn all_programs() -> Vec<(&'static str, Function)> {
    vec![
        ("loop_array", loop_array()),
        ("swap_pointers", swap_pointers()),
        ("heap_sum", heap_sum()),
        ("straight_line", straight_line()),
        ("merged_addresses", merged_addresses()),
    ]
}

pub fn instrumented(mut f: Function) -> Function {
    instrument_function(&mut f, &Default::default()).unwrap();
    f
}

/// Checkpoint after every opportunity
fn eager_config() -> RuntimeConfig {
    RuntimeConfig {
        interval: Duration::ZERO,
        ..Default::default()
    }
}

/// One execution of `f` against `storage`, as a process started at `epoch` would do it
fn execute(
    f: &Function,
    args: &[String],
    storage: MemStorage,
    epoch: u64,
    halt_after_checkpoints: Option<u64>,
) -> (Outcome, Vec<String>, CheckpointRuntime<Pointer, MemStorage, ManualClock>) {
    let rt = CheckpointRuntime::new(eager_config(), storage, ManualClock::new(epoch));
    let mut interp = Interpreter::new(
        rt,
        ExecConfig {
            halt_after_checkpoints,
            ..Default::default()
        },
    );
    let outcome = interp.run_main(f, args).unwrap();
    let output = interp.output().to_vec();
    (outcome, output, interp.into_runtime())
}

fn reference_output(f: &Function, args: &[String]) -> Vec<String> {
    let (outcome, output, _) = execute(f, args, MemStorage::new(), 1, None);
    assert!(matches!(outcome, Outcome::Returned(_)));
    output
}

/// Kill an instrumented run after `halt` checkpoints, restart it, and check that the two runs
/// together print what an uninterrupted run prints
fn check_interrupted_run(original: Function, args: &[String], halt: u64) -> MemStorage {
    let expected = reference_output(&original, args);
    let f = instrumented(original);

    let (outcome, mut output, rt) = execute(&f, args, MemStorage::new(), 1000, Some(halt));
    assert_eq!(outcome, Outcome::Halted { checkpoints: halt });

    let (outcome, rest, rt) = execute(&f, args, rt.into_storage(), 2000, None);
    assert!(matches!(outcome, Outcome::Returned(_)));
    assert!(rt.stats().restored > 0);
    output.extend(rest);

    dbg!(&output);
    assert_eq!(output, expected);
    rt.into_storage()
}

#[test]
fn parse_print_round_trip() {
    for (name, f) in all_programs() {
        let text = f.to_string();
        let reparsed = crate::parser::parse_function(&text).unwrap();
        assert_eq!(reparsed.to_string(), text, "{}", name);

        let inst = instrumented(f);
        let text = inst.to_string();
        let reparsed = crate::parser::parse_function(&text).unwrap();
        assert_eq!(reparsed.to_string(), text, "{}", name);
        assert_eq!(reparsed.is_instrumented(), name != "straight_line", "{}", name);
    }
}

#[test]
fn liveness_reaches_fixpoint() {
    use crate::alias::ProvenanceOracle;
    use crate::cfg::{split_merge_blocks, summarize};
    use crate::liveness::Liveness;
    use crate::pointer_analysis::PointerAnalysis;

    for (name, mut f) in all_programs() {
        let oracle = ProvenanceOracle::new(&f);
        let pointers = PointerAnalysis::analyze(&mut f, &oracle).unwrap();
        let merges = split_merge_blocks(&mut f);
        let summary = summarize(&f, &merges, Some(&pointers));
        let mut liveness = Liveness::compute(&summary);
        assert!(!liveness.recompute(), "{}", name);
    }
}

#[test]
fn loop_header_split_is_the_site() {
    let report = instrument_function(&mut loop_array(), &Default::default()).unwrap();
    dbg!(&report);
    assert_eq!(report.sites.len(), 1);
    let site = &report.sites[0];
    assert_eq!(site.label, 0);
    assert_eq!(site.block, "loop.split");
    assert_eq!(site.checkpoint_block, "checkpoint.0");
    assert_eq!(site.restart_block, "restart.0");
    assert_unorderedset_eq(site.live.iter().map(|s| s.as_str()), ["p", "x", "i"]);
    assert_eq!(site.entries, 3);
}

#[test]
fn selected_sites_are_admissible() {
    use crate::alias::ProvenanceOracle;
    use crate::cfg::{split_merge_blocks, summarize};
    use crate::liveness::Liveness;
    use crate::pointer_analysis::PointerAnalysis;
    use crate::selector::{is_admissible, select};

    for (name, mut f) in all_programs() {
        let oracle = ProvenanceOracle::new(&f);
        let pointers = PointerAnalysis::analyze(&mut f, &oracle).unwrap();
        let merges = split_merge_blocks(&mut f);
        let summary = summarize(&f, &merges, Some(&pointers));
        let liveness = Liveness::compute(&summary);
        let sites = select(&liveness);
        for (i, site) in sites.iter().enumerate() {
            assert_eq!(site.label, i as u64, "{}", name);
            assert!(is_admissible(&summary, &liveness, site.block), "{}", name);
            let node = summary.node(site.block);
            assert!(!merges.contains(&site.block));
            assert!(merges.contains(&node.predecessors[0]));
        }
        let expected = match name {
            "straight_line" => 0,
            "heap_sum" | "merged_addresses" => 2,
            _ => 1,
        };
        assert_eq!(sites.len(), expected, "{}", name);
    }
}

#[test]
fn no_site_leaves_function_unchanged() {
    let mut f = straight_line();
    let before = f.to_string();
    let report = instrument_function(&mut f, &Default::default()).unwrap();
    assert!(report.sites.is_empty());
    assert_eq!(f.to_string(), before);
    assert!(!f.is_instrumented());
}

#[test]
fn instrumented_functions_are_valid_ssa() {
    let configs = [
        InstrumentConfig::default(),
        InstrumentConfig {
            use_conservative_alias_oracle: true,
            ..Default::default()
        },
        InstrumentConfig {
            keep_redundant_repair_merges: true,
            ..Default::default()
        },
    ];
    for config in &configs {
        for (name, mut f) in all_programs() {
            instrument_function(&mut f, config).unwrap();
            f.validate().unwrap();
            f.verify_ssa().unwrap();
            if name != "straight_line" {
                assert!(f.is_instrumented(), "{}", name);
            }
        }
    }
}

#[test]
fn no_trivial_repair_merges_remain() {
    use crate::containers::unordered::UnorderedSet;

    for (name, f) in all_programs() {
        let f = instrumented(f);
        for (b, inst) in f.instructions() {
            if let (Some(r), InstKind::Phi { incoming }) = (inst.result, &inst.kind) {
                if f.value_name(r).contains(".cr") {
                    let distinct: UnorderedSet<&Operand> = incoming
                        .iter()
                        .map(|(op, _)| op)
                        .filter(|op| **op != Operand::Value(r))
                        .collect();
                    assert!(
                        distinct.len() > 1,
                        "{}: single-incoming merge `%{}` left in `{}`",
                        name,
                        f.value_name(r),
                        f.block_name(b)
                    );
                }
            }
        }
    }
}

#[test]
fn insertion_ordered_set_needs_no_default_members() {
    use crate::containers::InsertionOrderedSet;

    #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
    struct Label(&'static str);

    let mut set: InsertionOrderedSet<Label> = Default::default();
    assert_eq!(set.insert(Label("z")), 0);
    assert_eq!(set.insert(Label("a")), 1);
    assert_eq!(set.insert(Label("z")), 0);
    assert_eq!(set.get_index(&Label("a")), Some(1));
    assert_eq!(set.into_vec(), vec![Label("z"), Label("a")]);
}

#[test]
fn selector_rejects_inadmissible_blocks() {
    use crate::alias::ProvenanceOracle;
    use crate::cfg::{split_merge_blocks, summarize};
    use crate::liveness::Liveness;
    use crate::pointer_analysis::PointerAnalysis;
    use crate::selector::{is_admissible, select};

    // `join` has two predecessors; `tail.split` follows a merge but ends the function
    let two_preds_and_exit = r#"
fn main(%argc: i32, %argv: ptr<ptr<i8>>) -> i32 {
entry:
  %x = add %argc, i32 1
  %one = cmp eq %argc, i32 1
  condbr %one, a, b
a:
  br join
b:
  br join
join:
  call @print(%x)
  condbr %one, c, d
c:
  br tail
d:
  br tail
tail:
  %r = phi i32 [%x, c], [i32 0, d]
  call @print(%r)
  ret %r
}
"#;
    // `join.split` follows a merge but nothing is live on entry to it
    let nothing_live = r#"
fn main() -> i32 {
entry:
  %k = add i32 1, i32 2
  %big = cmp gt %k, i32 2
  condbr %big, a, b
a:
  br join
b:
  br join
join:
  %z = phi i32 [i32 1, a], [i32 2, b]
  br done
done:
  ret i32 0
}
"#;
    let cases = [
        (two_preds_and_exit, vec!["join", "tail.split"]),
        (nothing_live, vec!["join.split"]),
    ];
    for (text, rejected) in cases {
        let mut f = crate::parser::parse_function(text).unwrap();
        let oracle = ProvenanceOracle::new(&f);
        let pointers = PointerAnalysis::analyze(&mut f, &oracle).unwrap();
        let merges = split_merge_blocks(&mut f);
        let summary = summarize(&f, &merges, Some(&pointers));
        let liveness = Liveness::compute(&summary);
        for name in rejected {
            let b = f.block_by_name(name).unwrap();
            let node = summary.node(b);
            assert!(!node.is_merge, "{}", name);
            match name {
                "join" => assert_eq!(node.predecessors.len(), 2),
                "tail.split" => assert!(node.successors.is_empty()),
                _ => assert!(liveness.live_in(b).is_empty()),
            }
            assert!(!is_admissible(&summary, &liveness, b), "{}", name);
        }
        assert!(select(&liveness).is_empty());
    }
}

#[test]
fn live_pointer_loaded_from_memory_is_rejected() {
    use crate::error::AnalysisError;

    let mut f = crate::parser::parse_function(
        r#"
fn main() -> i32 {
entry:
  %arr = alloca f64, 3
  store f64 1.0, %arr
  %pp = alloca ptr<f64>, 1
  store %arr, %pp
  %q = load %pp
  br loop
loop:
  %i = phi i32 [i32 0, entry], [%next, body]
  %done = cmp ge %i, i32 3
  condbr %done, exit, body
body:
  %v = load %q
  call @print(%i, %v)
  %next = add %i, i32 1
  br loop
exit:
  ret i32 0
}
"#,
    )
    .unwrap();
    match instrument_function(&mut f, &Default::default()) {
        Err(AnalysisError::UnsupportedLiveValue { value, .. }) => assert_eq!(value, "q"),
        other => panic!("expected the loaded pointer to be rejected, got {:?}", other),
    }
}

#[test]
fn merged_element_addresses_restore_through_aliases() {
    let f = instrumented(merged_addresses());
    // each checkpoint names the merged pointer through an empty entry at one of its members
    let text = f.to_string();
    assert!(text.contains("p1.at_checkpoint"));
    assert!(text.contains("p2.restored"));

    for args in [vec![], vec!["x".to_string()]] {
        for halt in 1..=4 {
            let storage = check_interrupted_run(merged_addresses(), &args, halt);
            assert!(storage
                .files()
                .any(|(_, contents)| contents.starts_with(b"alias0\n8\n0\n\n\n")));
            assert!(storage
                .files()
                .any(|(_, contents)| contents.starts_with(b"alias1\n")));
        }
    }
}

#[test]
fn instrumenting_twice_is_rejected() {
    let mut f = instrumented(loop_array());
    assert!(matches!(
        instrument_function(&mut f, &Default::default()),
        Err(crate::error::AnalysisError::AlreadyInstrumented(_))
    ));
}

#[test]
fn entry_dispatches_on_restart_label() {
    let f = instrumented(loop_array());
    let entry = f.block(f.entry());
    assert_eq!(entry.name, "entry");
    assert!(f.block_by_name("entry.no_cr").is_some());
    match &entry.terminator().unwrap().kind {
        InstKind::Switch { default, cases, .. } => {
            assert_eq!(f.block_name(*default), "entry.no_cr");
            let cases: Vec<_> = cases.iter().map(|(k, b)| (*k, f.block_name(*b))).collect();
            assert_eq!(cases, vec![(0, "restart.0")]);
        }
        other => panic!("entry ends with {:?}", other),
    }
}

#[test]
fn argv_is_an_external_parameter() {
    use crate::alias::MayAliasAll;
    use crate::pointer_analysis::{PointerAnalysis, Provenance};

    let mut f = heap_sum();
    let pointers = PointerAnalysis::analyze(&mut f, &MayAliasAll).unwrap();
    let argv = f.value_by_name("argv").unwrap();
    let info = pointers.info(argv).unwrap();
    assert_eq!(info.provenance, Provenance::ExternalParameter);
    assert_eq!(info.bit_width, Operand::i64(64));
    assert_eq!(info.count, Operand::Value(f.value_by_name("argc.wide").unwrap()));

    let buf = f.value_by_name("buf").unwrap();
    let info = pointers.info(buf).unwrap();
    assert_eq!(info.provenance, Provenance::Allocation);
    assert_eq!(info.bit_width, Operand::i64(8));
    assert_eq!(info.count, Operand::Value(f.value_by_name("wide").unwrap()));

    let at = f.value_by_name("at").unwrap();
    assert_eq!(
        pointers.info(at).unwrap().provenance,
        Provenance::Derived { source: buf }
    );
}

#[test]
fn merged_pointer_alias_sets_are_closed() {
    use crate::alias::{AliasOracle, AliasResult, ProvenanceOracle};
    use crate::pointer_analysis::{PointerAnalysis, Provenance};

    let mut f = swap_pointers();
    let oracle = ProvenanceOracle::new(&f);
    let pointers = PointerAnalysis::analyze(&mut f, &oracle).unwrap();
    let a = f.value_by_name("a").unwrap();
    let b = f.value_by_name("b").unwrap();

    for name in ["cur", "other"] {
        let v = f.value_by_name(name).unwrap();
        let info = pointers.info(v).unwrap();
        assert_eq!(info.provenance, Provenance::Merge);
        assert_unorderedset_eq(info.aliases.iter().cloned(), [a, b]);
        // nothing the pointer may be derived from is missing
        for root in oracle.roots_of(v).unwrap().iter() {
            assert!(info.aliases.contains(root));
            assert_eq!(oracle.alias(v, *root), AliasResult::MayAlias);
        }
    }
    assert_eq!(oracle.alias(a, b), AliasResult::NoAlias);
}

#[test]
fn checkpoint_halt_restart_round_trip() {
    let storage = check_interrupted_run(loop_array(), &[], 2);
    // the restart resumed from the second checkpoint of the first run
    assert!(storage
        .files()
        .any(|(p, _)| p == Path::new(".autocr_chkpnt-1000/1/info")));
}

#[test]
fn restored_values_match_checkpointed_values() {
    let f = instrumented(loop_array());
    let (_, output, rt) = execute(&f, &[], MemStorage::new(), 1000, Some(1));
    assert!(output.is_empty());

    let storage = rt.into_storage();
    let info = storage
        .read_file(Path::new(".autocr_chkpnt-1000/0/info"))
        .unwrap();
    assert_eq!(info, b"0\n3\n");

    let (outcome, output, rt) = execute(&f, &[], storage, 2000, None);
    assert_eq!(outcome, Outcome::Returned(Some(crate::interp::Val::int(32, 5))));
    assert_eq!(output, vec!["5 0 1", "5 1 2", "5 2 3", "5"]);
    assert_eq!(rt.stats().restored, 3);
}

#[test]
fn merged_pointers_restore_through_aliases() {
    for halt in 1..=4 {
        let storage = check_interrupted_run(swap_pointers(), &[], halt);
        assert!(storage
            .files()
            .any(|(_, contents)| contents.starts_with(b"alias1\n")));
    }
}

#[test]
fn heap_buffer_round_trip() {
    let args = vec!["x".to_string()];
    assert_eq!(reference_output(&heap_sum(), &args), vec!["28"]);
    for halt in [1, 3, 9, 12, 18] {
        check_interrupted_run(heap_sum(), &args, halt);
    }
}

#[test]
fn argv_without_arguments() {
    assert_eq!(reference_output(&heap_sum(), &[]), vec!["6"]);
    assert_eq!(reference_output(&instrumented(heap_sum()), &[]), vec!["6"]);
}

#[test]
fn truncated_entry_falls_back_to_older_checkpoint() {
    let f = instrumented(loop_array());
    let (_, _, rt) = execute(&f, &[], MemStorage::new(), 1000, Some(2));
    let mut storage = rt.into_storage();

    let newest = Path::new(".autocr_chkpnt-1000/1/2");
    let mut contents = storage.read_file(newest).unwrap();
    contents.pop();
    storage.write_file(newest, &contents).unwrap();

    let mut probe: CheckpointRuntime<Pointer, _, _> =
        CheckpointRuntime::new(eager_config(), storage.clone(), ManualClock::new(2000));
    assert_eq!(probe.restart_get_label(), Some(0));
    assert_eq!(
        probe.restart_checkpoint(),
        Some(Path::new(".autocr_chkpnt-1000/0"))
    );

    // resumes before the first iteration, so the whole output is printed again
    let (_, output, _) = execute(&f, &[], storage, 2000, None);
    assert_eq!(output, vec!["5 0 1", "5 1 2", "5 2 3", "5"]);
}

#[test]
fn no_valid_checkpoint_starts_over() {
    let f = instrumented(loop_array());
    let (_, _, rt) = execute(&f, &[], MemStorage::new(), 1000, Some(2));
    let mut storage = rt.into_storage();
    for dir in ["0", "1"] {
        let path = Path::new(".autocr_chkpnt-1000").join(dir).join("0");
        storage.remove_file(&path).unwrap();
    }

    let (outcome, output, rt) = execute(&f, &[], storage, 2000, None);
    assert!(matches!(outcome, Outcome::Returned(_)));
    assert_eq!(output, reference_output(&loop_array(), &[]));
    assert_eq!(rt.stats().restored, 0);
}

#[test]
fn interval_gates_checkpoints() {
    let config = RuntimeConfig {
        interval: Duration::from_secs(10),
        ..Default::default()
    };
    let mut rt: CheckpointRuntime<u32, _, _> =
        CheckpointRuntime::new(config, MemStorage::new(), ManualClock::new(7));
    rt.setup();
    assert!(rt.is_enabled());
    assert_eq!(rt.base_dir(), Some(Path::new(".autocr_chkpnt-7")));

    rt.start(0, 1);
    rt.checkpoint_pointer(32, 1, &[1, 0, 0, 0]);
    assert!(!rt.finish());

    rt.clock().advance(Duration::from_secs(10));
    rt.start(0, 1);
    rt.checkpoint_pointer(32, 1, &[2, 0, 0, 0]);
    assert!(rt.finish());

    // the timer restarted at the performed checkpoint
    rt.clock().advance(Duration::from_secs(9));
    rt.start(0, 1);
    assert!(!rt.finish());

    let stats = rt.stats();
    assert_eq!((stats.performed, stats.skipped), (1, 2));
    let storage = rt.into_storage();
    assert!(!storage.exists(Path::new(".autocr_chkpnt-7/0")));
    assert_eq!(
        storage.read_file(Path::new(".autocr_chkpnt-7/1/0")).unwrap(),
        b"alias0\n32\n1\n\n\x02\0\0\0\n"
    );
    assert!(!storage.exists(Path::new(".autocr_chkpnt-7/2")));
}

#[test]
fn skipped_attempt_keeps_the_timer_running() {
    use crate::runtime::AliasCandidate;

    let config = RuntimeConfig {
        interval: Duration::from_secs(10),
        ..Default::default()
    };
    let mut rt: CheckpointRuntime<u32, _, _> =
        CheckpointRuntime::new(config, MemStorage::new(), ManualClock::new(7));
    rt.setup();
    rt.clock().advance(Duration::from_secs(10));

    // past the interval, but the attempt is abandoned on an alias miss
    rt.start(0, 1);
    rt.checkpoint_alias(
        32,
        1,
        99,
        &[AliasCandidate {
            bit_width: 32,
            count: 1,
            index: 0,
            address: 7,
        }],
    );
    assert!(!rt.finish());

    // still due at the same instant
    rt.start(0, 1);
    rt.checkpoint_pointer(32, 1, &[3, 0, 0, 0]);
    assert!(rt.finish());

    // and not due again until a full interval after the written one
    rt.start(0, 1);
    assert!(!rt.finish());

    let stats = rt.stats();
    assert_eq!((stats.performed, stats.skipped), (1, 2));
    assert_eq!(
        rt.into_storage()
            .read_file(Path::new(".autocr_chkpnt-7/1/0"))
            .unwrap(),
        b"alias0\n32\n1\n\n\x03\0\0\0\n"
    );
}

#[test]
fn unreadable_clock_disables_checkpointing() {
    let mut rt: CheckpointRuntime<u32, _, _> =
        CheckpointRuntime::new(eager_config(), MemStorage::new(), ManualClock::new(7));
    rt.clock().break_clock();
    rt.setup();
    assert!(!rt.is_enabled());
    rt.start(0, 1);
    rt.checkpoint_pointer(8, 1, &[1]);
    assert!(!rt.finish());
    assert_eq!(rt.into_storage().files().count(), 0);
}

#[test]
fn existing_run_directory_disables_checkpointing() {
    let mut storage = MemStorage::new();
    storage
        .create_dir(Path::new(".autocr_chkpnt-7"))
        .unwrap();
    let mut rt: CheckpointRuntime<u32, _, _> =
        CheckpointRuntime::new(eager_config(), storage, ManualClock::new(7));
    rt.setup();
    assert!(!rt.is_enabled());
    rt.start(0, 1);
    assert!(!rt.finish());
}

#[test]
fn alias_miss_skips_attempt() {
    use crate::runtime::AliasCandidate;

    let mut rt: CheckpointRuntime<u32, _, _> =
        CheckpointRuntime::new(eager_config(), MemStorage::new(), ManualClock::new(7));
    rt.setup();
    rt.start(3, 2);
    rt.checkpoint_pointer(32, 1, &[5, 0, 0, 0]);
    rt.checkpoint_alias(
        32,
        1,
        99,
        &[AliasCandidate {
            bit_width: 32,
            count: 1,
            index: 0,
            address: 7,
        }],
    );
    assert!(!rt.finish());

    let dir = Path::new(".autocr_chkpnt-7/0");
    assert!(matches!(
        crate::protocol::validate_checkpoint(rt.storage(), dir),
        Err(crate::error::FormatError::MissingFile(_))
    ));
    let mut restart: CheckpointRuntime<u32, _, _> =
        CheckpointRuntime::new(eager_config(), rt.into_storage(), ManualClock::new(8));
    assert_eq!(restart.restart_get_label(), None);
}

#[test]
fn restart_checks_entry_shape() {
    use crate::error::RestoreError;
    use crate::runtime::AliasCandidate;

    let mut rt: CheckpointRuntime<u32, _, _> =
        CheckpointRuntime::new(eager_config(), MemStorage::new(), ManualClock::new(7));
    rt.setup();
    rt.start(1, 2);
    rt.checkpoint_pointer(32, 1, &[5, 0, 0, 0]);
    rt.checkpoint_alias(
        32,
        1,
        40,
        &[AliasCandidate {
            bit_width: 32,
            count: 1,
            index: 0,
            address: 40,
        }],
    );
    assert!(rt.finish());
    let storage = rt.into_storage();

    let mut restart: CheckpointRuntime<u32, _, _> =
        CheckpointRuntime::new(eager_config(), storage.clone(), ManualClock::new(8));
    assert_eq!(restart.restart_get_label(), Some(1));
    let mut dest = [0u8; 8];
    assert!(matches!(
        restart.restart_read_pointer(64, 1, 100, &mut dest),
        Err(RestoreError::ShapeMismatch { index: 0, .. })
    ));

    let mut restart: CheckpointRuntime<u32, _, _> =
        CheckpointRuntime::new(eager_config(), storage.clone(), ManualClock::new(8));
    assert_eq!(restart.restart_get_label(), Some(1));
    assert!(matches!(
        restart.restart_read_alias(32, 1),
        Err(RestoreError::UnexpectedKind { index: 0, .. })
    ));

    let mut restart: CheckpointRuntime<u32, _, _> =
        CheckpointRuntime::new(eager_config(), storage, ManualClock::new(8));
    assert_eq!(restart.restart_get_label(), Some(1));
    restart.restart_read_pointer(32, 1, 100, &mut dest).unwrap();
    assert_eq!(dest[..4], [5, 0, 0, 0]);
    assert_eq!(restart.restart_read_alias(32, 1).unwrap(), 100);
    restart.restart_finish();
    assert_eq!(restart.restart_checkpoint(), None);
    assert_eq!(restart.stats().restored, 2);
}

#[test]
fn partial_bytes_keep_their_high_bits() {
    let mut rt: CheckpointRuntime<u32, _, _> =
        CheckpointRuntime::new(eager_config(), MemStorage::new(), ManualClock::new(7));
    rt.setup();
    rt.start(0, 1);
    // 5 elements of 3 bits: 15 bits, so the top bit of the second byte is not ours
    rt.checkpoint_pointer(3, 5, &[0b1010_1010, 0b0101_0101]);
    assert!(rt.finish());

    let mut restart: CheckpointRuntime<u32, _, _> =
        CheckpointRuntime::new(eager_config(), rt.into_storage(), ManualClock::new(8));
    assert_eq!(restart.restart_get_label(), Some(0));
    let mut dest = [0xFF, 0xFF];
    restart.restart_read_pointer(3, 5, 1, &mut dest).unwrap();
    assert_eq!(dest, [0b1010_1010, 0b1101_0101]);
}

#[test]
fn interval_override() {
    let default = RuntimeConfig::default();
    assert_eq!(default.interval, Duration::from_secs(100));
    assert_eq!(
        default.clone().with_interval_override(Some("0.5")).interval,
        Duration::from_millis(500)
    );
    assert_eq!(
        default.clone().with_interval_override(Some(" 3 ")).interval,
        Duration::from_secs(3)
    );
    for bad in ["", "soon", "-1", "inf", "NaN"] {
        assert_eq!(
            default.clone().with_interval_override(Some(bad)),
            default,
            "{:?}",
            bad
        );
    }
    assert_eq!(default.clone().with_interval_override(None), default);
}

#[test]
fn checkpoints_on_the_filesystem() {
    use crate::storage::FsStorage;

    let dir = tempfile::tempdir().unwrap();
    let expected = reference_output(&loop_array(), &[]);
    let f = instrumented(loop_array());

    let run = |halt: Option<u64>| {
        let rt = CheckpointRuntime::new(
            eager_config(),
            FsStorage::new(dir.path()),
            ManualClock::new(if halt.is_some() { 1000 } else { 2000 }),
        );
        let mut interp = Interpreter::new(
            rt,
            ExecConfig {
                halt_after_checkpoints: halt,
                ..Default::default()
            },
        );
        let outcome = interp.run_main(&f, &[]).unwrap();
        (outcome, interp.output().to_vec())
    };

    let (outcome, mut output) = run(Some(2));
    assert_eq!(outcome, Outcome::Halted { checkpoints: 2 });
    assert!(dir.path().join(".autocr_chkpnt-1000/1/info").is_file());
    assert_eq!(
        std::fs::read(dir.path().join(".autocr_chkpnt-1000/1/info")).unwrap(),
        b"0\n3\n"
    );

    let (outcome, rest) = run(None);
    assert!(matches!(outcome, Outcome::Returned(_)));
    output.extend(rest);
    assert_eq!(output, expected);
}
