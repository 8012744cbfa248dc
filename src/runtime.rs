//! The checkpoint/restart runtime that instrumented code calls into.
//!
//! All state lives in a [`CheckpointRuntime`] owned by whoever executes the instrumented
//! function. It is not synchronized; one runtime serves one single-threaded execution.
//!
//! Failures on the checkpoint side never surface as errors. A setup failure disables
//! checkpointing for the rest of the run, and a failure inside an attempt only skips that
//! attempt. Failures on the restart side after a checkpoint was selected are fatal.

use crate::clock::Clock;
use crate::error::{FormatError, RestoreError};
use crate::log::*;
use crate::protocol::{
    candidate_checkpoints, entry_path, info_path, restore_payload, run_dir_name,
    validate_checkpoint, EntryBody, InfoRecord, VariableEntry, RUN_DIR_PREFIX,
};
use crate::storage::CheckpointStorage;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    /// Minimum time between two performed checkpoints
    pub interval: Duration,
    /// Prefix of run directory names
    pub prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(100),
            prefix: RUN_DIR_PREFIX.to_string(),
        }
    }
}

impl RuntimeConfig {
    pub const INTERVAL_VAR: &'static str = "AUTOCR_CHECKPOINT_INTERVAL";

    /// The default configuration, with the interval taken from the environment if set
    pub fn from_env() -> Self {
        Self::default().with_interval_override(std::env::var(Self::INTERVAL_VAR).ok().as_deref())
    }

    /// Apply an interval override given in (possibly fractional) seconds. Values that do not
    /// parse as a finite, non-negative number are logged and ignored.
    pub fn with_interval_override(mut self, value: Option<&str>) -> Self {
        if let Some(value) = value {
            match value.trim().parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs >= 0.0 => {
                    self.interval = Duration::from_secs_f64(secs);
                }
                _ => {
                    warn!("Ignoring invalid checkpoint interval"; "value" => value);
                }
            }
        }
        self
    }
}

/// One candidate of an alias checkpoint: the metadata and address of a pointer written earlier
/// in the same checkpoint at position `index`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AliasCandidate<A> {
    pub bit_width: u64,
    pub count: u64,
    pub index: u64,
    pub address: A,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Attempts that wrote a complete checkpoint
    pub performed: u64,
    /// Attempts skipped, either by the interval gate or by a failure
    pub skipped: u64,
    /// Entries read back during restart
    pub restored: u64,
}

#[derive(Debug)]
struct Attempt {
    dir: PathBuf,
    next_index: u64,
    skip: bool,
}

#[derive(Debug)]
struct RestartState<A> {
    dir: PathBuf,
    next_index: u64,
    addresses: Vec<Option<A>>,
}

pub struct CheckpointRuntime<A, S, C> {
    config: RuntimeConfig,
    storage: S,
    clock: C,
    enabled: bool,
    base_dir: Option<PathBuf>,
    ordinal: u64,
    last_checkpoint: Duration,
    attempt: Option<Attempt>,
    restart: Option<RestartState<A>>,
    stats: RuntimeStats,
}

impl<A: Copy + PartialEq + std::fmt::Debug, S: CheckpointStorage, C: Clock>
    CheckpointRuntime<A, S, C>
{
    pub fn new(config: RuntimeConfig, storage: S, clock: C) -> Self {
        Self {
            config,
            storage,
            clock,
            enabled: false,
            base_dir: None,
            ordinal: 0,
            last_checkpoint: Duration::ZERO,
            attempt: None,
            restart: None,
            stats: Default::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    pub fn stats(&self) -> RuntimeStats {
        self.stats
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Create the run directory and start the interval timer
    pub fn setup(&mut self) {
        let (epoch, now) = match (self.clock.epoch_micros(), self.clock.monotonic()) {
            (Some(e), Some(n)) => (e, n),
            _ => {
                warn!("Could not read the clock; checkpointing disabled");
                self.enabled = false;
                return;
            }
        };
        let base = PathBuf::from(run_dir_name(&self.config.prefix, epoch));
        if let Err(e) = self.storage.create_dir(&base) {
            warn!(
                "Could not create run directory; checkpointing disabled";
                "dir" => %base.display(),
                "error" => %e,
            );
            self.enabled = false;
            return;
        }
        info!("Checkpointing enabled"; "dir" => %base.display(), "interval" => ?self.config.interval);
        self.base_dir = Some(base);
        self.ordinal = 0;
        self.last_checkpoint = now;
        self.enabled = true;
    }

    /// Begin a checkpoint attempt for `label`, announcing `var_count` entries
    pub fn start(&mut self, label: u64, var_count: u64) {
        if !self.enabled {
            return;
        }
        let base = match &self.base_dir {
            Some(b) => b.clone(),
            None => return,
        };
        let dir = base.join(self.ordinal.to_string());
        let now = match self.clock.monotonic() {
            Some(n) => n,
            None => {
                warn!("Could not read the clock; checkpointing disabled");
                self.enabled = false;
                return;
            }
        };
        if now.saturating_sub(self.last_checkpoint) < self.config.interval {
            trace!("Checkpoint skipped, interval not elapsed"; "label" => label);
            self.attempt = Some(Attempt {
                dir,
                next_index: 0,
                skip: true,
            });
            return;
        }

        let info = InfoRecord { label, var_count };
        let result = self
            .storage
            .create_dir(&dir)
            .and_then(|()| self.storage.write_file(&info_path(&dir), &info.encode()));
        let skip = match result {
            Ok(()) => false,
            Err(e) => {
                warn!(
                    "Could not start checkpoint; skipping attempt";
                    "dir" => %dir.display(),
                    "error" => %e,
                );
                true
            }
        };
        debug!("Checkpoint started"; "label" => label, "vars" => var_count, "dir" => %dir.display());
        self.attempt = Some(Attempt {
            dir,
            next_index: 0,
            skip,
        });
    }

    fn active_attempt(&mut self) -> Option<&mut Attempt> {
        if !self.enabled {
            return None;
        }
        self.attempt.as_mut().filter(|a| !a.skip)
    }

    fn write_entry(&mut self, entry: Result<VariableEntry, FormatError>) {
        let attempt = match self.active_attempt() {
            Some(a) => a,
            None => return,
        };
        let path = entry_path(&attempt.dir, attempt.next_index);
        let written = entry.map_err(|e| e.to_string()).and_then(|entry| {
            self.storage
                .write_file(&path, &entry.encode())
                .map_err(|e| e.to_string())
        });
        // Re-borrow after the storage access
        let attempt = match self.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        match written {
            Ok(()) => attempt.next_index += 1,
            Err(e) => {
                warn!(
                    "Could not write checkpoint entry; skipping attempt";
                    "path" => %path.display(),
                    "error" => e,
                );
                attempt.skip = true;
            }
        }
    }

    /// Write `count` elements of `bit_width` bits taken from the start of `memory`
    pub fn checkpoint_pointer(&mut self, bit_width: u64, count: u64, memory: &[u8]) {
        if self.active_attempt().is_none() {
            return;
        }
        self.write_entry(VariableEntry::data(bit_width, count, memory));
    }

    /// Write an entry recording that `address` equals one of the `candidates`. If none matches,
    /// the attempt is skipped.
    pub fn checkpoint_alias(
        &mut self,
        bit_width: u64,
        count: u64,
        address: A,
        candidates: &[AliasCandidate<A>],
    ) {
        let attempt = match self.active_attempt() {
            Some(a) => a,
            None => return,
        };
        match candidates.iter().find(|c| c.address == address) {
            Some(c) => {
                let index = c.index;
                self.write_entry(Ok(VariableEntry::alias(bit_width, count, index)));
            }
            None => {
                warn!(
                    "Alias target not among candidates; skipping attempt";
                    "address" => ?address,
                    "candidates" => candidates.len(),
                );
                attempt.skip = true;
            }
        }
    }

    /// End the current attempt. Returns whether a complete checkpoint was written; only then
    /// does the interval timer restart.
    pub fn finish(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        let attempt = match self.attempt.take() {
            Some(a) => a,
            None => return false,
        };
        self.ordinal += 1;
        if attempt.skip {
            self.stats.skipped += 1;
            false
        } else {
            info!(
                "Checkpoint written";
                "dir" => %attempt.dir.display(),
                "entries" => attempt.next_index,
            );
            self.stats.performed += 1;
            match self.clock.monotonic() {
                Some(now) => self.last_checkpoint = now,
                None => {
                    warn!("Could not read the clock; checkpointing disabled");
                    self.enabled = false;
                }
            }
            true
        }
    }

    /// Find the newest fully valid checkpoint and prepare to restore it. Returns its label.
    pub fn restart_get_label(&mut self) -> Option<u64> {
        for dir in candidate_checkpoints(&self.storage, &self.config.prefix) {
            match validate_checkpoint(&self.storage, &dir) {
                Ok(info) => {
                    info!(
                        "Restarting from checkpoint";
                        "dir" => %dir.display(),
                        "label" => info.label,
                    );
                    self.restart = Some(RestartState {
                        dir,
                        next_index: 0,
                        addresses: vec![],
                    });
                    return Some(info.label);
                }
                Err(e) => {
                    info!(
                        "Ignoring invalid checkpoint";
                        "dir" => %dir.display(),
                        "error" => %e,
                    );
                }
            }
        }
        debug!("No valid checkpoint found");
        None
    }

    /// The checkpoint being restored, between [`Self::restart_get_label`] and
    /// [`Self::restart_finish`]
    pub fn restart_checkpoint(&self) -> Option<&Path> {
        self.restart.as_ref().map(|s| s.dir.as_path())
    }

    fn read_entry(
        &mut self,
        bit_width: u64,
        count: u64,
    ) -> Result<(u64, EntryBody), RestoreError> {
        let state = self.restart.as_mut().ok_or(RestoreError::NoActiveRestart)?;
        let index = state.next_index;
        let path = entry_path(&state.dir, index);
        let bytes = self
            .storage
            .read_file(&path)
            .map_err(|source| RestoreError::Io {
                path: path.clone(),
                source,
            })?;
        let entry =
            VariableEntry::decode(&bytes).map_err(|source| RestoreError::Format { path, source })?;
        if entry.bit_width != bit_width || entry.count != count {
            return Err(RestoreError::ShapeMismatch {
                index,
                bits: bit_width,
                count,
                found_bits: entry.bit_width,
                found_count: entry.count,
            });
        }
        Ok((index, entry.body))
    }

    fn record_restored(&mut self, index: u64, address: A) {
        if let Some(state) = self.restart.as_mut() {
            let i = index as usize;
            if state.addresses.len() <= i {
                state.addresses.resize(i + 1, None);
            }
            state.addresses[i] = Some(address);
            state.next_index += 1;
        }
        self.stats.restored += 1;
    }

    /// Read the next entry, a data entry, into `dest`, which lives at `address`
    pub fn restart_read_pointer(
        &mut self,
        bit_width: u64,
        count: u64,
        address: A,
        dest: &mut [u8],
    ) -> Result<(), RestoreError> {
        let (index, body) = self.read_entry(bit_width, count)?;
        let payload = match body {
            EntryBody::Data(p) => p,
            EntryBody::Alias { .. } => {
                return Err(RestoreError::UnexpectedKind {
                    index,
                    expected: "data",
                })
            }
        };
        // decoding already checked the payload against the declared shape
        let needed = payload.len();
        if dest.len() < needed {
            return Err(RestoreError::BufferTooSmall {
                index,
                needed,
                available: dest.len(),
            });
        }
        restore_payload(dest, &payload, bit_width * count);
        trace!("Restored entry"; "index" => index, "bytes" => needed);
        self.record_restored(index, address);
        Ok(())
    }

    /// Read the next entry, an alias entry, and return the address it refers to
    pub fn restart_read_alias(&mut self, bit_width: u64, count: u64) -> Result<A, RestoreError> {
        let (index, body) = self.read_entry(bit_width, count)?;
        let target = match body {
            EntryBody::Alias { index } => index,
            EntryBody::Data(_) => {
                return Err(RestoreError::UnexpectedKind {
                    index,
                    expected: "alias",
                })
            }
        };
        let address = self
            .restart
            .as_ref()
            .and_then(|s| s.addresses.get(target as usize).copied().flatten())
            .ok_or(RestoreError::DanglingAlias { index, target })?;
        trace!("Restored alias"; "index" => index, "target" => target);
        self.record_restored(index, address);
        Ok(address)
    }

    /// Leave restart mode. The interval timer starts over from here.
    pub fn restart_finish(&mut self) {
        if let Some(state) = self.restart.take() {
            info!("Restart complete"; "dir" => %state.dir.display(), "entries" => state.next_index);
        }
        if let Some(now) = self.clock.monotonic() {
            self.last_checkpoint = now;
        }
    }
}
