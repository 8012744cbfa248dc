//! The on-disk checkpoint format.
//!
//! A run of an instrumented program writes into `<prefix><epoch-micros>/`; each checkpoint
//! attempt gets a subdirectory named by its ordinal, holding an `info` file and one file per
//! written value, named by the value's position in the checkpoint:
//!
//! ```text
//! info:      <label>\n<count>\n
//! data:      alias0\n<bit width>\n<elements>\n\n<payload>\n
//! alias:     alias1\n<bit width>\n<elements>\n\n<index>\n
//! ```
//!
//! Numbers are unsigned decimal. A single space between `alias` and the tag is also accepted
//! when reading. The payload holds `ceil(bit width * elements / 8)` raw bytes.
//! An alias entry refers to an entry written earlier in the same checkpoint. Parsing is exact:
//! anything that deviates, including trailing bytes, is rejected.

use crate::error::FormatError;
use crate::storage::CheckpointStorage;
use std::path::{Path, PathBuf};

/// Default prefix of run directory names
pub const RUN_DIR_PREFIX: &str = ".autocr_chkpnt-";
/// Name of the per-checkpoint info file
pub const INFO_FILE: &str = "info";

pub fn run_dir_name(prefix: &str, epoch_micros: u64) -> String {
    format!("{}{}", prefix, epoch_micros)
}

fn parse_decimal(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// The epoch of a run directory name, if it is one
pub fn parse_run_dir_name(prefix: &str, name: &str) -> Option<u64> {
    name.strip_prefix(prefix).and_then(parse_decimal)
}

/// The ordinal of a checkpoint directory name, if it is one
pub fn parse_ordinal(name: &str) -> Option<u64> {
    parse_decimal(name)
}

pub fn entry_path(checkpoint_dir: &Path, index: u64) -> PathBuf {
    checkpoint_dir.join(index.to_string())
}

pub fn info_path(checkpoint_dir: &Path) -> PathBuf {
    checkpoint_dir.join(INFO_FILE)
}

/// Payload length in bytes for `count` elements of `bit_width` bits
pub fn payload_len(bit_width: u64, count: u64) -> Result<usize, FormatError> {
    bit_width
        .checked_mul(count)
        .and_then(|bits| bits.checked_add(7))
        .and_then(|bits| usize::try_from(bits / 8).ok())
        .ok_or(FormatError::SizeOverflow { bit_width, count })
}

/// Copy `total_bits` bits of `payload` into `dest`. When `total_bits` is not a multiple of 8,
/// the bits of the last byte past `total_bits` keep their value in `dest`.
///
/// `dest` and `payload` must both hold at least `ceil(total_bits / 8)` bytes.
pub fn restore_payload(dest: &mut [u8], payload: &[u8], total_bits: u64) {
    let full = (total_bits / 8) as usize;
    dest[..full].copy_from_slice(&payload[..full]);
    let rest = total_bits % 8;
    if rest != 0 {
        let mask: u8 = 0xFFu8 << rest;
        dest[full] = (dest[full] & mask) | (payload[full] & !mask);
    }
}

/// A strict reader over the bytes of one file
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn expect(&mut self, lit: &[u8], expected: &'static str) -> Result<(), FormatError> {
        if self.bytes[self.pos..].starts_with(lit) {
            self.pos += lit.len();
            Ok(())
        } else {
            Err(FormatError::Expected {
                expected,
                offset: self.pos,
            })
        }
    }

    /// Step over `byte` if it comes next
    fn skip(&mut self, byte: u8) {
        if self.bytes.get(self.pos) == Some(&byte) {
            self.pos += 1;
        }
    }

    fn number(&mut self) -> Result<u64, FormatError> {
        let start = self.pos;
        let digits = self.bytes[start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if digits == 0 {
            return Err(FormatError::InvalidNumber { offset: start });
        }
        self.pos += digits;
        self.bytes[start..self.pos]
            .iter()
            .try_fold(0u64, |acc, d| {
                acc.checked_mul(10)?.checked_add((d - b'0') as u64)
            })
            .ok_or(FormatError::InvalidNumber { offset: start })
    }

    fn line_number(&mut self) -> Result<u64, FormatError> {
        let n = self.number()?;
        self.expect(b"\n", "end of line")?;
        Ok(n)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        let available = self.bytes.len() - self.pos;
        if available < n {
            return Err(FormatError::TruncatedPayload {
                needed: n,
                found: available,
            });
        }
        let r = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(r)
    }

    fn finish(&self) -> Result<(), FormatError> {
        match self.bytes.len() - self.pos {
            0 => Ok(()),
            n => Err(FormatError::TrailingBytes(n)),
        }
    }
}

/// Contents of the `info` file
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InfoRecord {
    pub label: u64,
    /// Number of entries the checkpoint holds
    pub var_count: u64,
}

impl InfoRecord {
    pub fn encode(&self) -> Vec<u8> {
        format!("{}\n{}\n", self.label, self.var_count).into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut c = Cursor::new(bytes);
        let label = c.line_number()?;
        let var_count = c.line_number()?;
        c.finish()?;
        Ok(Self { label, var_count })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum EntryBody {
    /// Raw payload
    Data(Vec<u8>),
    /// Same address as the entry at position `index`
    Alias { index: u64 },
}

/// One per-value file of a checkpoint
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct VariableEntry {
    pub bit_width: u64,
    pub count: u64,
    pub body: EntryBody,
}

impl VariableEntry {
    /// A data entry taking its payload from the start of `memory`
    pub fn data(bit_width: u64, count: u64, memory: &[u8]) -> Result<Self, FormatError> {
        let len = payload_len(bit_width, count)?;
        if memory.len() < len {
            return Err(FormatError::TruncatedPayload {
                needed: len,
                found: memory.len(),
            });
        }
        Ok(Self {
            bit_width,
            count,
            body: EntryBody::Data(memory[..len].to_vec()),
        })
    }

    pub fn alias(bit_width: u64, count: u64, index: u64) -> Self {
        Self {
            bit_width,
            count,
            body: EntryBody::Alias { index },
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let tag = match self.body {
            EntryBody::Data(_) => 0,
            EntryBody::Alias { .. } => 1,
        };
        let mut r = format!("alias{}\n{}\n{}\n\n", tag, self.bit_width, self.count).into_bytes();
        match &self.body {
            EntryBody::Data(payload) => {
                r.extend_from_slice(payload);
                r.push(b'\n');
            }
            EntryBody::Alias { index } => {
                r.extend_from_slice(format!("{}\n", index).as_bytes());
            }
        }
        r
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut c = Cursor::new(bytes);
        c.expect(b"alias", "`alias` tag")?;
        c.skip(b' ');
        let tag = c.line_number()?;
        let bit_width = c.line_number()?;
        let count = c.line_number()?;
        c.expect(b"\n", "separator line")?;
        let body = match tag {
            0 => {
                let len = payload_len(bit_width, count)?;
                let payload = c.take(len)?.to_vec();
                c.expect(b"\n", "end of payload")?;
                EntryBody::Data(payload)
            }
            1 => EntryBody::Alias {
                index: c.line_number()?,
            },
            t => return Err(FormatError::UnknownTag(t)),
        };
        c.finish()?;
        Ok(Self {
            bit_width,
            count,
            body,
        })
    }
}

fn numbered_dirs(
    storage: &dyn CheckpointStorage,
    dir: &Path,
    parse: impl Fn(&str) -> Option<u64>,
) -> Vec<u64> {
    let mut r: Vec<u64> = match storage.list_dirs(dir) {
        Ok(names) => names.iter().filter_map(|n| parse(n)).collect(),
        Err(_) => vec![],
    };
    r.sort_unstable_by(|a, b| b.cmp(a));
    r
}

/// Every checkpoint directory under the storage root, in the order a restart considers them:
/// newest run first, and newest checkpoint first within a run
pub fn candidate_checkpoints(storage: &dyn CheckpointStorage, prefix: &str) -> Vec<PathBuf> {
    numbered_dirs(storage, Path::new(""), |n| parse_run_dir_name(prefix, n))
        .into_iter()
        .flat_map(|epoch| {
            let run = PathBuf::from(run_dir_name(prefix, epoch));
            numbered_dirs(storage, &run, parse_ordinal)
                .into_iter()
                .map(move |ordinal| run.join(ordinal.to_string()))
        })
        .collect()
}

/// Check a whole checkpoint directory: the info record, and every entry it announces, each of
/// which must parse exactly and only alias entries written before it.
pub fn validate_checkpoint(
    storage: &dyn CheckpointStorage,
    dir: &Path,
) -> Result<InfoRecord, FormatError> {
    let read = |path: PathBuf| {
        storage
            .read_file(&path)
            .map_err(|_| FormatError::MissingFile(path))
    };
    let info = InfoRecord::decode(&read(info_path(dir))?)?;
    for i in 0..info.var_count {
        let entry = VariableEntry::decode(&read(entry_path(dir, i))?)?;
        if let EntryBody::Alias { index } = entry.body {
            if index >= i {
                return Err(FormatError::ForwardAlias { entry: i, index });
            }
        }
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CheckpointStorage, MemStorage};

    #[test]
    fn info_record_text() {
        let info = InfoRecord {
            label: 3,
            var_count: 12,
        };
        assert_eq!(info.encode(), b"3\n12\n");
        assert_eq!(InfoRecord::decode(b"3\n12\n"), Ok(info));
        assert!(InfoRecord::decode(b"-1\n2\n").is_err());
        assert!(InfoRecord::decode(b"3\n12").is_err());
        assert_eq!(
            InfoRecord::decode(b"3\n12\n\n"),
            Err(FormatError::TrailingBytes(1))
        );
        assert_eq!(
            InfoRecord::decode(b"99999999999999999999\n1\n"),
            Err(FormatError::InvalidNumber { offset: 0 })
        );
    }

    #[test]
    fn data_entry_layout() {
        let e = VariableEntry::data(32, 1, &[5, 0, 0, 0, 0xAA]).unwrap();
        assert_eq!(e.encode(), b"alias0\n32\n1\n\n\x05\x00\x00\x00\n".to_vec());
        assert_eq!(VariableEntry::decode(&e.encode()), Ok(e.clone()));
        // spaced header, as some readers tokenize it
        assert_eq!(
            VariableEntry::decode(b"alias 0\n32\n1\n\n\x05\x00\x00\x00\n"),
            Ok(e)
        );
    }

    #[test]
    fn alias_entry_layout() {
        let e = VariableEntry::alias(64, 3, 1);
        assert_eq!(e.encode(), b"alias1\n64\n3\n\n1\n".to_vec());
        assert_eq!(VariableEntry::decode(&e.encode()), Ok(e.clone()));
        assert_eq!(VariableEntry::decode(b"alias 1\n64\n3\n\n1\n"), Ok(e));
        assert!(VariableEntry::decode(b"alias  1\n64\n3\n\n1\n").is_err());
    }

    #[test]
    fn payload_may_contain_separators() {
        let bytes = [b'\n', b' ', b'\n'];
        let e = VariableEntry::data(8, 3, &bytes).unwrap();
        assert_eq!(VariableEntry::decode(&e.encode()), Ok(e));
    }

    #[test]
    fn truncated_entries_are_rejected() {
        let full = VariableEntry::data(64, 3, &[7u8; 24]).unwrap().encode();
        for cut in 0..full.len() {
            assert!(
                VariableEntry::decode(&full[..cut]).is_err(),
                "prefix of length {} accepted",
                cut
            );
        }
        assert!(VariableEntry::decode(b"alias 2\n8\n1\n\n0\n").is_err());
        assert!(VariableEntry::decode(b"alias0\n8\n1\n\nxy\n").is_err());
    }

    #[test]
    fn payload_length_rounds_up() {
        assert_eq!(payload_len(3, 5), Ok(2));
        assert_eq!(payload_len(1, 8), Ok(1));
        assert_eq!(payload_len(64, 3), Ok(24));
        assert_eq!(payload_len(0, 10), Ok(0));
        assert!(payload_len(u64::MAX, 2).is_err());
    }

    #[test]
    fn partial_last_byte_keeps_high_bits() {
        // 5 elements of 3 bits: 15 bits, padded to 2 bytes
        let written = [0b1010_1010u8, 0b0101_0101];
        let entry = VariableEntry::data(3, 5, &written).unwrap();
        let payload = match VariableEntry::decode(&entry.encode()).unwrap().body {
            EntryBody::Data(p) => p,
            EntryBody::Alias { .. } => unreachable!(),
        };
        let mut dest = [0xFFu8; 2];
        restore_payload(&mut dest, &payload, 15);
        assert_eq!(dest[0], 0b1010_1010);
        // low 7 bits from the payload, the high bit left as it was
        assert_eq!(dest[1] & 0x7F, 0b0101_0101);
        assert_eq!(dest[1] & 0x80, 0x80);
    }

    #[test]
    fn run_directory_names() {
        assert_eq!(run_dir_name(RUN_DIR_PREFIX, 17), ".autocr_chkpnt-17");
        assert_eq!(parse_run_dir_name(RUN_DIR_PREFIX, ".autocr_chkpnt-17"), Some(17));
        assert_eq!(parse_run_dir_name(RUN_DIR_PREFIX, ".autocr_chkpnt-"), None);
        assert_eq!(parse_run_dir_name(RUN_DIR_PREFIX, ".autocr_chkpnt-1x"), None);
        assert_eq!(parse_run_dir_name(RUN_DIR_PREFIX, "other-17"), None);
        assert_eq!(parse_ordinal("4"), Some(4));
        assert_eq!(parse_ordinal("info"), None);
    }

    #[test]
    fn validation_checks_every_entry() {
        let mut s = MemStorage::new();
        let dir = Path::new("run/0");
        s.create_dir(Path::new("run")).unwrap();
        s.create_dir(dir).unwrap();
        s.write_file(
            &info_path(dir),
            &InfoRecord {
                label: 1,
                var_count: 2,
            }
            .encode(),
        )
        .unwrap();
        s.write_file(
            &entry_path(dir, 0),
            &VariableEntry::data(8, 2, &[1, 2]).unwrap().encode(),
        )
        .unwrap();
        assert_eq!(
            validate_checkpoint(&s, dir),
            Err(FormatError::MissingFile(entry_path(dir, 1)))
        );

        s.write_file(&entry_path(dir, 1), &VariableEntry::alias(8, 2, 1).encode())
            .unwrap();
        assert_eq!(
            validate_checkpoint(&s, dir),
            Err(FormatError::ForwardAlias { entry: 1, index: 1 })
        );

        s.write_file(&entry_path(dir, 1), &VariableEntry::alias(8, 2, 0).encode())
            .unwrap();
        assert_eq!(
            validate_checkpoint(&s, dir),
            Ok(InfoRecord {
                label: 1,
                var_count: 2
            })
        );
    }
}
