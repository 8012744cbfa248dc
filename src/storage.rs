//! Where checkpoints live. Paths handed to a [`CheckpointStorage`] are relative to its root;
//! the empty path names the root itself.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

pub trait CheckpointStorage {
    /// Create the directory `path`. Fails if it already exists or its parent does not.
    fn create_dir(&mut self, path: &Path) -> io::Result<()>;
    /// Create or replace the file `path`
    fn write_file(&mut self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
    /// Names of the directories directly inside `path`, in no particular order
    fn list_dirs(&self, path: &Path) -> io::Result<Vec<String>>;
    fn exists(&self, path: &Path) -> bool;
}

/// Storage backed by a directory of the file system
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage rooted at the current working directory
    pub fn current_dir() -> Self {
        Self::new(".")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl CheckpointStorage for FsStorage {
    fn create_dir(&mut self, path: &Path) -> io::Result<()> {
        let mut builder = std::fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(self.root.join(path))
    }

    fn write_file(&mut self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(self.root.join(path), contents)
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(self.root.join(path))
    }

    fn list_dirs(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut r = vec![];
        for entry in std::fs::read_dir(self.root.join(path))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    r.push(name.to_string());
                }
            }
        }
        Ok(r)
    }

    fn exists(&self, path: &Path) -> bool {
        self.root.join(path).exists()
    }
}

/// In-memory storage, for tests and dry runs
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Default::default()
    }

    fn parent_exists(&self, path: &Path) -> bool {
        match path.parent() {
            None => true,
            Some(p) if p.as_os_str().is_empty() => true,
            Some(p) => self.dirs.contains(p),
        }
    }

    fn not_found(path: &Path) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("`{}` does not exist", path.display()),
        )
    }

    pub fn remove_file(&mut self, path: &Path) -> Option<Vec<u8>> {
        self.files.remove(path)
    }

    /// Every file, with its contents
    pub fn files(&self) -> impl Iterator<Item = (&Path, &[u8])> {
        self.files.iter().map(|(p, c)| (p.as_path(), c.as_slice()))
    }
}

impl CheckpointStorage for MemStorage {
    fn create_dir(&mut self, path: &Path) -> io::Result<()> {
        if self.exists(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("`{}` already exists", path.display()),
            ));
        }
        if !self.parent_exists(path) {
            return Err(Self::not_found(path));
        }
        self.dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn write_file(&mut self, path: &Path, contents: &[u8]) -> io::Result<()> {
        if self.dirs.contains(path) || !self.parent_exists(path) {
            return Err(Self::not_found(path));
        }
        self.files.insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| Self::not_found(path))
    }

    fn list_dirs(&self, path: &Path) -> io::Result<Vec<String>> {
        if !path.as_os_str().is_empty() && !self.dirs.contains(path) {
            return Err(Self::not_found(path));
        }
        Ok(self
            .dirs
            .iter()
            .filter(|d| d.parent() == Some(path))
            .filter_map(|d| d.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect())
    }

    fn exists(&self, path: &Path) -> bool {
        self.dirs.contains(path) || self.files.contains_key(path)
    }
}
