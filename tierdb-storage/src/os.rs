//! # OS File Layer
//!
//! The engine never touches `std::fs` directly for data files; it goes through
//! a [`FileSystem`] that hands out [`OsFile`] implementations. Each
//! implementation declares which operations it supports so the file handle
//! cache can reject incomplete handles when they are opened.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use tierdb_core::error::{Error, Result};

/// Kind of file being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Data,
    Log,
    Regular,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub create: bool,
    pub exclusive: bool,
    pub readonly: bool,
    pub direct_io: bool,
}

impl OpenFlags {
    pub fn create_exclusive() -> Self {
        Self {
            create: true,
            exclusive: true,
            ..Default::default()
        }
    }

    pub fn readonly() -> Self {
        Self {
            readonly: true,
            ..Default::default()
        }
    }
}

/// Operations a handle implementation provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub close: bool,
    pub read: bool,
    pub size: bool,
    pub sync: bool,
    pub write: bool,
}

impl Capabilities {
    pub const ALL: Capabilities = Capabilities {
        close: true,
        read: true,
        size: true,
        sync: true,
        write: true,
    };

    /// Names of required operations the handle lacks; sync and write are only
    /// required for writable handles.
    pub fn missing(&self, readonly: bool) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.close {
            missing.push("close");
        }
        if !self.read {
            missing.push("read");
        }
        if !self.size {
            missing.push("size");
        }
        if !readonly {
            if !self.sync {
                missing.push("sync");
            }
            if !self.write {
                missing.push("write");
            }
        }
        missing
    }
}

/// An open OS-level file.
pub trait OsFile: Send + Sync {
    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    fn size(&self) -> Result<u64>;

    fn truncate(&self, len: u64) -> Result<()>;

    fn sync(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Directory-scoped file system used for data files.
pub trait FileSystem: Send + Sync {
    fn open(&self, name: &str, kind: FileType, flags: OpenFlags) -> Result<Box<dyn OsFile>>;

    fn exists(&self, name: &str) -> Result<bool>;

    fn remove(&self, name: &str) -> Result<()>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Absolute path of a file, for collaborators that copy files wholesale.
    fn path(&self, name: &str) -> PathBuf;
}

/// File system rooted at the database home directory.
pub struct LocalFileSystem {
    home: PathBuf,
}

impl LocalFileSystem {
    pub fn new(home: impl Into<PathBuf>) -> Result<Self> {
        let home = home.into();
        fs::create_dir_all(&home)?;
        Ok(Self { home })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}

impl FileSystem for LocalFileSystem {
    fn open(&self, name: &str, _kind: FileType, flags: OpenFlags) -> Result<Box<dyn OsFile>> {
        let path = self.path(name);
        let mut opts = OpenOptions::new();
        opts.read(true);
        if !flags.readonly {
            opts.write(true);
            if flags.exclusive {
                opts.create_new(true);
            } else if flags.create {
                opts.create(true);
            }
        }
        let file = opts.open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => Error::exists(name),
            _ => Error::from(e),
        })?;
        Ok(Box::new(LocalFile {
            file: Mutex::new(Some(file)),
            path,
        }))
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.path(name).exists())
    }

    fn remove(&self, name: &str) -> Result<()> {
        fs::remove_file(self.path(name))?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.path(from), self.path(to))?;
        Ok(())
    }

    fn path(&self, name: &str) -> PathBuf {
        self.home.join(name)
    }
}

struct LocalFile {
    file: Mutex<Option<File>>,
    path: PathBuf,
}

impl LocalFile {
    fn with_file<T>(&self, f: impl FnOnce(&mut File) -> std::io::Result<T>) -> Result<T> {
        let mut guard = self.file.lock();
        match guard.as_mut() {
            Some(file) => Ok(f(file)?),
            None => Err(Error::invalid(format!("{}: file handle is closed", self.path.display()))),
        }
    }
}

impl OsFile for LocalFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.with_file(|f| {
            f.seek(SeekFrom::Start(offset))?;
            f.read_exact(buf)
        })
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.with_file(|f| {
            f.seek(SeekFrom::Start(offset))?;
            f.write_all(data)
        })
    }

    fn size(&self) -> Result<u64> {
        self.with_file(|f| Ok(f.metadata()?.len()))
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.with_file(|f| f.set_len(len))
    }

    fn sync(&self) -> Result<()> {
        self.with_file(|f| f.sync_all())
    }

    fn close(&self) -> Result<()> {
        // Dropping the std handle closes the descriptor.
        self.file.lock().take();
        Ok(())
    }
}
