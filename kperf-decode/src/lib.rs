use std::path::Path;
use std::{fs, io};

pub mod correlate;
pub mod cursor;
pub mod events;
pub mod kdebug;
pub mod layout;
pub mod record;
pub mod threadmap;

pub use cursor::{Cursor, CursorConfig, CursorOptions, StatKind};
pub use kdebug::{DebugId, SlotKind};
pub use record::{Record, RecordFlags};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("a buffer is already attached")]
    AlreadyAttached,

    #[error("malformed layout: {0}")]
    MalformedLayout(#[from] layout::Error),

    #[error("unrecognized RAW version {0:#010x}")]
    UnrecognizedVersion(u32),

    #[error("{slot:?} start on cpu {cpu} while one is still open")]
    Desynchronized { cpu: u32, slot: SlotKind },

    #[error("cpu {0} is out of range")]
    InvalidCpu(u32),

    #[error("header not decoded yet")]
    NotReady,

    #[error("out of memory")]
    OutOfMemory,
}

/// A complete RAW file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TraceBuffer<'b>(&'b [u8]);

impl<'b> TraceBuffer<'b> {
    pub fn new(bytes: &'b [u8]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &'b [u8] {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A cursor with this buffer attached.
    pub fn cursor(&self, config: CursorConfig) -> Cursor<'b> {
        Cursor::attached(self.0, config)
    }
}

impl TraceBuffer<'static> {
    /// Maps the file at `path` for the rest of the process.
    ///
    /// # Safety
    ///
    /// The file must not be modified or truncated while the mapping is in use.
    pub unsafe fn map<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = fs::File::open(path)?;
        let mmap = std::mem::ManuallyDrop::new(memmap::Mmap::map(&file)?);
        Ok(Self(std::slice::from_raw_parts(mmap.as_ptr(), mmap.len())))
    }
}
