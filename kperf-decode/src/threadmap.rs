//! The thread map stored between the header and the events.
//!
//! Each entry names the command a thread belonged to when tracing started. Entries marked invalid
//! are placeholders and carry no information.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::layout::{EventLayout, COMMAND_LEN};

/// Who owns the thread of a thread map entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    Invalid,
    Kernel,
    Process(i32),
}

impl From<i32> for Owner {
    fn from(valid: i32) -> Self {
        match valid {
            0 => Self::Invalid,
            1 => Self::Kernel,
            pid => Self::Process(pid),
        }
    }
}

impl Owner {
    /// The raw `valid` word this owner was decoded from.
    pub fn raw(&self) -> i32 {
        match self {
            Self::Invalid => 0,
            Self::Kernel => 1,
            Self::Process(pid) => *pid,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ThreadMapEntry {
    pub thread_id: u64,
    pub owner: Owner,
    /// Command name, not necessarily NUL terminated.
    pub command: [u8; COMMAND_LEN],
}

impl ThreadMapEntry {
    pub fn is_valid(&self) -> bool {
        self.owner != Owner::Invalid
    }

    /// Command name up to the first NUL.
    pub fn name(&self) -> Cow<'_, str> {
        let len = self
            .command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_LEN);
        String::from_utf8_lossy(&self.command[..len])
    }
}

/// Lazily decodes the entries of a thread map in table order.
///
/// Iteration stops at the end of the table or at the first entry that does not fit in the buffer.
#[derive(Debug, Clone)]
pub struct ThreadMapIter<'b> {
    buffer: &'b [u8],
    layout: EventLayout,
    pos: usize,
    end: usize,
}

impl<'b> ThreadMapIter<'b> {
    pub fn new(buffer: &'b [u8], offset: usize, entry_count: usize, layout: EventLayout) -> Self {
        Self {
            buffer,
            layout,
            pos: offset,
            end: offset.saturating_add(entry_count.saturating_mul(layout.thread_entry_size())),
        }
    }

    /// Number of table slots not yet visited.
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos) / self.layout.thread_entry_size()
    }
}

impl<'b> Iterator for ThreadMapIter<'b> {
    type Item = ThreadMapEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let bytes = self.buffer.get(self.pos..).unwrap_or_default();
        match self.layout.decode_thread_entry(bytes) {
            Ok(entry) => {
                self.pos += self.layout.thread_entry_size();
                Some(entry)
            }
            Err(err) => {
                tracing::warn!(
                    offset = self.pos,
                    remaining = self.remaining(),
                    "thread map is truncated: {err}"
                );
                self.pos = self.end;
                None
            }
        }
    }
}

/// Lookup of the valid thread map entries seen so far.
#[derive(Debug, Clone, Default)]
pub struct ThreadMap {
    entries: HashMap<u64, ThreadMapEntry>,
}

impl ThreadMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a valid entry; a later entry for the same thread replaces the earlier one.
    pub fn insert(&mut self, entry: ThreadMapEntry) {
        if entry.is_valid() {
            self.entries.insert(entry.thread_id, entry);
        }
    }

    pub fn get(&self, thread_id: u64) -> Option<&ThreadMapEntry> {
        self.entries.get(&thread_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadMapEntry> {
        self.entries.values()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
