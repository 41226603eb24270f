//! Builds RAW buffers for the integration tests.

#![allow(dead_code)]

use kpdecode::layout::{page_align, HEADER_V1_SIZE, HEADER_V2_SIZE, RAW_VERSION1, RAW_VERSION2};
use kpdecode::DebugId;

pub struct RawBuilder {
    version: u32,
    is64: bool,
    thread_count: Option<i32>,
    threads: Vec<u8>,
    events: Vec<u8>,
}

impl RawBuilder {
    pub fn v1() -> Self {
        Self::with_version(RAW_VERSION1, true)
    }

    pub fn v2(is64: bool) -> Self {
        Self::with_version(RAW_VERSION2, is64)
    }

    pub fn with_version(version: u32, is64: bool) -> Self {
        Self {
            version,
            is64,
            thread_count: None,
            threads: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Overrides the thread count written to the header.
    pub fn thread_count(mut self, count: i32) -> Self {
        self.thread_count = Some(count);
        self
    }

    pub fn thread(mut self, thread_id: u64, valid: i32, name: &str) -> Self {
        if self.is64 {
            self.threads.extend(thread_id.to_le_bytes());
        } else {
            self.threads.extend((thread_id as u32).to_le_bytes());
        }
        self.threads.extend(valid.to_le_bytes());
        let mut command = [0u8; 20];
        let len = name.len().min(20);
        command[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.threads.extend(command);
        self
    }

    pub fn event(
        mut self,
        cpu: u8,
        timestamp: u64,
        debug_id: DebugId,
        args: [u64; 4],
        thread_id: u64,
    ) -> Self {
        let raw = (cpu as u64) << 56 | timestamp & 0x00ff_ffff_ffff_ffff;
        self.events.extend(raw.to_le_bytes());
        for arg in args.into_iter().chain([thread_id]) {
            if self.is64 {
                self.events.extend(arg.to_le_bytes());
            } else {
                self.events.extend((arg as u32).to_le_bytes());
            }
        }
        self.events.extend(debug_id.raw().to_le_bytes());
        if self.is64 {
            // The cpuid word disagrees on purpose, it must not be consulted.
            self.events.extend(0xffff_ffffu32.to_le_bytes());
            self.events.extend(0u64.to_le_bytes());
        }
        self
    }

    /// Appends bytes after the last event.
    pub fn trailing(mut self, bytes: &[u8]) -> Self {
        self.events.extend_from_slice(bytes);
        self
    }

    pub fn thread_entry_size(&self) -> usize {
        if self.is64 {
            0x20
        } else {
            0x1c
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let thread_count = self
            .thread_count
            .unwrap_or((self.threads.len() / self.thread_entry_size()) as i32);
        let header_size = if self.version == RAW_VERSION1 {
            HEADER_V1_SIZE
        } else {
            HEADER_V2_SIZE
        };

        let mut bytes = vec![0u8; header_size];
        bytes[0..4].copy_from_slice(&self.version.to_le_bytes());
        bytes[4..8].copy_from_slice(&thread_count.to_le_bytes());
        bytes[8..16].copy_from_slice(&1_700_000_000u64.to_le_bytes());
        bytes[16..20].copy_from_slice(&250_000u32.to_le_bytes());
        if header_size == HEADER_V2_SIZE {
            bytes[20..24].copy_from_slice(&(self.is64 as u32).to_le_bytes());
            bytes[24..32].copy_from_slice(&24_000_000u64.to_le_bytes());
        }
        bytes.extend_from_slice(&self.threads);
        bytes.resize(page_align(bytes.len()), 0);
        bytes.extend_from_slice(&self.events);
        bytes
    }
}
