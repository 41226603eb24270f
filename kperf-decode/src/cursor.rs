//! The pull interface over an attached buffer.

use crate::correlate::{Correlator, Outcome, MAX_RECORDS};
use crate::events::{EventCursor, Phase};
use crate::layout::RawHeader;
use crate::record::Record;
use crate::threadmap::ThreadMap;
use crate::DecodeError;

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct CursorOptions: u32 {
        /// Every kevent becomes its own record, without correlation.
        const RAW_PASSTHROUGH = 1 << 0;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CursorConfig {
    /// Bound of the record queue. A pending head record is forced once it is reached.
    pub max_records: usize,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            max_records: MAX_RECORDS,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StatKind {
    /// Records currently queued, pending or ready.
    RecordCount,
    /// Bytes of kevents consumed up to the oldest queued record, or so far when nothing is queued.
    ByteEstimate,
}

/// Decodes records from at most one attached buffer at a time.
///
/// ```no_run
/// # fn main() -> Result<(), kpdecode::DecodeError> {
/// # let bytes: Vec<u8> = Vec::new();
/// let mut cursor = kpdecode::Cursor::new();
/// cursor.attach(&bytes)?;
/// while let Some(record) = cursor.pull_next_record()? {
///     println!("{record}");
/// }
/// cursor.detach();
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Cursor<'b> {
    events: Option<EventCursor<'b>>,
    correlator: Correlator,
    options: CursorOptions,
    kevent_count: u64,
}

impl<'b> Default for Cursor<'b> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'b> Cursor<'b> {
    pub fn new() -> Self {
        Self::with_config(CursorConfig::default())
    }

    pub fn with_config(config: CursorConfig) -> Self {
        Self {
            events: None,
            correlator: Correlator::new(config.max_records),
            options: CursorOptions::empty(),
            kevent_count: 0,
        }
    }

    /// A cursor with `buffer` already attached.
    pub(crate) fn attached(buffer: &'b [u8], config: CursorConfig) -> Self {
        let mut cursor = Self::with_config(config);
        cursor.events = Some(EventCursor::new(buffer));
        cursor
    }

    pub fn attach(&mut self, buffer: &'b [u8]) -> Result<(), DecodeError> {
        if self.events.is_some() {
            return Err(DecodeError::AlreadyAttached);
        }
        tracing::debug!(len = buffer.len(), "buffer attached");
        self.events = Some(EventCursor::new(buffer));
        Ok(())
    }

    /// Releases the attached buffer and resets all decoding state.
    ///
    /// Queued records that were not pulled are dropped. Options are kept.
    pub fn detach(&mut self) -> Option<&'b [u8]> {
        let events = self.events.take()?;
        if !self.correlator.is_empty() {
            tracing::debug!(dropped = self.correlator.len(), "detached with queued records");
        }
        self.correlator.clear();
        self.kevent_count = 0;
        Some(events.buffer())
    }

    pub fn is_attached(&self) -> bool {
        self.events.is_some()
    }

    pub fn phase(&self) -> Option<Phase> {
        self.events.as_ref().map(EventCursor::phase)
    }

    pub fn header(&self) -> Option<&RawHeader> {
        self.events.as_ref().and_then(EventCursor::header)
    }

    pub fn thread_map(&self) -> Option<&ThreadMap> {
        self.events.as_ref().map(EventCursor::thread_map)
    }

    /// Version tag of an attached buffer that will never be decoded.
    pub fn rejected_version(&self) -> Option<u32> {
        self.events.as_ref().and_then(EventCursor::rejected_version)
    }

    /// Returns the next ready record, or `None` once the buffer is exhausted.
    ///
    /// Records left open at the end of the buffer are only released by [`Cursor::flush`].
    pub fn pull_next_record(&mut self) -> Result<Option<Record>, DecodeError> {
        loop {
            if let Some(record) = self.correlator.next_ready() {
                return Ok(Some(record));
            }
            let Some(events) = self.events.as_mut() else {
                return Ok(None);
            };
            let Some(event) = events.next_event() else {
                return Ok(None);
            };
            let event_size = events.layout().map_or(0, |layout| layout.event_size()) as u64;

            self.kevent_count += 1;
            let consumed = event_size * self.kevent_count;
            let fed = self.correlator.feed(&event, consumed)?;
            if let Outcome::Anomaly(anomaly) = fed.outcome {
                tracing::trace!(kevent = self.kevent_count, "{}", DecodeError::from(anomaly));
            }
            // Older than anything still queued.
            if let Some(record) = fed.evicted {
                return Ok(Some(record));
            }
        }
    }

    /// Forces every open record so that the following pulls return it.
    pub fn flush(&mut self) -> usize {
        self.correlator.flush()
    }

    pub fn stats(&self, kind: StatKind) -> Result<u64, DecodeError> {
        let events = self.events.as_ref().ok_or(DecodeError::NotReady)?;
        let layout = events.layout().ok_or(DecodeError::NotReady)?;
        Ok(match kind {
            StatKind::RecordCount => self.correlator.len() as u64,
            StatKind::ByteEstimate => match self.correlator.front() {
                Some(record) => record.consumed_bytes(),
                None => layout.event_size() as u64 * self.kevent_count,
            },
        })
    }

    /// Sets raw pass-through and returns its previous value.
    pub fn set_option(&mut self, raw_passthrough: bool) -> bool {
        let previous = self.options.contains(CursorOptions::RAW_PASSTHROUGH);
        self.options
            .set(CursorOptions::RAW_PASSTHROUGH, raw_passthrough);
        self.correlator.set_raw_passthrough(raw_passthrough);
        previous
    }

    pub fn options(&self) -> CursorOptions {
        self.options
    }

    /// Number of kevents consumed from the attached buffer, thread map entries included.
    pub fn kevent_count(&self) -> u64 {
        self.kevent_count
    }
}

impl<'b> Iterator for Cursor<'b> {
    type Item = Result<Record, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.pull_next_record().transpose()
    }
}
