//! Lazy replay over the durable log.

use crate::error::CoreResult;
use crate::log::frame::read_frame;
use crate::log::writer::LogFile;
use crate::mutation::LogEntry;
use crate::types::SequenceNumber;
use parking_lot::Mutex;
use std::sync::Arc;

/// Iterator over log entries from a starting sequence number.
///
/// Created by [`crate::DurableLog::replay_from`]. It yields entries in log
/// order and stops at the newest entry that existed when it was created.
/// The log lock is taken once per entry, so appends interleave freely.
/// If compaction rewrites the file mid-replay, the iterator finds its place
/// again by sequence number.
pub struct LogReplay {
    file: Arc<Mutex<LogFile>>,
    next_seq: SequenceNumber,
    /// Exclusive bound captured at creation.
    end_seq: SequenceNumber,
    offset: Option<u64>,
    generation: u64,
    finished: bool,
}

impl LogReplay {
    pub(crate) fn new(
        file: Arc<Mutex<LogFile>>,
        from: SequenceNumber,
        end_seq: SequenceNumber,
        generation: u64,
    ) -> Self {
        Self {
            file,
            next_seq: from,
            end_seq,
            offset: None,
            generation,
            finished: false,
        }
    }

    fn read_next(&mut self) -> CoreResult<Option<LogEntry>> {
        let file = self.file.lock();
        if file.generation != self.generation {
            self.generation = file.generation;
            self.offset = None;
        }
        let offset = match self.offset {
            Some(offset) => offset,
            None => file.offset_of(self.next_seq)?,
        };

        let size = file.backend.size()?;
        let Some((entry, len)) = read_frame(file.backend.as_ref(), offset, size)? else {
            return Ok(None);
        };
        if entry.sequence >= self.end_seq {
            return Ok(None);
        }

        self.offset = Some(offset + len);
        self.next_seq = entry.sequence.next();
        Ok(Some(entry))
    }
}

impl Iterator for LogReplay {
    type Item = CoreResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.next_seq >= self.end_seq {
            return None;
        }
        match self.read_next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

impl std::fmt::Debug for LogReplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReplay")
            .field("next_seq", &self.next_seq)
            .field("end_seq", &self.end_seq)
            .finish_non_exhaustive()
    }
}
