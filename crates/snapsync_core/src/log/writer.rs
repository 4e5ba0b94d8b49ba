//! Durable log writer.

use crate::error::{CoreError, CoreResult};
use crate::log::frame::encode_frame;
use crate::log::header::LogHeader;
use crate::log::scan::walk_frames;
use crate::log::replay::LogReplay;
use crate::mutation::{LogEntry, Mutation};
use crate::types::{Origin, SequenceNumber};
use parking_lot::Mutex;
use snapsync_storage::StorageBackend;
use std::sync::Arc;

/// The log file together with its in-memory bookkeeping.
///
/// Replay iterators share it with the writer and lock it once per entry.
pub(crate) struct LogFile {
    pub(crate) backend: Box<dyn StorageBackend>,
    /// `(sequence, offset)` of every frame, in file order.
    pub(crate) index: Vec<(SequenceNumber, u64)>,
    pub(crate) next: SequenceNumber,
    /// Bumped whenever compaction rewrites the file and offsets move.
    pub(crate) generation: u64,
}

impl LogFile {
    /// Offset of the first frame with a sequence number `>= seq`, or the end
    /// of the file.
    pub(crate) fn offset_of(&self, seq: SequenceNumber) -> CoreResult<u64> {
        let pos = self.index.partition_point(|(s, _)| *s < seq);
        match self.index.get(pos) {
            Some((_, offset)) => Ok(*offset),
            None => Ok(self.backend.size()?),
        }
    }
}

/// Append-only, checksummed log of mutations.
///
/// # Example
///
/// ```rust
/// use snapsync_core::{fields, DurableLog, Mutation, Origin, Record};
/// use snapsync_storage::InMemoryBackend;
///
/// let log = DurableLog::open(
///     Box::new(InMemoryBackend::new()),
///     Box::new(InMemoryBackend::new()),
///     true,
/// ).unwrap();
///
/// let create = Mutation::Create(Record::new("p1", fields([("text", "Cat".into())])));
/// let seq = log.append(Origin::Local, &create).unwrap();
///
/// let replayed: Vec<_> = log.replay_from(seq).collect::<Result<_, _>>().unwrap();
/// assert_eq!(replayed[0].mutation, create);
/// ```
pub struct DurableLog {
    file: Arc<Mutex<LogFile>>,
    header_backend: Mutex<Box<dyn StorageBackend>>,
    header: Mutex<LogHeader>,
    sync_on_append: bool,
}

impl DurableLog {
    /// Opens a log over `backend` with its header stored in `header_backend`.
    ///
    /// Scans every frame, cuts off a torn tail and rebuilds the offset
    /// index.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is damaged, a frame fails its checksum,
    /// sequence numbers go backwards, or storage fails.
    pub fn open(
        mut backend: Box<dyn StorageBackend>,
        header_backend: Box<dyn StorageBackend>,
        sync_on_append: bool,
    ) -> CoreResult<Self> {
        let header = LogHeader::decode(&header_backend.read_all()?)?;

        let mut index = Vec::new();
        let (offset, size) = walk_frames(backend.as_ref(), |entry, offset| {
            index.push((entry.sequence, offset));
        })?;
        let last = index.last().map_or(SequenceNumber::ZERO, |(seq, _)| *seq);

        if offset < size {
            tracing::warn!(
                valid_bytes = offset,
                dropped_bytes = size - offset,
                "discarding torn tail of durable log"
            );
            backend.truncate(offset)?;
        }

        let next = last.max(header.last_compacted).next();
        tracing::debug!(entries = index.len(), %next, "durable log opened");

        Ok(Self {
            file: Arc::new(Mutex::new(LogFile {
                backend,
                index,
                next,
                generation: 0,
            })),
            header_backend: Mutex::new(header_backend),
            header: Mutex::new(header),
            sync_on_append,
        })
    }

    /// Appends a mutation and returns its sequence number.
    ///
    /// The frame is written with a single backend append. On failure the
    /// file is cut back to its previous end and no sequence number is
    /// consumed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedMutation`] for an invalid mutation, or
    /// a storage error if the write fails.
    pub fn append(&self, origin: Origin, mutation: &Mutation) -> CoreResult<SequenceNumber> {
        mutation.validate()?;

        let mut file = self.file.lock();
        let sequence = file.next;
        let frame = encode_frame(sequence, origin, mutation)?;

        let before = file.backend.size()?;
        let written = match file.backend.append(&frame) {
            Ok(offset) if self.sync_on_append => file.backend.sync().map(|()| offset),
            other => other,
        };

        let offset = match written {
            Ok(offset) => offset,
            Err(err) => {
                let after = file.backend.size().unwrap_or(before);
                if after > before {
                    if let Err(rollback) = file.backend.truncate(before) {
                        tracing::error!(error = %rollback, "could not roll back partial log frame");
                    }
                }
                return Err(err.into());
            }
        };

        file.index.push((sequence, offset));
        file.next = sequence.next();
        tracing::trace!(%sequence, %origin, kind = mutation.kind(), "appended");
        Ok(sequence)
    }

    /// Returns a lazy iterator over entries with sequence `>= from`.
    ///
    /// The iterator stops at the last entry present when it was created and
    /// does not block appends between items. Creating another one restarts
    /// the replay.
    #[must_use]
    pub fn replay_from(&self, from: SequenceNumber) -> LogReplay {
        let file = self.file.lock();
        LogReplay::new(Arc::clone(&self.file), from, file.next, file.generation)
    }

    /// Collects every entry with sequence `>= from`.
    ///
    /// # Errors
    ///
    /// Returns the first read error.
    pub fn read_from(&self, from: SequenceNumber) -> CoreResult<Vec<LogEntry>> {
        self.replay_from(from).collect()
    }

    /// Sequence number of the newest entry, or zero.
    #[must_use]
    pub fn last_sequence(&self) -> SequenceNumber {
        SequenceNumber::new(self.file.lock().next.as_u64() - 1)
    }

    /// Number of entries currently held in the log file.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.file.lock().index.len()
    }

    /// Size of the log file in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be read.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.file.lock().backend.size()?)
    }

    /// Current header values.
    #[must_use]
    pub fn header(&self) -> LogHeader {
        *self.header.lock()
    }

    /// Highest acknowledged local sequence number.
    #[must_use]
    pub fn ack_watermark(&self) -> SequenceNumber {
        self.header.lock().ack_watermark
    }

    /// Moves the acknowledged watermark forward to `up_to`.
    ///
    /// Values at or below the current watermark are ignored, and values past
    /// the newest entry are clamped to it. Returns `true` if the watermark
    /// moved.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the header cannot be written.
    pub fn acknowledge(&self, up_to: SequenceNumber) -> CoreResult<bool> {
        let up_to = up_to.min(self.last_sequence());
        let mut header = self.header.lock();
        if up_to <= header.ack_watermark {
            return Ok(false);
        }
        let mut updated = *header;
        updated.ack_watermark = up_to;
        self.write_header(&updated)?;
        *header = updated;
        tracing::debug!(watermark = %up_to, "acknowledged watermark advanced");
        Ok(true)
    }

    /// Records the highest remote sequence ingested. Lower values are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the header cannot be written.
    pub fn set_remote_cursor(&self, cursor: u64) -> CoreResult<()> {
        let mut header = self.header.lock();
        if cursor <= header.remote_cursor {
            return Ok(());
        }
        let mut updated = *header;
        updated.remote_cursor = cursor;
        self.write_header(&updated)?;
        *header = updated;
        Ok(())
    }

    /// Drops every entry with sequence `<= through` from the log file.
    ///
    /// The caller must already have folded those entries into a snapshot.
    /// The header is updated before the file is rewritten, so a crash in
    /// between leaves stale entries that replay skips. Returns the number of
    /// entries dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `through` is above the
    /// acknowledged watermark, or a storage error.
    pub fn compact_through(&self, through: SequenceNumber) -> CoreResult<usize> {
        let mut header = self.header.lock();
        if through > header.ack_watermark {
            return Err(CoreError::invalid_operation(format!(
                "cannot compact through {through}, watermark is {}",
                header.ack_watermark
            )));
        }
        if through <= header.last_compacted {
            return Ok(0);
        }

        let mut updated = *header;
        updated.last_compacted = through;
        self.write_header(&updated)?;
        *header = updated;
        drop(header);

        let mut file = self.file.lock();
        let keep_from = file.index.partition_point(|(s, _)| *s <= through);
        if keep_from == 0 {
            return Ok(0);
        }

        let size = file.backend.size()?;
        let cut = file.offset_of(through.next())?;
        let len = usize::try_from(size - cut)
            .map_err(|_| CoreError::invalid_operation("retained log too large"))?;
        let retained = file.backend.read_at(cut, len)?;
        file.backend.replace(&retained)?;

        let index: Vec<_> = file.index[keep_from..]
            .iter()
            .map(|(seq, offset)| (*seq, offset - cut))
            .collect();
        file.index = index;
        file.generation += 1;

        tracing::info!(%through, dropped = keep_from, retained = file.index.len(), "log compacted");
        Ok(keep_from)
    }

    fn write_header(&self, header: &LogHeader) -> CoreResult<()> {
        self.header_backend.lock().replace(&header.encode())?;
        Ok(())
    }
}

impl std::fmt::Debug for DurableLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableLog")
            .field("sync_on_append", &self.sync_on_append)
            .field("header", &*self.header.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::frame::FRAME_HEADER_SIZE;
    use crate::record::{fields, FieldValue, Record};
    use snapsync_storage::{InMemoryBackend, StorageError, StorageResult};

    fn create(id: &str) -> Mutation {
        Mutation::Create(Record::new(id, fields([("text", FieldValue::from(id))])))
    }

    fn open(log: &InMemoryBackend, header: &InMemoryBackend) -> DurableLog {
        DurableLog::open(Box::new(log.clone()), Box::new(header.clone()), true).unwrap()
    }

    #[test]
    fn sequences_start_at_one_and_increase() {
        let (data, head) = (InMemoryBackend::new(), InMemoryBackend::new());
        let log = open(&data, &head);
        assert_eq!(log.last_sequence(), SequenceNumber::ZERO);
        assert_eq!(log.append(Origin::Local, &create("a")).unwrap(), SequenceNumber::new(1));
        assert_eq!(log.append(Origin::Remote, &create("b")).unwrap(), SequenceNumber::new(2));
        assert_eq!(log.entry_count(), 2);
    }

    #[test]
    fn malformed_mutation_is_not_written() {
        let (data, head) = (InMemoryBackend::new(), InMemoryBackend::new());
        let log = open(&data, &head);
        assert!(log.append(Origin::Local, &create("")).is_err());
        assert!(data.data().is_empty());
        assert_eq!(log.append(Origin::Local, &create("a")).unwrap(), SequenceNumber::new(1));
    }

    #[test]
    fn reopen_continues_sequence() {
        let (data, head) = (InMemoryBackend::new(), InMemoryBackend::new());
        {
            let log = open(&data, &head);
            log.append(Origin::Local, &create("a")).unwrap();
            log.append(Origin::Local, &create("b")).unwrap();
        }
        let log = open(&data, &head);
        assert_eq!(log.last_sequence(), SequenceNumber::new(2));
        let entries = log.read_from(SequenceNumber::ZERO).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].mutation, create("b"));
    }

    #[test]
    fn torn_tail_is_cut_on_open() {
        let (data, head) = (InMemoryBackend::new(), InMemoryBackend::new());
        {
            let log = open(&data, &head);
            log.append(Origin::Local, &create("a")).unwrap();
            log.append(Origin::Local, &create("b")).unwrap();
        }
        let full = data.data();
        let torn = InMemoryBackend::with_data(full[..full.len() - 5].to_vec());

        let log = open(&torn, &head);
        assert_eq!(log.entry_count(), 1);
        assert_eq!(log.append(Origin::Local, &create("c")).unwrap(), SequenceNumber::new(2));
        let ids: Vec<_> = log
            .read_from(SequenceNumber::ZERO)
            .unwrap()
            .into_iter()
            .map(|e| e.mutation)
            .collect();
        assert_eq!(ids, vec![create("a"), create("c")]);
    }

    #[test]
    fn checksum_failure_is_fatal() {
        let (data, head) = (InMemoryBackend::new(), InMemoryBackend::new());
        {
            let log = open(&data, &head);
            log.append(Origin::Local, &create("a")).unwrap();
        }
        data.corrupt_byte(FRAME_HEADER_SIZE + 1);
        let result = DurableLog::open(Box::new(data.clone()), Box::new(head.clone()), true);
        assert!(matches!(result, Err(CoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn damaged_length_in_an_early_frame_keeps_the_log() {
        let (data, head) = (InMemoryBackend::new(), InMemoryBackend::new());
        {
            let log = open(&data, &head);
            for id in ["a", "b", "c"] {
                log.append(Origin::Local, &create(id)).unwrap();
            }
        }
        let before = data.data().len();
        data.corrupt_byte(FRAME_HEADER_SIZE - 1);

        let result = DurableLog::open(Box::new(data.clone()), Box::new(head.clone()), true);
        assert!(matches!(result, Err(CoreError::LogCorruption { offset: 0, .. })));
        assert_eq!(data.data().len(), before);
    }

    #[test]
    fn watermark_is_monotone_and_clamped() {
        let (data, head) = (InMemoryBackend::new(), InMemoryBackend::new());
        let log = open(&data, &head);
        for id in ["a", "b", "c"] {
            log.append(Origin::Local, &create(id)).unwrap();
        }

        assert!(log.acknowledge(SequenceNumber::new(2)).unwrap());
        assert!(!log.acknowledge(SequenceNumber::new(1)).unwrap());
        assert_eq!(log.ack_watermark(), SequenceNumber::new(2));
        assert!(log.acknowledge(SequenceNumber::new(99)).unwrap());
        assert_eq!(log.ack_watermark(), SequenceNumber::new(3));

        let reopened = open(&data, &head);
        assert_eq!(reopened.ack_watermark(), SequenceNumber::new(3));
    }

    #[test]
    fn compaction_respects_watermark() {
        let (data, head) = (InMemoryBackend::new(), InMemoryBackend::new());
        let log = open(&data, &head);
        for id in ["a", "b", "c", "d"] {
            log.append(Origin::Local, &create(id)).unwrap();
        }
        log.acknowledge(SequenceNumber::new(2)).unwrap();

        assert!(log.compact_through(SequenceNumber::new(3)).is_err());
        assert_eq!(log.compact_through(SequenceNumber::new(2)).unwrap(), 2);
        assert_eq!(log.compact_through(SequenceNumber::new(2)).unwrap(), 0);

        let remaining: Vec<_> = log
            .read_from(SequenceNumber::ZERO)
            .unwrap()
            .into_iter()
            .map(|e| e.sequence.as_u64())
            .collect();
        assert_eq!(remaining, vec![3, 4]);
        assert_eq!(log.header().last_compacted, SequenceNumber::new(2));

        let reopened = open(&data, &head);
        assert_eq!(reopened.entry_count(), 2);
        assert_eq!(reopened.append(Origin::Local, &create("e")).unwrap(), SequenceNumber::new(5));
    }

    #[test]
    fn fully_compacted_log_keeps_numbering() {
        let (data, head) = (InMemoryBackend::new(), InMemoryBackend::new());
        {
            let log = open(&data, &head);
            log.append(Origin::Local, &create("a")).unwrap();
            log.append(Origin::Local, &create("b")).unwrap();
            log.acknowledge(SequenceNumber::new(2)).unwrap();
            log.compact_through(SequenceNumber::new(2)).unwrap();
        }
        assert!(data.data().is_empty());
        let log = open(&data, &head);
        assert_eq!(log.append(Origin::Local, &create("c")).unwrap(), SequenceNumber::new(3));
    }

    #[test]
    fn replay_survives_concurrent_compaction() {
        let (data, head) = (InMemoryBackend::new(), InMemoryBackend::new());
        let log = open(&data, &head);
        for id in ["a", "b", "c", "d"] {
            log.append(Origin::Local, &create(id)).unwrap();
        }
        let mut replay = log.replay_from(SequenceNumber::new(3));
        log.acknowledge(SequenceNumber::new(2)).unwrap();
        log.compact_through(SequenceNumber::new(2)).unwrap();

        let seqs: Vec<_> = replay
            .by_ref()
            .map(|e| e.unwrap().sequence.as_u64())
            .collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    /// Accepts `budget` bytes, then writes half of the next append and fails.
    struct FailingBackend {
        inner: InMemoryBackend,
        budget: usize,
    }

    impl StorageBackend for FailingBackend {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.inner.read_at(offset, len)
        }
        fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
            let size = self.inner.size()? as usize;
            if size + data.len() > self.budget {
                self.inner.append(&data[..data.len() / 2])?;
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.append(data)
        }
        fn flush(&mut self) -> StorageResult<()> {
            Ok(())
        }
        fn size(&self) -> StorageResult<u64> {
            self.inner.size()
        }
        fn sync(&mut self) -> StorageResult<()> {
            Ok(())
        }
        fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
            self.inner.truncate(new_size)
        }
        fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
            self.inner.replace(data)
        }
    }

    #[test]
    fn failed_append_leaves_no_partial_frame() {
        let inner = InMemoryBackend::new();
        let failing = FailingBackend {
            inner: inner.clone(),
            budget: 120,
        };
        let log =
            DurableLog::open(Box::new(failing), Box::new(InMemoryBackend::new()), true).unwrap();

        log.append(Origin::Local, &create("a")).unwrap();
        let before = inner.data();
        let big = Mutation::Create(Record::new(
            "big",
            fields([("imageData", FieldValue::Blob(vec![7; 256]))]),
        ));
        let err = log.append(Origin::Local, &big).unwrap_err();
        assert!(err.is_io());
        assert_eq!(inner.data(), before);
        assert_eq!(log.last_sequence(), SequenceNumber::new(1));
    }
}
