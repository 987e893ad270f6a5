// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Append-only trace log writer.
//!
//! File layout:
//!
//! ```text
//! header (40 B)  magic "RTRC" | version u16 | flags u16 | thread_count u16
//!                | reserved [u8;6] | created_ns u64 | code_table_offset u64
//!                | trailer_offset u64
//! event stream   per-thread segments:
//!                  thread_id u16 | seg_len u64 | start_counter u64 | events
//! code table     at code_table_offset, written at close
//! index tail     at trailer_offset: (counter u64, offset u64) pairs
//! ```
//!
//! The header is written at creation with zeroed offsets and patched at
//! close; zeroed offsets mark a truncated file. Events are buffered per
//! thread and flushed on end-of-frame, when a buffer reaches 64 KiB, and at
//! close.
//!
//! The writer holds an exclusive advisory lock (a `.lock` sibling file) and
//! records the creating process id. An append from a forked child either
//! fails ([`ForkPolicy::Refuse`]) or transparently switches to a fresh
//! per-process file ([`ForkPolicy::PerProcessFile`]); the inherited handle is
//! never written through.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use thiserror::Error;

use crate::codec::encode_event;
use crate::config::{per_process_path, ForkPolicy};
use crate::event::TraceEvent;
use crate::format::Writer as ByteWriter;
use crate::program::{CodeEntry, CodeId, CodeObject, CodeTable};

/// Trace file magic.
pub const MAGIC: &[u8; 4] = b"RTRC";
/// Trace format version written by this crate.
pub const VERSION: u16 = 1;
/// Header flag: the stream was cut short by a recording invariant violation.
pub const FLAG_TRUNCATED: u16 = 1 << 0;
/// Fixed header length.
pub const HEADER_LEN: u64 = 40;
/// Segment header length (`thread_id u16 | seg_len u64 | start_counter u64`).
pub const SEGMENT_HEADER_LEN: u64 = 18;
/// Buffered bytes per thread before an automatic flush.
pub const FLUSH_THRESHOLD: usize = 64 * 1024;
/// One index entry is recorded every this many events.
pub const INDEX_STRIDE: u64 = 4096;

/// A trace write failure.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Underlying I/O failure. Buffered events are dropped and the session
    /// must close.
    #[error("trace write failed: {0}")]
    Io(#[from] std::io::Error),
    /// Another live writer holds the lock for this path.
    #[error("trace file is locked: {}", path.display())]
    Locked {
        /// The contested trace path.
        path: PathBuf,
    },
    /// The writer was used from a forked child under [`ForkPolicy::Refuse`].
    #[error("recording refused in forked child")]
    ForkedChild,
    /// The writer was already closed.
    #[error("trace writer is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct Lane {
    buf: ByteWriter,
    start_counter: u64,
    // (counter, offset within buf) for events on an index stride boundary.
    pending_index: Vec<(u64, usize)>,
}

#[derive(Debug)]
struct Inner {
    file: Option<File>,
    path: PathBuf,
    lock_path: PathBuf,
    pid: u32,
    fork_policy: ForkPolicy,
    flags: u16,
    created_ns: u64,
    file_offset: u64,
    lanes: BTreeMap<u16, Lane>,
    code_entries: BTreeMap<u32, CodeEntry>,
    global_names: Vec<String>,
    index: Vec<(u64, u64)>,
    event_count: u64,
}

/// Single-producer-per-file trace log writer.
///
/// Shared across recorder threads behind an `Arc`; appends from different
/// guest threads land in separate segment lanes.
#[derive(Debug)]
pub struct TraceWriter {
    inner: Mutex<Inner>,
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn acquire_lock(path: &Path) -> Result<PathBuf, WriteError> {
    let mut lock_name = path.file_name().map_or_else(
        || "trace".to_string(),
        |n| n.to_string_lossy().into_owned(),
    );
    lock_name.push_str(".lock");
    let lock_path = path.with_file_name(lock_name);
    let mut lock = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(WriteError::Locked {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(e.into()),
    };
    let _ = writeln!(lock, "{}", std::process::id());
    Ok(lock_path)
}

fn write_header(file: &mut File, inner: &HeaderFields) -> Result<(), WriteError> {
    let mut h = ByteWriter::new();
    h.write_bytes(MAGIC);
    h.write_u16_le(VERSION);
    h.write_u16_le(inner.flags);
    h.write_u16_le(inner.thread_count);
    h.write_bytes(&[0u8; 6]);
    h.write_u64_le(inner.created_ns);
    h.write_u64_le(inner.code_table_offset);
    h.write_u64_le(inner.trailer_offset);
    debug_assert_eq!(h.len() as u64, HEADER_LEN);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(h.as_slice())?;
    Ok(())
}

struct HeaderFields {
    flags: u16,
    thread_count: u16,
    created_ns: u64,
    code_table_offset: u64,
    trailer_offset: u64,
}

impl Inner {
    fn open_file(path: &Path, fork_policy: ForkPolicy, created_ns: u64) -> Result<Self, WriteError> {
        let lock_path = acquire_lock(path)?;
        let mut file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
        {
            Ok(f) => f,
            Err(e) => {
                let _ = std::fs::remove_file(&lock_path);
                return Err(e.into());
            }
        };
        write_header(
            &mut file,
            &HeaderFields {
                flags: 0,
                thread_count: 0,
                created_ns,
                code_table_offset: 0,
                trailer_offset: 0,
            },
        )?;
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            lock_path,
            pid: std::process::id(),
            fork_policy,
            flags: 0,
            created_ns,
            file_offset: HEADER_LEN,
            lanes: BTreeMap::new(),
            code_entries: BTreeMap::new(),
            global_names: Vec::new(),
            index: Vec::new(),
            event_count: 0,
        })
    }

    /// Returns `Err(ForkedChild)` or switches this writer to a per-process
    /// file when the current pid is not the creating pid.
    fn guard_fork(&mut self) -> Result<(), WriteError> {
        let pid = std::process::id();
        if pid == self.pid {
            return Ok(());
        }
        match self.fork_policy {
            ForkPolicy::Refuse => {
                // The inherited handle is never written through; the parent
                // owns the file and its lock.
                Err(WriteError::ForkedChild)
            }
            ForkPolicy::PerProcessFile => {
                tracing::warn!(pid, "fork detected, switching to per-process trace file");
                let child_path = per_process_path(&self.path, pid);
                let fresh = Self::open_file(&child_path, self.fork_policy, self.created_ns)?;
                // Carry over the code table; events buffered pre-fork belong
                // to the parent and are discarded here.
                let code_entries = std::mem::take(&mut self.code_entries);
                let global_names = std::mem::take(&mut self.global_names);
                *self = fresh;
                self.code_entries = code_entries;
                self.global_names = global_names;
                Ok(())
            }
        }
    }

    fn file(&mut self) -> Result<&mut File, WriteError> {
        self.file.as_mut().ok_or(WriteError::Closed)
    }

    fn flush_lane(&mut self, thread_id: u16) -> Result<(), WriteError> {
        let (payload, start_counter, raw_pending) = {
            let lane = match self.lanes.get_mut(&thread_id) {
                Some(l) if !l.buf.is_empty() => l,
                _ => return Ok(()),
            };
            let payload = std::mem::take(&mut lane.buf);
            let pending: Vec<(u64, usize)> = lane.pending_index.drain(..).collect();
            (payload, lane.start_counter, pending)
        };
        let seg_len = payload.len() as u64;
        let mut header = ByteWriter::new();
        header.write_u16_le(thread_id);
        header.write_u64_le(seg_len);
        header.write_u64_le(start_counter);
        debug_assert_eq!(header.len() as u64, SEGMENT_HEADER_LEN);

        let events_offset = self.file_offset + SEGMENT_HEADER_LEN;
        let pending: Vec<(u64, u64)> = raw_pending
            .into_iter()
            .map(|(counter, buf_off)| (counter, events_offset + buf_off as u64))
            .collect();

        let file = self.file()?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(header.as_slice())?;
        file.write_all(payload.as_slice())?;
        self.file_offset = events_offset + seg_len;
        self.index.extend(pending);
        Ok(())
    }

    fn append(&mut self, event: &TraceEvent) -> Result<(), WriteError> {
        self.guard_fork()?;
        if self.file.is_none() {
            return Err(WriteError::Closed);
        }
        let thread_id = event.thread_id();
        let counter = event.counter();
        let stride_hit = self.event_count % INDEX_STRIDE == 0;
        self.event_count += 1;
        let lane = self.lanes.entry(thread_id).or_default();
        if lane.buf.is_empty() {
            lane.start_counter = counter;
        }
        if stride_hit {
            lane.pending_index.push((counter, lane.buf.len()));
        }
        encode_event(event, &mut lane.buf);
        let need_flush = lane.buf.len() >= FLUSH_THRESHOLD;
        if need_flush {
            self.flush_lane(thread_id)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), WriteError> {
        if self.file.is_none() {
            return Ok(());
        }
        if std::process::id() != self.pid {
            // A forked child must not finalize the parent's file.
            self.file = None;
            return Ok(());
        }
        let thread_ids: Vec<u16> = self.lanes.keys().copied().collect();
        for t in &thread_ids {
            self.flush_lane(*t)?;
        }

        let code_table_offset = self.file_offset;
        let table = CodeTable {
            global_names: std::mem::take(&mut self.global_names),
            entries: std::mem::take(&mut self.code_entries)
                .into_values()
                .collect(),
        };
        let mut body = ByteWriter::new();
        table.encode(&mut body);
        let trailer_offset = code_table_offset + body.len() as u64;
        for (counter, offset) in &self.index {
            body.write_u64_le(*counter);
            body.write_u64_le(*offset);
        }

        let flags = self.flags;
        let thread_count = thread_ids.len() as u16;
        let created_ns = self.created_ns;
        let file = self.file()?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(body.as_slice())?;
        write_header(
            file,
            &HeaderFields {
                flags,
                thread_count,
                created_ns,
                code_table_offset,
                trailer_offset,
            },
        )?;
        file.sync_all()?;
        self.file = None;
        let _ = std::fs::remove_file(&self.lock_path);
        tracing::debug!(path = %self.path.display(), events = self.event_count, "trace closed");
        Ok(())
    }
}

impl TraceWriter {
    /// Creates a trace file at `path`, taking its advisory lock.
    pub fn create(path: &Path, fork_policy: ForkPolicy) -> Result<Self, WriteError> {
        let inner = Inner::open_file(path, fork_policy, now_ns())?;
        tracing::debug!(path = %path.display(), "trace created");
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Records the module-level name table persisted with the code table.
    pub fn set_global_names(&self, names: Vec<String>) {
        self.inner.lock().global_names = names;
    }

    /// Registers a code object the first time a frame enters it.
    pub fn register_code(&self, code_id: CodeId, code: &CodeObject) {
        let mut inner = self.inner.lock();
        inner
            .code_entries
            .entry(code_id.0)
            .or_insert_with(|| CodeEntry::from_code(code_id, code));
    }

    /// Appends one event to its thread's lane.
    pub fn append(&self, event: &TraceEvent) -> Result<(), WriteError> {
        self.inner.lock().append(event)
    }

    /// Flushes a thread's lane (called at end-of-frame).
    pub fn flush_thread(&self, thread_id: u16) -> Result<(), WriteError> {
        let mut inner = self.inner.lock();
        inner.guard_fork()?;
        inner.flush_lane(thread_id)
    }

    /// Marks the file truncated-by-corruption; persisted in the header flags
    /// at close.
    pub fn mark_truncated(&self) {
        self.inner.lock().flags |= FLAG_TRUNCATED;
    }

    /// Flushes everything, writes the code table and index tail, patches the
    /// header and releases the lock. Idempotent.
    pub fn close(&self) -> Result<(), WriteError> {
        self.inner.lock().close()
    }

    /// Returns the path of the file currently being written (the per-process
    /// sibling after a [`ForkPolicy::PerProcessFile`] switch).
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    /// Overrides the recorded owning pid so fork handling can be exercised
    /// without forking. Test support only.
    #[doc(hidden)]
    pub fn override_owner_pid(&self, pid: u32) {
        self.inner.lock().pid = pid;
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.file.is_some() {
            if let Err(e) = inner.close() {
                tracing::warn!(error = %e, "trace close on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AbortEvent;

    fn abort_event(counter: u64) -> TraceEvent {
        TraceEvent::Abort(AbortEvent {
            counter,
            thread_id: 0,
            reason: "cancelled".into(),
        })
    }

    #[test]
    fn lock_is_exclusive_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.rtrc");
        let w = TraceWriter::create(&path, ForkPolicy::Refuse).unwrap();
        let second = TraceWriter::create(&path, ForkPolicy::Refuse);
        assert!(matches!(second, Err(WriteError::Locked { .. })));
        w.close().unwrap();
        let third = TraceWriter::create(&path, ForkPolicy::Refuse).unwrap();
        third.close().unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.rtrc");
        let w = TraceWriter::create(&path, ForkPolicy::Refuse).unwrap();
        w.append(&abort_event(1)).unwrap();
        w.close().unwrap();
        w.close().unwrap();
        assert!(matches!(
            w.append(&abort_event(2)),
            Err(WriteError::Closed)
        ));
    }

    #[test]
    fn header_is_patched_at_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.rtrc");
        let w = TraceWriter::create(&path, ForkPolicy::Refuse).unwrap();
        w.append(&abort_event(1)).unwrap();
        w.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], MAGIC);
        let code_table_offset =
            u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        let trailer_offset = u64::from_le_bytes(bytes[32..40].try_into().unwrap());
        assert!(code_table_offset >= HEADER_LEN);
        assert!(trailer_offset >= code_table_offset);
    }
}
