// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Trace replay: loading a persisted log and reconstructing state at any
//! instruction counter.
//!
//! Replay never re-executes the guest. A [`Trace`] is the immutable decoded
//! log plus derived indexes (per-thread dense event streams, frame spans). A
//! [`ReplayCursor`] owns the mutable part: the live frame stack and binding
//! state at some counter, rebuilt by scanning forward from the nearest cached
//! snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::codec::decode_event;
use crate::event::{Binding, BindingScope, TraceEvent};
use crate::format::{DecodeError, Reader};
use crate::opcode::{Opcode, ProvClass};
use crate::program::{CodeId, CodeTable, NameId};
use crate::token::{FrameOrd, Tok, TokKind};
use crate::writer::{FLAG_TRUNCATED, HEADER_LEN, MAGIC, SEGMENT_HEADER_LEN, VERSION};

/// How often the cursor snapshots reconstruction state, in applied events.
const SNAPSHOT_STRIDE: u64 = 4096;

/// A replay failure.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// Reading the trace file failed.
    #[error("failed to read trace: {0}")]
    Io(#[from] std::io::Error),
    /// The trace file is malformed.
    #[error("malformed trace: {0}")]
    Decode(#[from] DecodeError),
    /// A queried counter is outside the recorded range.
    #[error("counter {counter} is outside the trace for thread {thread_id}")]
    CounterOutOfRange {
        /// Queried thread.
        thread_id: u16,
        /// Queried counter.
        counter: u64,
    },
    /// No event minted the queried token.
    #[error("no event minted token {tok}")]
    UnknownTok {
        /// Queried token.
        tok: Tok,
    },
    /// The queried frame is not live at the queried counter.
    #[error("frame {frame_ord:?} is not live at counter {counter}")]
    FrameNotLive {
        /// Queried frame.
        frame_ord: FrameOrd,
        /// Queried counter.
        counter: u64,
    },
    /// The trace has no events at all.
    #[error("trace is empty")]
    Empty,
}

/// Decoded fixed header of a trace file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceHeader {
    /// Format version.
    pub version: u16,
    /// Header flags ([`FLAG_TRUNCATED`] is the only assigned bit).
    pub flags: u16,
    /// Number of recorded threads.
    pub thread_count: u16,
    /// Creation timestamp, nanoseconds since the Unix epoch.
    pub created_ns: u64,
}

/// The recorded span of one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameSpan {
    /// Frame ordinal.
    pub frame_ord: FrameOrd,
    /// Code object the frame executed.
    pub code_id: CodeId,
    /// Caller frame, absent for a thread's root frame.
    pub parent: Option<FrameOrd>,
    /// Counter of the frame's enter event.
    pub entry_counter: u64,
    /// Counter of the frame's exit event, absent if the frame never exited.
    pub exit_counter: Option<u64>,
}

#[derive(Debug, Default)]
struct ThreadStream {
    start_counter: u64,
    events: Vec<TraceEvent>,
}

impl ThreadStream {
    fn event_at(&self, counter: u64) -> Option<&TraceEvent> {
        if counter < self.start_counter {
            return None;
        }
        // Streams are dense in the common case; fall back to binary search if
        // unknown-kind records left gaps.
        let guess = (counter - self.start_counter) as usize;
        if let Some(e) = self.events.get(guess) {
            if e.counter() == counter {
                return Some(e);
            }
        }
        self.events
            .binary_search_by_key(&counter, TraceEvent::counter)
            .ok()
            .map(|i| &self.events[i])
    }

    fn max_counter(&self) -> Option<u64> {
        self.events.last().map(TraceEvent::counter)
    }
}

/// An immutable, fully-decoded trace.
#[derive(Debug)]
pub struct Trace {
    /// Path the trace was loaded from.
    pub path: PathBuf,
    /// Fixed header.
    pub header: TraceHeader,
    /// Persisted code table.
    pub code_table: CodeTable,
    threads: BTreeMap<u16, ThreadStream>,
    frame_spans: BTreeMap<FrameOrd, FrameSpan>,
    /// Sparse `counter -> file offset` entries from the index tail. Retained
    /// for diagnostics; in-memory replay indexes events directly.
    index_tail: Vec<(u64, u64)>,
    skipped_records: u64,
}

impl Trace {
    /// Loads and fully decodes the trace at `path`.
    pub fn open(path: &Path) -> Result<Self, ReplayError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(path.to_path_buf(), &bytes)
    }

    fn from_bytes(path: PathBuf, bytes: &[u8]) -> Result<Self, ReplayError> {
        let mut r = Reader::new(bytes);
        if r.read_bytes(4)? != MAGIC {
            return Err(DecodeError::BadMagic.into());
        }
        let version = r.read_u16_le()?;
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion { version }.into());
        }
        let flags = r.read_u16_le()?;
        let thread_count = r.read_u16_le()?;
        let _reserved = r.read_bytes(6)?;
        let created_ns = r.read_u64_le()?;
        let code_table_offset = r.read_u64_le()?;
        let trailer_offset = r.read_u64_le()?;
        if code_table_offset == 0 || trailer_offset == 0 {
            return Err(DecodeError::Truncated.into());
        }
        let code_table_offset = code_table_offset as usize;
        let trailer_offset = trailer_offset as usize;
        if code_table_offset > bytes.len()
            || trailer_offset > bytes.len()
            || code_table_offset < HEADER_LEN as usize
            || trailer_offset < code_table_offset
        {
            return Err(DecodeError::Truncated.into());
        }

        let mut threads: BTreeMap<u16, ThreadStream> = BTreeMap::new();
        let mut skipped_records = 0u64;
        let mut offset = HEADER_LEN as usize;
        while offset < code_table_offset {
            let mut seg = Reader::new(&bytes[offset..code_table_offset]);
            let thread_id = seg.read_u16_le()?;
            let seg_len = seg.read_u64_le()? as usize;
            let start_counter = seg.read_u64_le()?;
            let events_start = offset + SEGMENT_HEADER_LEN as usize;
            let events_end = events_start
                .checked_add(seg_len)
                .ok_or(DecodeError::OutOfBounds)?;
            if events_end > code_table_offset {
                return Err(DecodeError::Truncated.into());
            }

            let stream = threads.entry(thread_id).or_default();
            if stream.events.is_empty() {
                stream.start_counter = start_counter;
            }
            let mut pos = events_start;
            while pos < events_end {
                let decoded = decode_event(&bytes[pos..events_end], pos as u64)?;
                match decoded.event {
                    Some(e) => stream.events.push(e),
                    None => skipped_records += 1,
                }
                pos += decoded.byte_len;
            }
            offset = events_end;
        }
        if skipped_records > 0 {
            tracing::debug!(skipped_records, "skipped unknown record kinds");
        }

        let mut ct_reader = Reader::new(&bytes[code_table_offset..trailer_offset]);
        let code_table = CodeTable::decode(&mut ct_reader)?;

        let mut index_tail = Vec::new();
        let mut tail = Reader::new(&bytes[trailer_offset..]);
        while tail.remaining() >= 16 {
            let counter = tail.read_u64_le()?;
            let off = tail.read_u64_le()?;
            index_tail.push((counter, off));
        }

        let frame_spans = build_frame_spans(&threads);

        Ok(Self {
            path,
            header: TraceHeader {
                version,
                flags,
                thread_count,
                created_ns,
            },
            code_table,
            threads,
            frame_spans,
            index_tail,
            skipped_records,
        })
    }

    /// Returns `true` if the writer marked the file truncated-by-corruption.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.header.flags & FLAG_TRUNCATED != 0
    }

    /// Recorded thread ids, ascending.
    #[must_use]
    pub fn thread_ids(&self) -> Vec<u16> {
        self.threads.keys().copied().collect()
    }

    /// The lowest recorded thread id; queries that take a bare counter are
    /// interpreted on this thread.
    pub fn main_thread(&self) -> Result<u16, ReplayError> {
        self.threads
            .keys()
            .next()
            .copied()
            .ok_or(ReplayError::Empty)
    }

    /// Highest recorded counter for `thread_id`.
    #[must_use]
    pub fn max_counter(&self, thread_id: u16) -> Option<u64> {
        self.threads.get(&thread_id).and_then(ThreadStream::max_counter)
    }

    /// Total number of decoded events.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.threads.values().map(|t| t.events.len() as u64).sum()
    }

    /// Number of well-formed records of unknown kind skipped at load.
    #[must_use]
    pub fn skipped_records(&self) -> u64 {
        self.skipped_records
    }

    /// Entries of the persisted sparse `counter -> offset` index.
    #[must_use]
    pub fn index_tail(&self) -> &[(u64, u64)] {
        &self.index_tail
    }

    /// Returns the event at `counter` on `thread_id`.
    pub fn event_at(&self, thread_id: u16, counter: u64) -> Result<&TraceEvent, ReplayError> {
        self.threads
            .get(&thread_id)
            .and_then(|t| t.event_at(counter))
            .ok_or(ReplayError::CounterOutOfRange { thread_id, counter })
    }

    /// Returns the recorded span of `frame_ord`.
    #[must_use]
    pub fn frame_span(&self, frame_ord: FrameOrd) -> Option<&FrameSpan> {
        self.frame_spans.get(&frame_ord)
    }

    /// Returns the event that minted `tok`.
    pub fn minting_event(&self, tok: Tok) -> Result<&TraceEvent, ReplayError> {
        if tok.is_none() {
            return Err(ReplayError::UnknownTok { tok });
        }
        self.event_at(tok.thread_id(), tok.counter())
            .map_err(|_| ReplayError::UnknownTok { tok })
    }

    /// Returns the parent tokens of `tok`.
    ///
    /// Constant and external-root tokens return an empty list: they terminate
    /// provenance chains.
    pub fn parents_of(&self, tok: Tok) -> Result<Vec<Tok>, ReplayError> {
        let event = self.minting_event(tok)?;
        event
            .parents_of(tok)
            .ok_or(ReplayError::UnknownTok { tok })
    }

    /// Returns descriptive metadata for `tok`.
    pub fn tok_info(&self, tok: Tok) -> Result<TokInfo, ReplayError> {
        let event = self.minting_event(tok)?;
        let kind = event.kind_of(tok);
        let (opcode, code_id, instr_offset, ext) = match event {
            TraceEvent::Instr(e) => (
                Some(e.opcode),
                Some(e.code_id),
                Some(e.instr_offset),
                e.ext.clone(),
            ),
            TraceEvent::Enter(e) => (None, Some(e.code_id), None, None),
            TraceEvent::Abort(_) => (None, None, None, None),
        };
        let line = match (code_id, instr_offset) {
            (Some(id), Some(off)) => self
                .code_table
                .entry(id)
                .and_then(|e| e.line_at(off)),
            _ => None,
        };
        Ok(TokInfo {
            tok,
            kind,
            opcode,
            code_id,
            instr_offset,
            line,
            ext: ext.map(|x| (x.callee_name.into_string(), x.sig_hash)),
        })
    }

    /// Breadth-first walk over parent edges, halting at roots or `max_depth`.
    ///
    /// Nodes are returned in visit order (the queried token first). Already
    /// visited tokens are not expanded twice, so the result is the reachable
    /// DAG, not a tree.
    pub fn back_walk(&self, tok: Tok, max_depth: u32) -> Result<Vec<ProvenanceNode>, ReplayError> {
        let mut nodes = Vec::new();
        let mut visited = std::collections::HashSet::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back((tok, 0u32));
        visited.insert(tok);
        while let Some((t, depth)) = queue.pop_front() {
            let info = self.tok_info(t)?;
            let parents = if depth >= max_depth {
                Vec::new()
            } else {
                self.parents_of(t)?
            };
            for &p in &parents {
                if visited.insert(p) {
                    queue.push_back((p, depth + 1));
                }
            }
            nodes.push(ProvenanceNode {
                info,
                depth,
                parents,
            });
        }
        Ok(nodes)
    }
}

/// Descriptive metadata for one token.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct TokInfo {
    /// The token.
    pub tok: Tok,
    /// How the token came to exist.
    pub kind: TokKind,
    /// Minting opcode mnemonic source, absent for frame-entry tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opcode: Option<Opcode>,
    /// Code object of the minting event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_id: Option<CodeId>,
    /// Instruction index of the minting event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instr_offset: Option<u32>,
    /// Source line of the minting event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Opaque-call metadata for external roots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<(String, crate::host::SigHash)>,
}

/// One node of a back-walk result.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ProvenanceNode {
    /// Token metadata.
    #[serde(flatten)]
    pub info: TokInfo,
    /// Distance from the queried token.
    pub depth: u32,
    /// Parent tokens (empty at roots and at the depth limit).
    pub parents: Vec<Tok>,
}

fn build_frame_spans(threads: &BTreeMap<u16, ThreadStream>) -> BTreeMap<FrameOrd, FrameSpan> {
    let mut spans = BTreeMap::new();
    for stream in threads.values() {
        for event in &stream.events {
            match event {
                TraceEvent::Enter(e) => {
                    spans.insert(
                        e.frame_ord,
                        FrameSpan {
                            frame_ord: e.frame_ord,
                            code_id: e.code_id,
                            parent: e.parent,
                            entry_counter: e.counter,
                            exit_counter: None,
                        },
                    );
                }
                TraceEvent::Instr(e) => {
                    let exits = matches!(
                        e.opcode.class(),
                        ProvClass::Ret | ProvClass::Unwind if e.opcode != Opcode::PushExc
                    );
                    if exits {
                        if let Some(span) = spans.get_mut(&e.frame_ord) {
                            span.exit_counter = Some(e.counter);
                        }
                    }
                }
                TraceEvent::Abort(_) => {}
            }
        }
    }
    spans
}

/// One live frame in a reconstructed state.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveFrame {
    /// Frame ordinal.
    pub frame_ord: FrameOrd,
    /// Code object the frame executes.
    pub code_id: CodeId,
    /// Caller frame.
    pub parent: Option<FrameOrd>,
    /// Counter of the frame's enter event.
    pub entry_counter: u64,
    /// Instruction index of the frame's most recent event.
    pub last_offset: Option<u32>,
    /// Current bindings: name id to token and last written display form.
    pub locals: BTreeMap<NameId, (Tok, Option<Box<str>>)>,
}

#[derive(Clone, Debug, Default)]
struct CursorState {
    position: u64,
    applied: u64,
    frames: Vec<LiveFrame>,
    globals: BTreeMap<NameId, (Tok, Option<Box<str>>)>,
    aborted: Option<Box<str>>,
}

impl CursorState {
    fn apply_binding(&mut self, b: &Binding) {
        match b.scope {
            BindingScope::Local => {
                if let Some(f) = self.frames.last_mut() {
                    f.locals.insert(b.name, (b.tok, b.repr.clone()));
                }
            }
            BindingScope::Global => {
                self.globals.insert(b.name, (b.tok, b.repr.clone()));
            }
        }
    }

    fn apply(&mut self, event: &TraceEvent) {
        match event {
            TraceEvent::Enter(e) => {
                let mut frame = LiveFrame {
                    frame_ord: e.frame_ord,
                    code_id: e.code_id,
                    parent: e.parent,
                    entry_counter: e.counter,
                    last_offset: None,
                    locals: BTreeMap::new(),
                };
                for w in &e.writes {
                    frame.locals.insert(w.name, (w.tok, w.repr.clone()));
                }
                self.frames.push(frame);
            }
            TraceEvent::Instr(e) => {
                if let Some(f) = self
                    .frames
                    .iter_mut()
                    .rev()
                    .find(|f| f.frame_ord == e.frame_ord)
                {
                    f.last_offset = Some(e.instr_offset);
                }
                for w in &e.writes {
                    self.apply_binding(w);
                }
                let exits = (e.opcode.class() == ProvClass::Ret && !e.fault)
                    || e.opcode == Opcode::Reraise;
                if exits {
                    self.frames.pop();
                }
            }
            TraceEvent::Abort(e) => {
                self.aborted = Some(e.reason.clone());
            }
        }
        self.position = event.counter();
        self.applied += 1;
    }
}

/// Mutable replay state over one thread of a shared [`Trace`].
#[derive(Debug)]
pub struct ReplayCursor {
    trace: Arc<Trace>,
    thread_id: u16,
    state: CursorState,
    snapshots: Vec<CursorState>,
}

impl ReplayCursor {
    /// Creates a cursor over `thread_id` positioned before the first event.
    pub fn new(trace: Arc<Trace>, thread_id: u16) -> Self {
        Self {
            trace,
            thread_id,
            state: CursorState::default(),
            snapshots: Vec::new(),
        }
    }

    /// The counter the cursor is positioned at.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.state.position
    }

    /// The abort reason, if the stream ended early at or before the cursor.
    #[must_use]
    pub fn abort_reason(&self) -> Option<&str> {
        self.state.aborted.as_deref()
    }

    /// Moves to `counter`: all events with `event.counter <= counter` are
    /// applied. Backward seeks restart from the nearest cached snapshot.
    ///
    /// Returns the counter actually reached (the end of the stream if
    /// `counter` lies beyond it).
    pub fn seek(&mut self, counter: u64) -> Result<u64, ReplayError> {
        if counter < self.state.position {
            let snap_ix = self
                .snapshots
                .iter()
                .rposition(|s| s.position <= counter);
            self.state = match snap_ix {
                Some(i) => {
                    let keep = i + 1;
                    self.snapshots.truncate(keep);
                    self.snapshots[i].clone()
                }
                None => {
                    self.snapshots.clear();
                    CursorState::default()
                }
            };
        }
        let stream = self
            .trace
            .threads
            .get(&self.thread_id)
            .ok_or(ReplayError::CounterOutOfRange {
                thread_id: self.thread_id,
                counter,
            })?;
        let start_ix = stream
            .events
            .partition_point(|e| e.counter() <= self.state.position);
        for event in &stream.events[start_ix..] {
            if event.counter() > counter {
                break;
            }
            self.state.apply(event);
            if self.state.applied % SNAPSHOT_STRIDE == 0 {
                self.snapshots.push(self.state.clone());
            }
        }
        Ok(self.state.position)
    }

    /// Returns the live frames at the cursor position, innermost first.
    #[must_use]
    pub fn frames(&self) -> Vec<&LiveFrame> {
        self.state.frames.iter().rev().collect()
    }

    /// Returns the module-level bindings at the cursor position.
    #[must_use]
    pub fn globals(&self) -> &BTreeMap<NameId, (Tok, Option<Box<str>>)> {
        &self.state.globals
    }

    /// Returns the live frame with ordinal `frame_ord`.
    pub fn frame(&self, frame_ord: FrameOrd) -> Result<&LiveFrame, ReplayError> {
        self.state
            .frames
            .iter()
            .find(|f| f.frame_ord == frame_ord)
            .ok_or(ReplayError::FrameNotLive {
                frame_ord,
                counter: self.state.position,
            })
    }

    /// The shared trace this cursor reads.
    #[must_use]
    pub fn trace(&self) -> &Arc<Trace> {
        &self.trace
    }

    /// The thread this cursor replays.
    #[must_use]
    pub fn thread_id(&self) -> u16 {
        self.thread_id
    }
}
