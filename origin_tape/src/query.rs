// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Session-keyed query façade over replay.
//!
//! Every operation is synchronous, read-only and returns a serializable
//! record the outer shell can forward verbatim. Sessions opened on the same
//! canonical path share one decoded [`Trace`] through reference counting.
//!
//! Counter-taking operations interpret the counter on the trace's main
//! thread (the lowest recorded thread id). `search_variables` matches only
//! bindings live at the session's current counter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use regex_automata::meta::Regex;
use regex_automata::util::syntax;
use serde::Serialize;
use thiserror::Error;

use crate::program::CodeId;
use crate::replay::{LiveFrame, ProvenanceNode, ReplayCursor, ReplayError, Trace};
use crate::token::{FrameOrd, Tok};

/// Default `max_depth` for [`QueryService::trace_provenance`].
pub const DEFAULT_BACK_WALK_DEPTH: u32 = 32;

/// Handle to an open trace session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

/// A query failure.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The session id is unknown (never opened, or already closed).
    #[error("unknown session {0:?}")]
    UnknownSession(SessionId),
    /// Replay failed (missing counters/tokens/frames surface here).
    #[error(transparent)]
    Replay(#[from] ReplayError),
    /// The search pattern did not compile.
    #[error("invalid pattern: {0}")]
    Pattern(String),
    /// The queried code id is not in the trace's code table.
    #[error("unknown code id {0}")]
    UnknownCode(u32),
    /// The recorded source file could not be read.
    #[error("failed to read source {path}: {error}")]
    Source {
        /// Recorded source path.
        path: String,
        /// Underlying I/O failure.
        error: std::io::Error,
    },
}

/// Result of [`QueryService::open_trace`].
#[derive(Clone, Debug, Serialize)]
pub struct OpenRecord {
    /// Session handle for subsequent operations.
    pub session_id: SessionId,
    /// Trace file path.
    pub path: String,
    /// Recorded thread count.
    pub thread_count: u16,
    /// Total decoded events.
    pub event_count: u64,
    /// The writer marked the file truncated-by-corruption.
    pub truncated: bool,
    /// Creation timestamp, nanoseconds since the Unix epoch.
    pub created_ns: u64,
}

/// Result of [`QueryService::run_to_instruction`].
#[derive(Clone, Debug, Serialize)]
pub struct RunToRecord {
    /// Counter actually reached (end of stream if the target lies beyond).
    pub stopped_at: u64,
    /// Requested counter.
    pub target: u64,
    /// Live frames at the stop point.
    pub frame_count: usize,
    /// Abort reason if the stream ended early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

/// One frame in a [`QueryService::list_frames_at_step`] result.
#[derive(Clone, Debug, Serialize)]
pub struct FrameRecord {
    /// Frame ordinal.
    pub frame_ord: FrameOrd,
    /// Code id the frame executes.
    pub code_id: CodeId,
    /// Function name from the code table.
    pub function: String,
    /// Source path from the code table.
    pub source_path: String,
    /// Source line of the frame's most recent instruction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Counter of the frame's enter event.
    pub entry_counter: u64,
    /// Counter of the frame's exit event, if it ever exited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_counter: Option<u64>,
    /// Caller frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<FrameOrd>,
}

/// One binding in an [`QueryService::inspect_stack`] result.
#[derive(Clone, Debug, Serialize)]
pub struct LocalRecord {
    /// Variable name.
    pub name: String,
    /// Current token.
    pub tok: Tok,
    /// Counter at which the binding's token was minted.
    pub counter: u64,
    /// Display form captured at write time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repr: Option<String>,
}

/// Result of [`QueryService::inspect_stack`].
#[derive(Clone, Debug, Serialize)]
pub struct LocalsRecord {
    /// Inspected frame.
    pub frame_ord: FrameOrd,
    /// Counter the frame was inspected at.
    pub counter: u64,
    /// Bindings, sorted by name.
    pub locals: Vec<LocalRecord>,
}

/// Result of [`QueryService::trace_provenance`].
#[derive(Clone, Debug, Serialize)]
pub struct ProvenanceRecord {
    /// Queried token.
    pub tok: Tok,
    /// Depth limit applied.
    pub max_depth: u32,
    /// Visited nodes, queried token first.
    pub nodes: Vec<ProvenanceNode>,
}

/// One match of [`QueryService::search_variables`].
#[derive(Clone, Debug, Serialize)]
pub struct VariableMatch {
    /// Counter at which the binding's token was minted.
    pub counter: u64,
    /// Owning frame (the root frame's ordinal for module-level bindings).
    pub frame_ord: FrameOrd,
    /// Variable name.
    pub name: String,
    /// Current token.
    pub tok: Tok,
    /// Display form captured at write time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repr: Option<String>,
}

/// One line of a [`QueryService::get_source`] result.
#[derive(Clone, Debug, Serialize)]
pub struct SourceLine {
    /// One-based line number.
    pub line: u32,
    /// Line content without the trailing newline.
    pub content: String,
    /// `true` for the requested line.
    pub current: bool,
}

/// Result of [`QueryService::get_source`].
#[derive(Clone, Debug, Serialize)]
pub struct SourceRecord {
    /// Resolved source path.
    pub path: String,
    /// Requested line.
    pub target_line: u32,
    /// Context lines.
    pub lines: Vec<SourceLine>,
}

/// Result of [`QueryService::execution_summary`].
#[derive(Clone, Debug, Serialize)]
pub struct SummaryRecord {
    /// Trace file path.
    pub path: String,
    /// Current cursor counter.
    pub position: u64,
    /// Recorded thread ids.
    pub thread_ids: Vec<u16>,
    /// Total decoded events.
    pub event_count: u64,
    /// Highest counter on the main thread.
    pub max_counter: u64,
    /// Code objects in the code table.
    pub code_count: usize,
    /// The writer marked the file truncated-by-corruption.
    pub truncated: bool,
    /// Abort reason if the stream ended early at or before the cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

/// One entry of [`QueryService::list_sessions`].
#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    /// Session handle.
    pub session_id: SessionId,
    /// Trace file path.
    pub path: String,
    /// Current cursor counter.
    pub position: u64,
}

struct Session {
    trace: Arc<Trace>,
    cursor: Mutex<ReplayCursor>,
}

/// Session registry and query operations.
///
/// All operations take `&self`; the registry and per-session cursors are
/// internally locked, so concurrent readers are safe.
#[derive(Default)]
pub struct QueryService {
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    shared: Mutex<HashMap<PathBuf, Weak<Trace>>>,
    next_session: AtomicU64,
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService")
            .field("sessions", &self.sessions.read().len())
            .finish_non_exhaustive()
    }
}

impl QueryService {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self, id: SessionId) -> Result<Arc<Session>, QueryError> {
        self.sessions
            .read()
            .get(&id.0)
            .cloned()
            .ok_or(QueryError::UnknownSession(id))
    }

    fn load_shared(&self, path: &Path) -> Result<Arc<Trace>, QueryError> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let mut shared = self.shared.lock();
        if let Some(existing) = shared.get(&canonical).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let trace = Arc::new(Trace::open(&canonical)?);
        shared.insert(canonical, Arc::downgrade(&trace));
        Ok(trace)
    }

    /// Opens the trace at `path` and registers a session for it.
    pub fn open_trace(&self, path: &Path) -> Result<OpenRecord, QueryError> {
        let trace = self.load_shared(path)?;
        let main = trace.main_thread()?;
        let cursor = ReplayCursor::new(trace.clone(), main);
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed) + 1);
        let record = OpenRecord {
            session_id: id,
            path: trace.path.display().to_string(),
            thread_count: trace.header.thread_count,
            event_count: trace.event_count(),
            truncated: trace.is_truncated(),
            created_ns: trace.header.created_ns,
        };
        self.sessions.write().insert(
            id.0,
            Arc::new(Session {
                trace,
                cursor: Mutex::new(cursor),
            }),
        );
        tracing::debug!(session = id.0, path = %record.path, "trace opened");
        Ok(record)
    }

    /// Closes a session. The underlying trace stays loaded while other
    /// sessions still reference it.
    pub fn close_trace(&self, id: SessionId) -> Result<(), QueryError> {
        self.sessions
            .write()
            .remove(&id.0)
            .map(|_| ())
            .ok_or(QueryError::UnknownSession(id))
    }

    /// Moves the session's cursor to `counter` (clamped to the end of the
    /// stream).
    pub fn run_to_instruction(
        &self,
        id: SessionId,
        counter: u64,
    ) -> Result<RunToRecord, QueryError> {
        let session = self.session(id)?;
        let mut cursor = session.cursor.lock();
        let stopped_at = cursor.seek(counter)?;
        Ok(RunToRecord {
            stopped_at,
            target: counter,
            frame_count: cursor.frames().len(),
            aborted: cursor.abort_reason().map(str::to_string),
        })
    }

    fn seek_exact(cursor: &mut ReplayCursor, counter: u64) -> Result<(), QueryError> {
        let reached = cursor.seek(counter)?;
        if reached < counter {
            return Err(QueryError::Replay(ReplayError::CounterOutOfRange {
                thread_id: cursor.thread_id(),
                counter,
            }));
        }
        Ok(())
    }

    fn frame_record(trace: &Trace, frame: &LiveFrame) -> FrameRecord {
        let entry = trace.code_table.entry(frame.code_id);
        let line = entry.and_then(|e| frame.last_offset.and_then(|off| e.line_at(off)));
        FrameRecord {
            frame_ord: frame.frame_ord,
            code_id: frame.code_id,
            function: entry.map_or_else(|| "?".to_string(), |e| e.name.clone()),
            source_path: entry.map_or_else(String::new, |e| e.source_path.clone()),
            line,
            entry_counter: frame.entry_counter,
            exit_counter: trace
                .frame_span(frame.frame_ord)
                .and_then(|s| s.exit_counter),
            parent: frame.parent,
        }
    }

    /// Lists the live frames at `counter`, innermost first.
    pub fn list_frames_at_step(
        &self,
        id: SessionId,
        counter: u64,
    ) -> Result<Vec<FrameRecord>, QueryError> {
        let session = self.session(id)?;
        let mut cursor = session.cursor.lock();
        Self::seek_exact(&mut cursor, counter)?;
        Ok(cursor
            .frames()
            .into_iter()
            .map(|f| Self::frame_record(&session.trace, f))
            .collect())
    }

    /// Materializes the locals of `frame_ord` at `counter`.
    pub fn inspect_stack(
        &self,
        id: SessionId,
        frame_ord: FrameOrd,
        counter: u64,
    ) -> Result<LocalsRecord, QueryError> {
        let session = self.session(id)?;
        let mut cursor = session.cursor.lock();
        Self::seek_exact(&mut cursor, counter)?;
        let frame = cursor.frame(frame_ord)?;
        let entry = session.trace.code_table.entry(frame.code_id);
        let mut locals: Vec<LocalRecord> = frame
            .locals
            .iter()
            .map(|(name, (tok, repr))| LocalRecord {
                name: entry
                    .and_then(|e| e.local_name(*name))
                    .map_or_else(|| format!("local_{}", name.0), str::to_string),
                tok: *tok,
                counter: tok.counter(),
                repr: repr.as_deref().map(str::to_string),
            })
            .collect();
        locals.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(LocalsRecord {
            frame_ord,
            counter,
            locals,
        })
    }

    /// Walks provenance from `tok` back to its roots.
    pub fn trace_provenance(
        &self,
        id: SessionId,
        tok: Tok,
        max_depth: Option<u32>,
    ) -> Result<ProvenanceRecord, QueryError> {
        let session = self.session(id)?;
        let max_depth = max_depth.unwrap_or(DEFAULT_BACK_WALK_DEPTH);
        let nodes = session.trace.back_walk(tok, max_depth)?;
        Ok(ProvenanceRecord {
            tok,
            max_depth,
            nodes,
        })
    }

    /// Searches bindings live at the session's current counter whose name
    /// matches `pattern` (case-insensitive regex).
    pub fn search_variables(
        &self,
        id: SessionId,
        pattern: &str,
    ) -> Result<Vec<VariableMatch>, QueryError> {
        let regex = Regex::builder()
            .syntax(syntax::Config::new().case_insensitive(true))
            .build(pattern)
            .map_err(|e| QueryError::Pattern(e.to_string()))?;
        let session = self.session(id)?;
        let cursor = session.cursor.lock();
        let trace = &session.trace;

        let mut matches = Vec::new();
        for frame in cursor.frames() {
            let entry = trace.code_table.entry(frame.code_id);
            for (name_id, (tok, repr)) in &frame.locals {
                let name = entry
                    .and_then(|e| e.local_name(*name_id))
                    .map_or_else(|| format!("local_{}", name_id.0), str::to_string);
                if regex.is_match(&name) {
                    matches.push(VariableMatch {
                        counter: tok.counter(),
                        frame_ord: frame.frame_ord,
                        name,
                        tok: *tok,
                        repr: repr.as_deref().map(str::to_string),
                    });
                }
            }
        }
        let root_ord = cursor
            .frames()
            .last()
            .map_or_else(|| FrameOrd::new(cursor.thread_id(), 0), |f| f.frame_ord);
        for (name_id, (tok, repr)) in cursor.globals() {
            let name = trace
                .code_table
                .global_name(*name_id)
                .map_or_else(|| format!("global_{}", name_id.0), str::to_string);
            if regex.is_match(&name) {
                matches.push(VariableMatch {
                    counter: tok.counter(),
                    frame_ord: root_ord,
                    name,
                    tok: *tok,
                    repr: repr.as_deref().map(str::to_string),
                });
            }
        }
        matches.sort_by(|a, b| a.counter.cmp(&b.counter).then(a.name.cmp(&b.name)));
        Ok(matches)
    }

    /// Returns `context` lines around `line` of the source recorded for
    /// `code_id`.
    pub fn get_source(
        &self,
        id: SessionId,
        code_id: CodeId,
        line: u32,
        context: u32,
    ) -> Result<SourceRecord, QueryError> {
        let session = self.session(id)?;
        let entry = session
            .trace
            .code_table
            .entry(code_id)
            .ok_or(QueryError::UnknownCode(code_id.0))?;
        let path = entry.source_path.clone();
        let text = std::fs::read_to_string(&path).map_err(|error| QueryError::Source {
            path: path.clone(),
            error,
        })?;
        let all: Vec<&str> = text.lines().collect();
        let start = line.saturating_sub(context + 1) as usize;
        let end = ((line + context) as usize).min(all.len());
        let lines = all
            .get(start..end)
            .unwrap_or(&[])
            .iter()
            .enumerate()
            .map(|(i, content)| {
                let n = (start + i + 1) as u32;
                SourceLine {
                    line: n,
                    content: (*content).to_string(),
                    current: n == line,
                }
            })
            .collect();
        Ok(SourceRecord {
            path,
            target_line: line,
            lines,
        })
    }

    /// Summarizes a session's trace and cursor state.
    pub fn execution_summary(&self, id: SessionId) -> Result<SummaryRecord, QueryError> {
        let session = self.session(id)?;
        let cursor = session.cursor.lock();
        let trace = &session.trace;
        let main = trace.main_thread()?;
        Ok(SummaryRecord {
            path: trace.path.display().to_string(),
            position: cursor.position(),
            thread_ids: trace.thread_ids(),
            event_count: trace.event_count(),
            max_counter: trace.max_counter(main).unwrap_or(0),
            code_count: trace.code_table.entries.len(),
            truncated: trace.is_truncated(),
            aborted: cursor.abort_reason().map(str::to_string),
        })
    }

    /// Lists all open sessions.
    #[must_use]
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read();
        let mut out: Vec<SessionSummary> = sessions
            .iter()
            .map(|(id, s)| SessionSummary {
                session_id: SessionId(*id),
                path: s.trace.path.display().to_string(),
                position: s.cursor.lock().position(),
            })
            .collect();
        out.sort_by_key(|s| s.session_id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_session_is_reported() {
        let svc = QueryService::new();
        let err = svc.run_to_instruction(SessionId(9), 1).unwrap_err();
        assert!(matches!(err, QueryError::UnknownSession(SessionId(9))));
    }

    #[test]
    fn bad_pattern_is_reported() {
        let svc = QueryService::new();
        // Pattern validation happens before session lookup.
        let err = svc.search_variables(SessionId(1), "(unclosed").unwrap_err();
        assert!(matches!(err, QueryError::Pattern(_)));
    }
}
