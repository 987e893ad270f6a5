// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The instrumented-evaluator core.
//!
//! A [`Recorder`] shadows one guest thread: it counts every observable
//! opcode, keeps the shadow token stack in lock-step with the operand stack,
//! mints tokens, emits log events and drives the stepping callback. The host
//! evaluator calls into it at every opcode boundary and never advances
//! without it.
//!
//! Recorder failures are fatal to the recording session but never to the
//! guest process: the evaluator surfaces them to its caller and stops
//! recording. Invariant violations name the tripped invariant so the first
//! failing opcode is identifiable from the log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::config::RecorderConfig;
use crate::event::{AbortEvent, Binding, BindingScope, EnterEvent, ExternalCall, InstructionEvent, TraceEvent};
use crate::frame::{FrameShadow, ShadowPool, ShadowUnderflow};
use crate::host::SigHash;
use crate::opcode::{Opcode, ProvClass};
use crate::program::{CodeId, CodeObject, NameId};
use crate::thread::ThreadContext;
use crate::token::Tok;
use crate::writer::{TraceWriter, WriteError};

/// A recording invariant. Violating any of these corrupts the trace, so the
/// session aborts and the file is marked truncated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Invariant {
    /// Per-thread counters advance by exactly one per event.
    CounterDensity,
    /// Shadow stack depth equals operand stack depth at opcode boundaries.
    ShadowDepth,
    /// Consumed tokens come from the top of the same frame's shadow stack.
    ConsumedTopOfStack,
    /// Written tokens are minted in the same event or re-bound by copies.
    WriteMinting,
    /// Frame entries and exits balance; parents precede children.
    FrameBalance,
}

impl Invariant {
    /// Stable name used in logs and abort reasons.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CounterDensity => "counter-density",
            Self::ShadowDepth => "shadow-depth",
            Self::ConsumedTopOfStack => "consumed-top-of-stack",
            Self::WriteMinting => "write-minting",
            Self::FrameBalance => "frame-balance",
        }
    }
}

impl std::fmt::Display for Invariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A stepping-callback failure. Aborts the session and closes the log.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

/// A recording failure.
#[derive(Debug, Error)]
pub enum RecordError {
    /// A recording invariant was violated; the trace is marked truncated.
    #[error("trace corruption: invariant {invariant} violated: {detail}")]
    Corruption {
        /// The tripped invariant.
        invariant: Invariant,
        /// Human-readable context.
        detail: String,
    },
    /// The log writer failed; buffered events are dropped.
    #[error(transparent)]
    Write(#[from] WriteError),
    /// Recording was cancelled cooperatively.
    #[error("recording cancelled")]
    Cancelled,
    /// Recording was refused in a forked child.
    #[error("recording refused in forked child")]
    ForkedChild,
    /// The stepping callback failed.
    #[error("stepping callback failed: {0}")]
    Callback(#[from] CallbackError),
    /// The recorder already aborted and cannot record further events.
    #[error("recording session is dead")]
    SessionDead,
}

/// Cooperative cancellation flag, checked at every opcode boundary.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The stepping callback: runs in the recorder's context with the guest
/// paused, and returns the next counter to fire at (`None` disarms).
pub type StepCallback =
    Box<dyn FnMut(&ThreadContext) -> Result<Option<u64>, CallbackError> + Send>;

/// Static description of one executed opcode, provided by the evaluator.
#[derive(Copy, Clone, Debug)]
pub struct StepInfo {
    /// The opcode.
    pub opcode: Opcode,
    /// Its argument.
    pub arg: u32,
    /// Code object of the executing frame.
    pub code_id: CodeId,
    /// Instruction index within the code object.
    pub instr_offset: u32,
}

/// What the opcode did, beyond what the table already knows.
#[derive(Debug)]
pub enum StepOutcome<'a> {
    /// The opcode completed with its table-declared stack effect.
    Normal,
    /// A store completed; `repr` is the bounded display form of the value.
    Store {
        /// Display form captured at write time.
        repr: Box<str>,
    },
    /// A call entered an instrumented callee; the recorder logs the call and
    /// the frame entry.
    CallEnter {
        /// Callee code id.
        code_id: CodeId,
        /// Callee code object (for parameter names and registration).
        code: &'a CodeObject,
        /// Display forms of the arguments, in parameter order.
        arg_reprs: Vec<Box<str>>,
    },
    /// A call went to an opaque host callable and returned; the result is a
    /// fresh external root.
    CallOpaque {
        /// Fully-qualified callee name.
        symbol: &'a str,
        /// Hash over callee name and argument types.
        sig_hash: SigHash,
    },
    /// The frame's return opcode completed.
    Return,
    /// The opcode raised a guest exception. `produced` stays empty and the
    /// exception value carries the event's token.
    Fault,
}

/// Tokens handed back to the evaluator after a recorded step.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StepEffect {
    /// The exception token, when the step faulted.
    pub exc_tok: Option<Tok>,
}

/// Per-thread recording state: the instrumented evaluator's shadow half.
pub struct Recorder {
    ctx: ThreadContext,
    writer: Arc<TraceWriter>,
    frames: Vec<FrameShadow>,
    pool: ShadowPool,
    globals: Vec<Tok>,
    callback: Option<StepCallback>,
    cancel: CancelToken,
    debug: bool,
    dead: bool,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("thread_id", &self.ctx.thread_id())
            .field("counter", &self.ctx.counter())
            .field("frames", &self.frames.len())
            .field("dead", &self.dead)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Creates a recorder for `thread_id` appending through `writer`.
    #[must_use]
    pub fn new(writer: Arc<TraceWriter>, thread_id: u16, config: &RecorderConfig) -> Self {
        Self {
            ctx: ThreadContext::new(thread_id, config.callback_at),
            writer,
            frames: Vec::new(),
            pool: ShadowPool::new(),
            globals: Vec::new(),
            callback: None,
            cancel: CancelToken::new(),
            debug: config.debug,
            dead: false,
        }
    }

    /// Installs the stepping callback.
    pub fn set_callback(&mut self, callback: StepCallback) {
        self.callback = Some(callback);
    }

    /// Returns a handle that cancels this recording from another thread.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Read access to the thread context (counters, callback threshold).
    #[must_use]
    pub fn ctx(&self) -> &ThreadContext {
        &self.ctx
    }

    /// Shadow stack depth of the current frame.
    #[must_use]
    pub fn shadow_depth(&self) -> usize {
        self.frames.last().map_or(0, FrameShadow::depth)
    }

    fn corrupt(&mut self, invariant: Invariant, detail: String) -> RecordError {
        tracing::error!(invariant = invariant.name(), %detail, "recording invariant violated");
        self.writer.mark_truncated();
        // Best effort: leave the reason in the stream so replay can point at
        // the first bad opcode.
        let abort = TraceEvent::Abort(AbortEvent {
            counter: self.ctx.counter() + 1,
            thread_id: self.ctx.thread_id(),
            reason: invariant.name().into(),
        });
        let _ = self.writer.append(&abort);
        let _ = self.writer.flush_thread(self.ctx.thread_id());
        self.dead = true;
        RecordError::Corruption { invariant, detail }
    }

    fn underflow(&mut self, e: ShadowUnderflow) -> RecordError {
        self.corrupt(Invariant::ShadowDepth, e.to_string())
    }

    fn pop_shadow(&mut self) -> Result<Tok, RecordError> {
        let res = self.frames.last_mut().expect("frame checked").pop();
        res.map_err(|e| self.underflow(e))
    }

    fn pop_shadow_n(&mut self, n: usize) -> Result<Vec<Tok>, RecordError> {
        let res = self.frames.last_mut().expect("frame checked").pop_n(n);
        res.map_err(|e| self.underflow(e))
    }

    fn dup_shadow(&mut self, depth: usize) -> Result<Tok, RecordError> {
        let res = self.frames.last_mut().expect("frame checked").dup(depth);
        res.map_err(|e| self.underflow(e))
    }

    fn swap_shadow(&mut self, depth: usize) -> Result<(), RecordError> {
        let res = self.frames.last_mut().expect("frame checked").swap(depth);
        res.map_err(|e| self.underflow(e))
    }

    fn drop_shadow_to(&mut self, depth: usize) -> Result<Vec<Tok>, RecordError> {
        let res = self.frames.last_mut().expect("frame checked").drop_to(depth);
        res.map_err(|e| self.underflow(e))
    }

    fn push_shadow(&mut self, tok: Tok) {
        self.frames.last_mut().expect("frame checked").push(tok);
    }

    fn append(&mut self, event: TraceEvent) -> Result<(), RecordError> {
        match self.writer.append(&event) {
            Ok(()) => Ok(()),
            Err(WriteError::ForkedChild) => {
                tracing::warn!("recording refused in forked child");
                self.dead = true;
                Err(RecordError::ForkedChild)
            }
            Err(e) => {
                self.dead = true;
                Err(e.into())
            }
        }
    }

    fn ensure_alive(&self) -> Result<(), RecordError> {
        if self.dead {
            Err(RecordError::SessionDead)
        } else {
            Ok(())
        }
    }

    /// Checks the cancellation flag; called at every opcode boundary.
    ///
    /// On cancellation emits a final `aborted` event and kills the session.
    pub fn check_cancelled(&mut self) -> Result<(), RecordError> {
        if !self.cancel.is_cancelled() || self.dead {
            return Ok(());
        }
        let counter = self.ctx.advance();
        let event = TraceEvent::Abort(AbortEvent {
            counter,
            thread_id: self.ctx.thread_id(),
            reason: "cancelled".into(),
        });
        self.append(event)?;
        self.writer.flush_thread(self.ctx.thread_id())?;
        self.dead = true;
        Err(RecordError::Cancelled)
    }

    /// Verifies the shadow stack depth against the evaluator's operand stack
    /// depth at an opcode boundary.
    pub fn verify_depth(&mut self, value_depth: usize) -> Result<(), RecordError> {
        let shadow = self.shadow_depth();
        if shadow == value_depth {
            return Ok(());
        }
        Err(self.corrupt(
            Invariant::ShadowDepth,
            format!("shadow depth {shadow} != value depth {value_depth}"),
        ))
    }

    /// Enters the root frame of this thread.
    pub fn enter_root(&mut self, code_id: CodeId, code: &CodeObject) -> Result<(), RecordError> {
        self.ensure_alive()?;
        if !self.frames.is_empty() {
            return Err(self.corrupt(
                Invariant::FrameBalance,
                "root frame entered twice".to_string(),
            ));
        }
        self.writer.register_code(code_id, code);
        let counter = self.ctx.advance();
        let frame_ord = self.ctx.next_frame_ord();
        let shadow = self.pool.acquire(frame_ord, code_id, counter);
        self.frames.push(shadow);
        let event = TraceEvent::Enter(EnterEvent {
            counter,
            frame_ord,
            thread_id: self.ctx.thread_id(),
            code_id,
            parent: None,
            args: Vec::new(),
            writes: Vec::new(),
        });
        if self.debug {
            tracing::debug!(counter, code_id = code_id.0, "enter root frame");
        }
        self.append(event)
    }

    fn read_binding(&self, scope: BindingScope, name: NameId) -> Tok {
        match scope {
            BindingScope::Local => self
                .frames
                .last()
                .map_or(Tok::NONE, |f| f.local(name)),
            BindingScope::Global => self
                .globals
                .get(name.0 as usize)
                .copied()
                .unwrap_or(Tok::NONE),
        }
    }

    fn write_binding(&mut self, scope: BindingScope, name: NameId, tok: Tok) {
        match scope {
            BindingScope::Local => {
                if let Some(f) = self.frames.last_mut() {
                    f.set_local(name, tok);
                }
            }
            BindingScope::Global => {
                let ix = name.0 as usize;
                if ix >= self.globals.len() {
                    self.globals.resize(ix + 1, Tok::NONE);
                }
                self.globals[ix] = tok;
            }
        }
    }

    /// Records one executed opcode.
    ///
    /// The evaluator has already performed the opcode's semantics; the shadow
    /// stack still holds the pre-step state, so the consumed snapshot taken
    /// here matches what the opcode saw.
    pub fn record_step(
        &mut self,
        info: StepInfo,
        outcome: StepOutcome<'_>,
    ) -> Result<StepEffect, RecordError> {
        self.ensure_alive()?;
        if self.frames.is_empty() {
            return Err(self.corrupt(
                Invariant::FrameBalance,
                format!("opcode {} outside any frame", info.opcode.name()),
            ));
        }

        let counter = self.ctx.advance();
        let thread_id = self.ctx.thread_id();
        let effect_decl = info.opcode.stack_effect(info.arg);
        let frame_ord = self.frames.last().map(|f| f.frame_ord).expect("non-empty");

        let mut event = InstructionEvent {
            counter,
            frame_ord,
            thread_id,
            opcode: info.opcode,
            arg: info.arg,
            code_id: info.code_id,
            instr_offset: info.instr_offset,
            fault: false,
            consumed: Vec::new(),
            produced: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            ext: None,
        };
        let mut step_effect = StepEffect::default();
        let mut entered: Option<TraceEvent> = None;
        let mut frame_returned = false;

        let class = info.opcode.class();
        if matches!(&outcome, StepOutcome::Fault) || class == ProvClass::Raise {
            // The opcode's products never materialized; the exception value
            // carries this event's token instead.
            event.consumed = self.pop_shadow_n(effect_decl.pops as usize)?;
            event.fault = true;
            step_effect.exc_tok = Some(Tok::mint(thread_id, counter));
        } else {
            match (class, outcome) {
                (ProvClass::Copy, _) => {
                    let tok = self.dup_shadow(info.arg as usize)?;
                    event.produced.push(tok);
                }
                (ProvClass::Swap, _) => {
                    self.swap_shadow(info.arg as usize)?;
                }
                (ProvClass::LoadConst, _) => {
                    let tok = Tok::mint(thread_id, counter);
                    self.push_shadow(tok);
                    event.produced.push(tok);
                }
                (ProvClass::LoadBinding, _) => {
                    let scope = if info.opcode == Opcode::LoadGlobal {
                        BindingScope::Global
                    } else {
                        BindingScope::Local
                    };
                    let name = NameId(info.arg);
                    let old = self.read_binding(scope, name);
                    let tok = Tok::mint(thread_id, counter);
                    self.push_shadow(tok);
                    event.reads.push(Binding {
                        scope,
                        name,
                        tok: old,
                        repr: None,
                    });
                    event.produced.push(tok);
                }
                (ProvClass::StoreBinding, outcome) => {
                    let repr = match outcome {
                        StepOutcome::Store { repr } => Some(repr),
                        _ => None,
                    };
                    let scope = if info.opcode == Opcode::StoreGlobal {
                        BindingScope::Global
                    } else {
                        BindingScope::Local
                    };
                    let name = NameId(info.arg);
                    let consumed = self.pop_shadow()?;
                    let tok = Tok::mint(thread_id, counter);
                    self.write_binding(scope, name, tok);
                    event.consumed.push(consumed);
                    event.writes.push(Binding {
                        scope,
                        name,
                        tok,
                        repr,
                    });
                }
                (
                    ProvClass::Call,
                    StepOutcome::CallEnter {
                        code_id,
                        code,
                        arg_reprs,
                    },
                ) => {
                    let consumed = self.pop_shadow_n(effect_decl.pops as usize)?;
                    let arg_toks: Vec<Tok> = consumed[1..].to_vec();
                    event.consumed = consumed;

                    self.writer.register_code(code_id, code);
                    let enter_counter = self.ctx.advance();
                    let child_ord = self.ctx.next_frame_ord();
                    let mut shadow = self.pool.acquire(child_ord, code_id, enter_counter);
                    // Parameters re-bind the argument tokens (copy
                    // semantics): a parameter read chains straight to the
                    // value the caller passed.
                    let mut writes = Vec::with_capacity(arg_toks.len());
                    for (i, &tok) in arg_toks.iter().enumerate() {
                        let name = NameId(i as u32);
                        shadow.set_local(name, tok);
                        writes.push(Binding {
                            scope: BindingScope::Local,
                            name,
                            tok,
                            repr: arg_reprs.get(i).cloned(),
                        });
                    }
                    self.frames.push(shadow);
                    entered = Some(TraceEvent::Enter(EnterEvent {
                        counter: enter_counter,
                        frame_ord: child_ord,
                        thread_id,
                        code_id,
                        parent: Some(frame_ord),
                        args: arg_toks,
                        writes,
                    }));
                }
                (ProvClass::Call, StepOutcome::CallOpaque { symbol, sig_hash }) => {
                    let consumed = self.pop_shadow_n(effect_decl.pops as usize)?;
                    let tok = Tok::mint(thread_id, counter);
                    self.push_shadow(tok);
                    event.consumed = consumed;
                    event.produced.push(tok);
                    event.ext = Some(ExternalCall {
                        callee_name: symbol.into(),
                        sig_hash,
                    });
                }
                (ProvClass::Ret, _) => {
                    let consumed = self.pop_shadow()?;
                    event.consumed.push(consumed);
                    if self.frames.len() > 1 {
                        let tok = Tok::mint(thread_id, counter);
                        event.produced.push(tok);
                        let caller_ix = self.frames.len() - 2;
                        self.frames[caller_ix].push(tok);
                    }
                    frame_returned = true;
                }
                (ProvClass::Unpack, _) => {
                    let consumed = self.pop_shadow()?;
                    event.consumed.push(consumed);
                    // One mint per element: the shared counter resolves them
                    // all to this event, the index tells the elements apart.
                    for i in 0..effect_decl.pushes {
                        let tok = Tok::mint_indexed(thread_id, counter, i as u8);
                        self.push_shadow(tok);
                        event.produced.push(tok);
                    }
                }
                (ProvClass::Branch, _) | (ProvClass::Fresh, _) | (ProvClass::Call, _) => {
                    event.consumed = self.pop_shadow_n(effect_decl.pops as usize)?;
                    if effect_decl.pushes > 0 {
                        let tok = Tok::mint(thread_id, counter);
                        for _ in 0..effect_decl.pushes {
                            self.push_shadow(tok);
                            event.produced.push(tok);
                        }
                    }
                }
                (ProvClass::Raise, _) => unreachable!("raise handled as fault"),
                (ProvClass::Unwind, _) => {
                    // PushExc/Reraise are emitted through the dedicated
                    // unwind hooks, never through record_step.
                    return Err(self.corrupt(
                        Invariant::FrameBalance,
                        format!("{} recorded as a plain step", info.opcode.name()),
                    ));
                }
            }
        }

        if self.debug {
            tracing::debug!(
                counter,
                opcode = info.opcode.name(),
                arg = info.arg,
                fault = event.fault,
                "step"
            );
        }

        self.append(TraceEvent::Instr(event))?;
        if let Some(enter) = entered {
            self.append(enter)?;
        }
        if frame_returned {
            // Free the shadow only after the return event is in the log.
            let shadow = self.frames.pop().expect("non-empty");
            self.pool.release(shadow);
            self.writer.flush_thread(thread_id)?;
        }

        self.fire_callback()?;
        Ok(step_effect)
    }

    /// Records handler dispatch: the stack unwound to `stack_depth` and the
    /// in-flight exception was pushed.
    pub fn record_handler_dispatch(
        &mut self,
        info: StepInfo,
        stack_depth: u32,
        exc_tok: Tok,
    ) -> Result<(), RecordError> {
        self.ensure_alive()?;
        let counter = self.ctx.advance();
        let thread_id = self.ctx.thread_id();
        let frame_ord = match self.frames.last() {
            Some(f) => f.frame_ord,
            None => {
                return Err(self.corrupt(
                    Invariant::FrameBalance,
                    "handler dispatch outside any frame".to_string(),
                ))
            }
        };
        let popped = self.drop_shadow_to(stack_depth as usize)?;
        self.push_shadow(exc_tok);
        let event = InstructionEvent {
            counter,
            frame_ord,
            thread_id,
            opcode: Opcode::PushExc,
            arg: info.arg,
            code_id: info.code_id,
            instr_offset: info.instr_offset,
            fault: false,
            consumed: popped,
            produced: vec![exc_tok],
            reads: Vec::new(),
            writes: Vec::new(),
            ext: None,
        };
        self.append(TraceEvent::Instr(event))?;
        self.fire_callback()
    }

    /// Records an unhandled fault unwinding out of the current frame.
    pub fn record_frame_unwind(&mut self, info: StepInfo) -> Result<(), RecordError> {
        self.ensure_alive()?;
        let counter = self.ctx.advance();
        let thread_id = self.ctx.thread_id();
        let frame_ord = match self.frames.last() {
            Some(f) => f.frame_ord,
            None => {
                return Err(self.corrupt(
                    Invariant::FrameBalance,
                    "unwind outside any frame".to_string(),
                ))
            }
        };
        let popped = self.drop_shadow_to(0)?;
        let event = InstructionEvent {
            counter,
            frame_ord,
            thread_id,
            opcode: Opcode::Reraise,
            arg: 0,
            code_id: info.code_id,
            instr_offset: info.instr_offset,
            fault: true,
            consumed: popped,
            produced: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            ext: None,
        };
        self.append(TraceEvent::Instr(event))?;
        let shadow = self.frames.pop().expect("non-empty");
        self.pool.release(shadow);
        self.writer.flush_thread(thread_id)?;
        self.fire_callback()
    }

    fn fire_callback(&mut self) -> Result<(), RecordError> {
        if !self.ctx.callback_due() {
            return Ok(());
        }
        let Some(mut callback) = self.callback.take() else {
            return Ok(());
        };
        let result = callback(&self.ctx);
        self.callback = Some(callback);
        match result {
            Ok(next) => {
                self.ctx.set_callback_at(next);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "stepping callback failed; aborting session");
                let counter = self.ctx.advance();
                let abort = TraceEvent::Abort(AbortEvent {
                    counter,
                    thread_id: self.ctx.thread_id(),
                    reason: "callback-failed".into(),
                });
                let _ = self.append(abort);
                let _ = self.writer.flush_thread(self.ctx.thread_id());
                let _ = self.writer.close();
                self.dead = true;
                Err(e.into())
            }
        }
    }

    /// Flushes this thread's lane. Call when the guest run completes.
    pub fn finish(&mut self) -> Result<(), RecordError> {
        if self.dead {
            return Ok(());
        }
        self.writer.flush_thread(self.ctx.thread_id())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForkPolicy;

    fn code() -> CodeObject {
        CodeObject {
            name: "<module>".to_string(),
            source_path: "test.gx".to_string(),
            param_count: 0,
            consts: vec![crate::value::Value::Int(1)],
            local_names: vec!["a".to_string()],
            instrs: Vec::new(),
            lines: Vec::new(),
            handlers: Vec::new(),
        }
    }

    fn recorder(dir: &std::path::Path) -> (Arc<TraceWriter>, Recorder) {
        let writer = Arc::new(
            TraceWriter::create(&dir.join("t.rtrc"), ForkPolicy::Refuse).unwrap(),
        );
        let cfg = RecorderConfig {
            callback_at: 0,
            ..RecorderConfig::default()
        };
        let rec = Recorder::new(writer.clone(), 0, &cfg);
        (writer, rec)
    }

    fn step(opcode: Opcode, arg: u32, offset: u32) -> StepInfo {
        StepInfo {
            opcode,
            arg,
            code_id: CodeId(0),
            instr_offset: offset,
        }
    }

    #[test]
    fn counter_advances_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let (_w, mut rec) = recorder(dir.path());
        rec.enter_root(CodeId(0), &code()).unwrap();
        assert_eq!(rec.ctx().counter(), 1);
        rec.record_step(step(Opcode::LoadConst, 0, 0), StepOutcome::Normal)
            .unwrap();
        assert_eq!(rec.ctx().counter(), 2);
        rec.record_step(
            step(Opcode::StoreLocal, 0, 1),
            StepOutcome::Store { repr: "1".into() },
        )
        .unwrap();
        assert_eq!(rec.ctx().counter(), 3);
        assert_eq!(rec.shadow_depth(), 0);
    }

    #[test]
    fn underflow_is_fatal_and_named() {
        let dir = tempfile::tempdir().unwrap();
        let (_w, mut rec) = recorder(dir.path());
        rec.enter_root(CodeId(0), &code()).unwrap();
        let err = rec
            .record_step(step(Opcode::Binary, 0, 0), StepOutcome::Normal)
            .unwrap_err();
        match err {
            RecordError::Corruption { invariant, .. } => {
                assert_eq!(invariant, Invariant::ShadowDepth);
            }
            other => panic!("expected corruption, got {other:?}"),
        }
        assert!(matches!(
            rec.record_step(step(Opcode::Nop, 0, 1), StepOutcome::Normal),
            Err(RecordError::SessionDead)
        ));
    }

    #[test]
    fn depth_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let (_w, mut rec) = recorder(dir.path());
        rec.enter_root(CodeId(0), &code()).unwrap();
        rec.record_step(step(Opcode::LoadConst, 0, 0), StepOutcome::Normal)
            .unwrap();
        assert!(rec.verify_depth(1).is_ok());
        assert!(matches!(
            rec.verify_depth(3),
            Err(RecordError::Corruption {
                invariant: Invariant::ShadowDepth,
                ..
            })
        ));
    }

    #[test]
    fn cancellation_emits_abort() {
        let dir = tempfile::tempdir().unwrap();
        let (_w, mut rec) = recorder(dir.path());
        rec.enter_root(CodeId(0), &code()).unwrap();
        let token = rec.cancel_token();
        assert!(rec.check_cancelled().is_ok());
        token.cancel();
        assert!(matches!(rec.check_cancelled(), Err(RecordError::Cancelled)));
    }

    #[test]
    fn callback_rearms_and_disarms() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(
            TraceWriter::create(&dir.path().join("cb.rtrc"), ForkPolicy::Refuse).unwrap(),
        );
        let cfg = RecorderConfig {
            callback_at: 2,
            ..RecorderConfig::default()
        };
        let mut rec = Recorder::new(writer, 0, &cfg);
        let fired = Arc::new(std::sync::Mutex::new(Vec::new()));
        let fired_in_cb = fired.clone();
        rec.set_callback(Box::new(move |ctx| {
            fired_in_cb.lock().unwrap().push(ctx.counter());
            Ok(Some(ctx.counter() + 3))
        }));
        rec.enter_root(CodeId(0), &code()).unwrap();
        for i in 0..6 {
            rec.record_step(step(Opcode::Nop, 0, i), StepOutcome::Normal)
                .unwrap();
        }
        assert_eq!(*fired.lock().unwrap(), vec![2, 5]);
    }
}
