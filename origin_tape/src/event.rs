// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Trace event records.
//!
//! One [`InstructionEvent`] is logged per executed opcode; [`EnterEvent`]
//! marks frame entry (call bookkeeping is observed and counted like any other
//! opcode) and [`AbortEvent`] terminates a thread's stream early.
//!
//! Parent edges are not stored explicitly: they are derived from the minting
//! event's opcode class, which keeps records small and the derivation rules in
//! one place ([`TraceEvent::parents_of`]).

use crate::host::SigHash;
use crate::opcode::{Opcode, ProvClass};
use crate::program::{CodeId, NameId};
use crate::token::{FrameOrd, Tok, TokKind};

/// Which name table a binding refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingScope {
    /// A local of the event's frame.
    Local,
    /// A module-level binding (held by the thread's root frame).
    Global,
}

/// A binding read or write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    /// Scope of the name.
    pub scope: BindingScope,
    /// Name id within the scope's table.
    pub name: NameId,
    /// Token bound (for writes: the newly minted binding token; for reads:
    /// the binding's token at read time).
    pub tok: Tok,
    /// Bounded display form of the bound value, captured at write time.
    pub repr: Option<Box<str>>,
}

/// Metadata for a call that left instrumented code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalCall {
    /// Fully-qualified callee name.
    pub callee_name: Box<str>,
    /// Hash over the callee name and argument types.
    pub sig_hash: SigHash,
}

/// The per-opcode log record.
#[derive(Clone, Debug, PartialEq)]
pub struct InstructionEvent {
    /// Per-thread instruction counter (dense, starts at 1).
    pub counter: u64,
    /// Frame the opcode executed in.
    pub frame_ord: FrameOrd,
    /// Executing thread.
    pub thread_id: u16,
    /// Executed opcode.
    pub opcode: Opcode,
    /// Opcode argument.
    pub arg: u32,
    /// Code object of the frame.
    pub code_id: CodeId,
    /// Instruction index within the code object.
    pub instr_offset: u32,
    /// The opcode raised a guest exception; `produced` is empty and the
    /// exception value carries this event's token.
    pub fault: bool,
    /// Tokens popped from the shadow stack, bottom-most first.
    pub consumed: Vec<Tok>,
    /// Tokens pushed onto the shadow stack, in push order.
    pub produced: Vec<Tok>,
    /// Binding reads performed by the opcode.
    pub reads: Vec<Binding>,
    /// Binding writes performed by the opcode.
    pub writes: Vec<Binding>,
    /// Present when the opcode called an opaque host callable.
    pub ext: Option<ExternalCall>,
}

/// Frame-entry record.
#[derive(Clone, Debug, PartialEq)]
pub struct EnterEvent {
    /// Per-thread instruction counter of the entry.
    pub counter: u64,
    /// Ordinal assigned to the new frame.
    pub frame_ord: FrameOrd,
    /// Executing thread.
    pub thread_id: u16,
    /// Code object the frame executes.
    pub code_id: CodeId,
    /// Caller frame, absent for a thread's root frame.
    pub parent: Option<FrameOrd>,
    /// Argument tokens consumed by the call, in parameter order.
    pub args: Vec<Tok>,
    /// Parameter bindings minted at entry (one per argument).
    pub writes: Vec<Binding>,
}

/// Early stream termination record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbortEvent {
    /// Per-thread counter at which recording stopped.
    pub counter: u64,
    /// Executing thread.
    pub thread_id: u16,
    /// Why recording stopped (`cancelled`, `forked-child`, or the name of the
    /// violated recording invariant).
    pub reason: Box<str>,
}

/// Any record in a trace stream.
#[derive(Clone, Debug, PartialEq)]
pub enum TraceEvent {
    /// Per-opcode record.
    Instr(InstructionEvent),
    /// Frame entry.
    Enter(EnterEvent),
    /// Early termination.
    Abort(AbortEvent),
}

impl TraceEvent {
    /// Returns the per-thread counter of the record.
    #[must_use]
    pub fn counter(&self) -> u64 {
        match self {
            Self::Instr(e) => e.counter,
            Self::Enter(e) => e.counter,
            Self::Abort(e) => e.counter,
        }
    }

    /// Returns the executing thread.
    #[must_use]
    pub fn thread_id(&self) -> u16 {
        match self {
            Self::Instr(e) => e.thread_id,
            Self::Enter(e) => e.thread_id,
            Self::Abort(e) => e.thread_id,
        }
    }

    /// Returns the parent tokens of `tok`, which must have been minted at this
    /// event (`tok.counter() == self.counter()` on the same thread).
    ///
    /// Returns `None` if this event minted no such token — the caller is
    /// holding a propagated copy and should resolve through the minting event
    /// instead.
    #[must_use]
    pub fn parents_of(&self, tok: Tok) -> Option<Vec<Tok>> {
        match self {
            Self::Enter(e) => {
                let ix = e.writes.iter().position(|w| w.tok == tok)?;
                Some(match e.args.get(ix) {
                    Some(&arg) if !arg.is_none() => vec![arg],
                    _ => Vec::new(),
                })
            }
            Self::Abort(_) => None,
            Self::Instr(e) => {
                let minted_on_stack = e.produced.contains(&tok);
                let minted_in_writes = e.writes.iter().any(|w| w.tok == tok);
                if e.fault && tok.counter() == e.counter {
                    // Exception token: parents are the operands the faulting
                    // opcode consumed.
                    return Some(non_none(&e.consumed));
                }
                if !minted_on_stack && !minted_in_writes {
                    return None;
                }
                match e.opcode.class() {
                    ProvClass::LoadConst => Some(Vec::new()),
                    ProvClass::LoadBinding => {
                        let read = e.reads.first()?;
                        Some(if read.tok.is_none() {
                            Vec::new()
                        } else {
                            vec![read.tok]
                        })
                    }
                    ProvClass::Call => {
                        // Only opaque calls mint here, and the result is a
                        // provenance root: the chain ends at the boundary.
                        Some(Vec::new())
                    }
                    ProvClass::Unpack => Some(non_none(&e.consumed)),
                    ProvClass::Copy | ProvClass::Swap | ProvClass::Unwind => None,
                    ProvClass::Fresh
                    | ProvClass::StoreBinding
                    | ProvClass::Ret
                    | ProvClass::Branch
                    | ProvClass::Raise => Some(non_none(&e.consumed)),
                }
            }
        }
    }

    /// Classifies a token minted at this event.
    #[must_use]
    pub fn kind_of(&self, tok: Tok) -> TokKind {
        match self {
            Self::Enter(_) | Self::Abort(_) => TokKind::Computed,
            Self::Instr(e) => {
                if e.fault && tok.counter() == e.counter {
                    TokKind::Exception
                } else if e.opcode.class() == ProvClass::LoadConst {
                    TokKind::Const
                } else if e.ext.is_some() && e.produced.contains(&tok) {
                    TokKind::External
                } else {
                    TokKind::Computed
                }
            }
        }
    }
}

fn non_none(toks: &[Tok]) -> Vec<Tok> {
    toks.iter().copied().filter(|t| !t.is_none()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instr(opcode: Opcode, counter: u64) -> InstructionEvent {
        InstructionEvent {
            counter,
            frame_ord: FrameOrd::new(0, 0),
            thread_id: 0,
            opcode,
            arg: 0,
            code_id: CodeId(0),
            instr_offset: 0,
            fault: false,
            consumed: Vec::new(),
            produced: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            ext: None,
        }
    }

    #[test]
    fn fresh_parents_are_consumed() {
        let mut e = instr(Opcode::Binary, 3);
        e.consumed = vec![Tok::mint(0, 1), Tok::mint(0, 2)];
        let t = Tok::mint(0, 3);
        e.produced = vec![t];
        let ev = TraceEvent::Instr(e);
        assert_eq!(ev.parents_of(t).unwrap(), vec![Tok::mint(0, 1), Tok::mint(0, 2)]);
        assert_eq!(ev.kind_of(t), TokKind::Computed);
    }

    #[test]
    fn const_load_has_no_parents() {
        let mut e = instr(Opcode::LoadConst, 1);
        let t = Tok::mint(0, 1);
        e.produced = vec![t];
        let ev = TraceEvent::Instr(e);
        assert_eq!(ev.parents_of(t).unwrap(), Vec::<Tok>::new());
        assert_eq!(ev.kind_of(t), TokKind::Const);
    }

    #[test]
    fn opaque_call_result_is_a_root() {
        let mut e = instr(Opcode::Call, 5);
        e.consumed = vec![Tok::mint(0, 1), Tok::mint(0, 2)];
        let t = Tok::mint(0, 5);
        e.produced = vec![t];
        e.ext = Some(ExternalCall {
            callee_name: "random.randint".into(),
            sig_hash: SigHash(1),
        });
        let ev = TraceEvent::Instr(e);
        assert_eq!(ev.parents_of(t).unwrap(), Vec::<Tok>::new());
        assert_eq!(ev.kind_of(t), TokKind::External);
    }

    #[test]
    fn propagated_tokens_resolve_elsewhere() {
        let mut e = instr(Opcode::Copy, 7);
        // Copy pushes a token minted at counter 2; this event minted nothing.
        e.produced = vec![Tok::mint(0, 2)];
        let ev = TraceEvent::Instr(e);
        assert_eq!(ev.parents_of(Tok::mint(0, 2)), None);
    }
}
