// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Guest opcode table: stable byte values, stack arity and provenance class.
//!
//! The table is the single source of truth for how many tokens an opcode pops
//! and pushes and for how the produced token's parents are derived. Opcode
//! values are part of the trace format and must never be reused.

macro_rules! opcodes {
    ($( $(#[$doc:meta])* $name:ident = $value:literal ),+ $(,)?) => {
        /// A guest opcode.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
        #[repr(u16)]
        pub enum Opcode {
            $( $(#[$doc])* $name = $value, )+
        }

        impl Opcode {
            /// Parses an opcode from its stable `u16` value.
            #[must_use]
            pub fn from_u16(v: u16) -> Option<Self> {
                match v {
                    $( $value => Some(Self::$name), )+
                    _ => None,
                }
            }

            /// Returns the mnemonic.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name), )+
                }
            }
        }
    };
}

opcodes! {
    /// No effect.
    Nop = 0x00,
    /// Push constant `arg` from the code object's pool.
    LoadConst = 0x01,
    /// Push the value bound to local name `arg`.
    LoadLocal = 0x02,
    /// Pop and bind to local name `arg`.
    StoreLocal = 0x03,
    /// Push the value bound to module-level name `arg`.
    LoadGlobal = 0x04,
    /// Pop and bind to module-level name `arg`.
    StoreGlobal = 0x05,
    /// Pop and discard the top of stack.
    Pop = 0x06,
    /// Push a copy of the `arg`-th entry from the top (1 = top).
    Copy = 0x07,
    /// Swap the top of stack with the `arg`-th entry (2 = the one below).
    Swap = 0x08,

    /// Pop two operands, push the result of binary operator `arg`.
    Binary = 0x10,
    /// Pop one operand, push the result of unary operator `arg`.
    Unary = 0x11,
    /// Pop `arg` values, push one tuple.
    BuildTuple = 0x12,
    /// Pop one sequence, push its `arg` elements (last element topmost).
    UnpackSeq = 0x13,

    /// Unconditional jump to instruction index `arg`.
    Jump = 0x20,
    /// Pop; jump to `arg` if falsy.
    BranchIfFalse = 0x21,
    /// Pop; jump to `arg` if truthy.
    BranchIfTrue = 0x22,

    /// Pop `arg` arguments and a callee, push the call result.
    Call = 0x30,
    /// Pop the return value and leave the frame.
    Return = 0x31,
    /// Pop an exception value and begin unwinding.
    Raise = 0x32,
    /// Synthetic: handler dispatch pushed the in-flight exception.
    PushExc = 0x33,
    /// Synthetic: the frame had no handler and unwound into its caller.
    Reraise = 0x34,
}

/// How the produced tokens of an opcode relate to the consumed ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProvClass {
    /// Mint a fresh token; parents are the consumed tokens.
    Fresh,
    /// Re-push an existing token; nothing is minted.
    Copy,
    /// Reorder existing tokens; nothing is minted.
    Swap,
    /// Mint with no parents (`kind = const`).
    LoadConst,
    /// Mint with the binding's current token as single parent.
    LoadBinding,
    /// Consume one token; mint the binding's new token off it; push nothing.
    StoreBinding,
    /// Consume callee + args; production is deferred to the callee's return
    /// (instrumented) or minted as an external root (opaque).
    Call,
    /// Consume the return value; mint the caller's result token off it.
    Ret,
    /// Mint once; push the element count with per-index provenance.
    Unpack,
    /// Consume 0 or 1, produce nothing; logged for control-flow replay.
    Branch,
    /// Consume the raised value; the fault event mints the exception token.
    Raise,
    /// Synthetic unwind bookkeeping.
    Unwind,
}

/// Stack arity of one opcode at a given argument.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StackEffect {
    /// Tokens popped from the shadow stack.
    pub pops: u32,
    /// Tokens pushed onto the shadow stack.
    pub pushes: u32,
}

impl Opcode {
    /// Returns the provenance class of this opcode.
    #[must_use]
    pub const fn class(self) -> ProvClass {
        match self {
            Self::Nop | Self::Pop | Self::Binary | Self::Unary | Self::BuildTuple => {
                ProvClass::Fresh
            }
            Self::Copy => ProvClass::Copy,
            Self::Swap => ProvClass::Swap,
            Self::LoadConst => ProvClass::LoadConst,
            Self::LoadLocal | Self::LoadGlobal => ProvClass::LoadBinding,
            Self::StoreLocal | Self::StoreGlobal => ProvClass::StoreBinding,
            Self::Call => ProvClass::Call,
            Self::Return => ProvClass::Ret,
            Self::UnpackSeq => ProvClass::Unpack,
            Self::Jump | Self::BranchIfFalse | Self::BranchIfTrue => ProvClass::Branch,
            Self::Raise => ProvClass::Raise,
            Self::PushExc | Self::Reraise => ProvClass::Unwind,
        }
    }

    /// Returns how many tokens the opcode pops and pushes for argument `arg`.
    ///
    /// `Call` reports the effect seen by the *caller's* frame: the result push
    /// is accounted to the callee's return for instrumented callees, so `Call`
    /// itself pushes only for opaque callees (the recorder decides which).
    /// `Reraise` pops whatever remains on the frame's stack; its pop count is
    /// dynamic and reported as 0 here.
    #[must_use]
    pub fn stack_effect(self, arg: u32) -> StackEffect {
        let (pops, pushes) = match self {
            Self::Nop | Self::Jump | Self::Reraise => (0, 0),
            Self::LoadConst | Self::LoadLocal | Self::LoadGlobal | Self::PushExc => (0, 1),
            Self::StoreLocal | Self::StoreGlobal | Self::Pop | Self::Raise => (1, 0),
            Self::BranchIfFalse | Self::BranchIfTrue => (1, 0),
            Self::Copy => (0, 1),
            Self::Swap => (0, 0),
            Self::Binary => (2, 1),
            Self::Unary => (1, 1),
            Self::BuildTuple => (arg, 1),
            Self::UnpackSeq => (1, arg),
            Self::Call => (arg + 1, 0),
            Self::Return => (1, 0),
        };
        StackEffect { pops, pushes }
    }
}

/// Binary operators selected by the `Binary` opcode argument.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BinOp {
    /// Addition (ints, floats, string concat, tuple concat).
    Add = 0,
    /// Subtraction.
    Sub = 1,
    /// Multiplication.
    Mul = 2,
    /// True division; always produces a float, faults on zero.
    Div = 3,
    /// Floor division; faults on zero.
    FloorDiv = 4,
    /// Remainder; faults on zero.
    Mod = 5,
    /// Equality.
    Eq = 6,
    /// Inequality.
    Ne = 7,
    /// Less-than.
    Lt = 8,
    /// Less-or-equal.
    Le = 9,
    /// Greater-than.
    Gt = 10,
    /// Greater-or-equal.
    Ge = 11,
    /// Subscript (`seq[i]`); faults on range errors.
    Index = 12,
}

impl BinOp {
    /// Parses a binary operator from the opcode argument.
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Add,
            1 => Self::Sub,
            2 => Self::Mul,
            3 => Self::Div,
            4 => Self::FloorDiv,
            5 => Self::Mod,
            6 => Self::Eq,
            7 => Self::Ne,
            8 => Self::Lt,
            9 => Self::Le,
            10 => Self::Gt,
            11 => Self::Ge,
            12 => Self::Index,
            _ => return None,
        })
    }
}

/// Unary operators selected by the `Unary` opcode argument.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg = 0,
    /// Boolean negation.
    Not = 1,
}

impl UnaryOp {
    /// Parses a unary operator from the opcode argument.
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Neg),
            1 => Some(Self::Not),
            _ => None,
        }
    }
}
