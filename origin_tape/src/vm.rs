// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bundled guest evaluator.
//!
//! A small dynamically-typed stack machine over [`Program`]s. It exists so
//! the recorder has an evaluator to instrument on hosts without a frame
//! dispatch hook: the VM never advances an opcode without first giving the
//! [`Recorder`] its boundary checks, and reports every completed opcode back
//! through [`Recorder::record_step`].
//!
//! Guest faults unwind through per-code exception handler ranges; an
//! unhandled fault surfaces as [`VmError::Fault`] without killing the
//! recording (the trace stays valid and closeable).

use thiserror::Error;

use crate::host::{sig_hash, Host};
use crate::opcode::{BinOp, Opcode, UnaryOp};
use crate::program::{CodeId, Program};
use crate::recorder::{RecordError, Recorder, StepEffect, StepInfo, StepOutcome};
use crate::token::Tok;
use crate::value::Value;

/// Execution limits for a VM run.
#[derive(Clone, Debug)]
pub struct Limits {
    /// Instruction budget; each opcode costs 1.
    pub fuel: u64,
    /// Maximum call depth (frames).
    pub max_call_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            fuel: 1_000_000,
            max_call_depth: 256,
        }
    }
}

/// An unhandled guest exception, annotated with its origin.
#[derive(Clone, Debug)]
pub struct GuestFault {
    /// Display form of the exception value.
    pub message: String,
    /// Code object of the faulting opcode.
    pub code_id: CodeId,
    /// Instruction index of the faulting opcode.
    pub instr_offset: u32,
    /// Source line of the faulting opcode.
    pub line: Option<u32>,
    /// Token carried by the exception value.
    pub tok: Tok,
}

impl std::fmt::Display for GuestFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(
                f,
                "{} (code {} offset {} line {line})",
                self.message, self.code_id.0, self.instr_offset
            ),
            None => write!(
                f,
                "{} (code {} offset {})",
                self.message, self.code_id.0, self.instr_offset
            ),
        }
    }
}

/// A VM run failure.
#[derive(Debug, Error)]
pub enum VmError {
    /// The guest raised an exception no handler caught.
    #[error("guest fault: {0}")]
    Fault(GuestFault),
    /// Fuel limit exceeded.
    #[error("fuel limit exceeded")]
    FuelExceeded,
    /// Call depth limit exceeded.
    #[error("call depth limit exceeded")]
    CallDepthExceeded,
    /// The program is malformed (embedder bug, not a guest fault).
    #[error("invalid bytecode: {0}")]
    InvalidCode(String),
    /// Recording failed; the run stops but the guest state is intact.
    #[error(transparent)]
    Record(#[from] RecordError),
}

fn invalid(detail: impl Into<String>) -> VmError {
    VmError::InvalidCode(detail.into())
}

#[derive(Debug)]
struct Frame {
    code_id: CodeId,
    /// Next instruction index.
    pc: u32,
    /// Currently executing instruction index (for handler lookup).
    cur: u32,
    stack: Vec<Value>,
    locals: Vec<Option<Value>>,
}

impl Frame {
    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or_else(|| invalid("operand stack underflow"))
    }
}

#[derive(Debug)]
struct Raised {
    value: Value,
    tok: Tok,
}

/// The guest evaluator.
pub struct Vm<H: Host> {
    host: H,
    limits: Limits,
}

impl<H: Host> std::fmt::Debug for Vm<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl<H: Host> Vm<H> {
    /// Creates a VM with `host` and `limits`.
    #[must_use]
    pub fn new(host: H, limits: Limits) -> Self {
        Self { host, limits }
    }

    /// Executes `program` starting at `entry`, recording through `recorder`
    /// when present. Returns the value the entry frame returned.
    pub fn run(
        &mut self,
        program: &Program,
        entry: CodeId,
        mut recorder: Option<&mut Recorder>,
    ) -> Result<Value, VmError> {
        let entry_code = program
            .code(entry)
            .ok_or_else(|| invalid(format!("unknown entry code {}", entry.0)))?;
        if let Some(r) = recorder.as_deref_mut() {
            r.enter_root(entry, entry_code)?;
        }

        let mut frames = vec![Frame {
            code_id: entry,
            pc: 0,
            cur: 0,
            stack: Vec::new(),
            locals: vec![None; entry_code.local_names.len()],
        }];
        let mut globals: Vec<Option<Value>> = vec![None; program.global_names.len()];
        let mut fuel = self.limits.fuel;

        loop {
            if let Some(r) = recorder.as_deref_mut() {
                r.check_cancelled()?;
            }
            if fuel == 0 {
                return Err(VmError::FuelExceeded);
            }
            fuel -= 1;

            let (code_id, cur, op, arg) = {
                let frame = frames.last_mut().expect("frame stack never empty here");
                let code = program
                    .code(frame.code_id)
                    .ok_or_else(|| invalid("unknown code id"))?;
                let instr = code
                    .instrs
                    .get(frame.pc as usize)
                    .copied()
                    .ok_or_else(|| invalid("pc past end of code"))?;
                let cur = frame.pc;
                frame.cur = cur;
                frame.pc = cur + 1;
                (frame.code_id, cur, instr.op, instr.arg)
            };
            let code = program.code(code_id).expect("checked above");
            let info = StepInfo {
                opcode: op,
                arg,
                code_id,
                instr_offset: cur,
            };

            let mut root_ret: Option<Value> = None;
            // Ok: the opcode completed (with its outcome). Err: it raised the
            // given guest exception value.
            let step: Result<StepOutcome<'_>, Value> = match op {
                Opcode::Nop => Ok(StepOutcome::Normal),
                Opcode::LoadConst => {
                    let frame = frames.last_mut().expect("non-empty");
                    let v = code
                        .consts
                        .get(arg as usize)
                        .cloned()
                        .ok_or_else(|| invalid("constant index out of range"))?;
                    frame.stack.push(v);
                    Ok(StepOutcome::Normal)
                }
                Opcode::LoadLocal => {
                    let frame = frames.last_mut().expect("non-empty");
                    match frame.locals.get(arg as usize).and_then(Option::as_ref) {
                        Some(v) => {
                            let v = v.clone();
                            frame.stack.push(v);
                            Ok(StepOutcome::Normal)
                        }
                        None => {
                            let name = code
                                .local_names
                                .get(arg as usize)
                                .map_or("?", String::as_str);
                            Err(Value::str(&format!(
                                "NameError: name '{name}' is not defined"
                            )))
                        }
                    }
                }
                Opcode::StoreLocal => {
                    let frame = frames.last_mut().expect("non-empty");
                    let v = frame.pop()?;
                    let ix = arg as usize;
                    if ix >= frame.locals.len() {
                        frame.locals.resize(ix + 1, None);
                    }
                    let repr = v.repr().into_boxed_str();
                    frame.locals[ix] = Some(v);
                    Ok(StepOutcome::Store { repr })
                }
                Opcode::LoadGlobal => match globals.get(arg as usize).and_then(Option::as_ref) {
                    Some(v) => {
                        let v = v.clone();
                        frames.last_mut().expect("non-empty").stack.push(v);
                        Ok(StepOutcome::Normal)
                    }
                    None => {
                        let name = program.global_name(crate::program::NameId(arg));
                        Err(Value::str(&format!(
                            "NameError: name '{}' is not defined",
                            name.unwrap_or("?")
                        )))
                    }
                },
                Opcode::StoreGlobal => {
                    if arg as usize >= globals.len() {
                        return Err(invalid("global index out of range"));
                    }
                    let frame = frames.last_mut().expect("non-empty");
                    let v = frame.pop()?;
                    let repr = v.repr().into_boxed_str();
                    globals[arg as usize] = Some(v);
                    Ok(StepOutcome::Store { repr })
                }
                Opcode::Pop => {
                    frames.last_mut().expect("non-empty").pop()?;
                    Ok(StepOutcome::Normal)
                }
                Opcode::Copy => {
                    let frame = frames.last_mut().expect("non-empty");
                    let depth = arg as usize;
                    if depth == 0 || depth > frame.stack.len() {
                        return Err(invalid("copy depth out of range"));
                    }
                    let v = frame.stack[frame.stack.len() - depth].clone();
                    frame.stack.push(v);
                    Ok(StepOutcome::Normal)
                }
                Opcode::Swap => {
                    let frame = frames.last_mut().expect("non-empty");
                    let depth = arg as usize;
                    if depth < 2 || depth > frame.stack.len() {
                        return Err(invalid("swap depth out of range"));
                    }
                    let top = frame.stack.len() - 1;
                    let other = frame.stack.len() - depth;
                    frame.stack.swap(top, other);
                    Ok(StepOutcome::Normal)
                }
                Opcode::Binary => {
                    let bin = BinOp::from_u32(arg)
                        .ok_or_else(|| invalid("unknown binary operator"))?;
                    let frame = frames.last_mut().expect("non-empty");
                    let rhs = frame.pop()?;
                    let lhs = frame.pop()?;
                    match binary_op(bin, &lhs, &rhs) {
                        Ok(v) => {
                            frame.stack.push(v);
                            Ok(StepOutcome::Normal)
                        }
                        Err(msg) => Err(Value::str(&msg)),
                    }
                }
                Opcode::Unary => {
                    let un = UnaryOp::from_u32(arg)
                        .ok_or_else(|| invalid("unknown unary operator"))?;
                    let frame = frames.last_mut().expect("non-empty");
                    let v = frame.pop()?;
                    match unary_op(un, &v) {
                        Ok(out) => {
                            frame.stack.push(out);
                            Ok(StepOutcome::Normal)
                        }
                        Err(msg) => Err(Value::str(&msg)),
                    }
                }
                Opcode::BuildTuple => {
                    let frame = frames.last_mut().expect("non-empty");
                    let n = arg as usize;
                    if frame.stack.len() < n {
                        return Err(invalid("build_tuple underflow"));
                    }
                    let items = frame.stack.split_off(frame.stack.len() - n);
                    frame.stack.push(Value::tuple(items));
                    Ok(StepOutcome::Normal)
                }
                Opcode::UnpackSeq => {
                    if arg > u32::from(u8::MAX) {
                        return Err(invalid("unpack arity exceeds the token index width"));
                    }
                    let frame = frames.last_mut().expect("non-empty");
                    let v = frame.pop()?;
                    match v {
                        Value::Tuple(items) if items.len() == arg as usize => {
                            for item in items.iter() {
                                frame.stack.push(item.clone());
                            }
                            Ok(StepOutcome::Normal)
                        }
                        Value::Tuple(items) => Err(Value::str(&format!(
                            "ValueError: expected {} values, got {}",
                            arg,
                            items.len()
                        ))),
                        other => Err(Value::str(&format!(
                            "TypeError: cannot unpack {}",
                            type_name(&other)
                        ))),
                    }
                }
                Opcode::Jump => {
                    frames.last_mut().expect("non-empty").pc = arg;
                    Ok(StepOutcome::Normal)
                }
                Opcode::BranchIfFalse => {
                    let frame = frames.last_mut().expect("non-empty");
                    let c = frame.pop()?;
                    if !c.is_truthy() {
                        frame.pc = arg;
                    }
                    Ok(StepOutcome::Normal)
                }
                Opcode::BranchIfTrue => {
                    let frame = frames.last_mut().expect("non-empty");
                    let c = frame.pop()?;
                    if c.is_truthy() {
                        frame.pc = arg;
                    }
                    Ok(StepOutcome::Normal)
                }
                Opcode::Call => {
                    let argc = arg as usize;
                    let frame = frames.last_mut().expect("non-empty");
                    if frame.stack.len() < argc + 1 {
                        return Err(invalid("call underflow"));
                    }
                    let args = frame.stack.split_off(frame.stack.len() - argc);
                    let callee = frame.pop()?;
                    match callee {
                        Value::Func(callee_id) => {
                            let callee_code = program
                                .code(callee_id)
                                .ok_or_else(|| invalid("unknown callee code id"))?;
                            if frames.len() >= self.limits.max_call_depth {
                                return Err(VmError::CallDepthExceeded);
                            }
                            if args.len() != callee_code.param_count as usize {
                                Err(Value::str(&format!(
                                    "TypeError: {}() takes {} arguments, got {}",
                                    callee_code.name,
                                    callee_code.param_count,
                                    args.len()
                                )))
                            } else {
                                let arg_reprs: Vec<Box<str>> =
                                    args.iter().map(|v| v.repr().into_boxed_str()).collect();
                                let mut locals: Vec<Option<Value>> =
                                    vec![None; callee_code.local_names.len()];
                                for (i, v) in args.into_iter().enumerate() {
                                    locals[i] = Some(v);
                                }
                                frames.push(Frame {
                                    code_id: callee_id,
                                    pc: 0,
                                    cur: 0,
                                    stack: Vec::new(),
                                    locals,
                                });
                                Ok(StepOutcome::CallEnter {
                                    code_id: callee_id,
                                    code: callee_code,
                                    arg_reprs,
                                })
                            }
                        }
                        Value::Builtin(builtin_id) => {
                            let symbol = program
                                .builtin_name(builtin_id)
                                .ok_or_else(|| invalid("unknown builtin id"))?;
                            let sig = sig_hash(symbol, &args);
                            match self.host.call(symbol, sig, &args) {
                                Ok(v) => {
                                    frame.stack.push(v);
                                    Ok(StepOutcome::CallOpaque {
                                        symbol,
                                        sig_hash: sig,
                                    })
                                }
                                Err(e) => Err(Value::str(&e.to_string())),
                            }
                        }
                        other => Err(Value::str(&format!(
                            "TypeError: {} is not callable",
                            type_name(&other)
                        ))),
                    }
                }
                Opcode::Return => {
                    let v = frames.last_mut().expect("non-empty").pop()?;
                    frames.pop();
                    match frames.last_mut() {
                        Some(caller) => caller.stack.push(v),
                        None => root_ret = Some(v),
                    }
                    Ok(StepOutcome::Return)
                }
                Opcode::Raise => {
                    let v = frames.last_mut().expect("non-empty").pop()?;
                    Err(v)
                }
                Opcode::PushExc | Opcode::Reraise => {
                    return Err(invalid("unwind opcodes are synthetic"));
                }
            };

            match step {
                Ok(outcome) => {
                    if let Some(r) = recorder.as_deref_mut() {
                        r.record_step(info, outcome)?;
                    }
                    if let Some(v) = root_ret {
                        if let Some(r) = recorder.as_deref_mut() {
                            r.finish()?;
                        }
                        return Ok(v);
                    }
                }
                Err(exc_value) => {
                    let effect = match recorder.as_deref_mut() {
                        Some(r) => r.record_step(info, StepOutcome::Fault)?,
                        None => StepEffect::default(),
                    };
                    let raised = Raised {
                        value: exc_value,
                        tok: effect.exc_tok.unwrap_or(Tok::NONE),
                    };
                    dispatch_fault(&mut frames, &mut recorder, program, raised, info)?;
                }
            }

            if let Some(r) = recorder.as_deref_mut() {
                if let Some(f) = frames.last() {
                    r.verify_depth(f.stack.len())?;
                }
            }
        }
    }
}

/// Unwinds `raised` to the nearest handler; an unhandled fault surfaces as
/// [`VmError::Fault`] annotated with the original fault site.
fn dispatch_fault(
    frames: &mut Vec<Frame>,
    recorder: &mut Option<&mut Recorder>,
    program: &Program,
    raised: Raised,
    origin: StepInfo,
) -> Result<(), VmError> {
    loop {
        let Some(frame) = frames.last_mut() else {
            let line = program
                .code(origin.code_id)
                .and_then(|c| c.line_at(origin.instr_offset));
            return Err(VmError::Fault(GuestFault {
                message: raised.value.repr(),
                code_id: origin.code_id,
                instr_offset: origin.instr_offset,
                line,
                tok: raised.tok,
            }));
        };
        let code = program
            .code(frame.code_id)
            .ok_or_else(|| invalid("unknown code id during unwind"))?;
        if let Some(handler) = code.handler_at(frame.cur).copied() {
            frame.stack.truncate(handler.stack_depth as usize);
            frame.stack.push(raised.value.clone());
            frame.pc = handler.target;
            if let Some(r) = recorder.as_deref_mut() {
                r.record_handler_dispatch(
                    StepInfo {
                        opcode: Opcode::PushExc,
                        arg: 0,
                        code_id: frame.code_id,
                        instr_offset: handler.target,
                    },
                    handler.stack_depth,
                    raised.tok,
                )?;
            }
            return Ok(());
        }
        if let Some(r) = recorder.as_deref_mut() {
            r.record_frame_unwind(StepInfo {
                opcode: Opcode::Reraise,
                arg: 0,
                code_id: frame.code_id,
                instr_offset: frame.cur,
            })?;
        }
        frames.pop();
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::None => "NoneType",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::Str(_) => "str",
        Value::Tuple(_) => "tuple",
        Value::Func(_) => "function",
        Value::Builtin(_) => "builtin",
    }
}

fn floor_div_i64(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

fn mod_i64(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    let r = a.wrapping_rem(b);
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn num_pair(lhs: &Value, rhs: &Value) -> Option<(f64, f64)> {
    let to_f = |v: &Value| match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    };
    Some((to_f(lhs)?, to_f(rhs)?))
}

fn type_error(op: &str, lhs: &Value, rhs: &Value) -> String {
    format!(
        "TypeError: unsupported operand type(s) for {op}: '{}' and '{}'",
        type_name(lhs),
        type_name(rhs)
    )
}

fn binary_op(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, String> {
    use Value::{Float, Int, Str, Tuple};
    match op {
        BinOp::Add => match (lhs, rhs) {
            (Int(a), Int(b)) => a
                .checked_add(*b)
                .map(Int)
                .ok_or_else(|| "OverflowError: integer addition overflow".to_string()),
            (Str(a), Str(b)) => {
                let mut s = a.to_string();
                s.push_str(b);
                Ok(Value::str(&s))
            }
            (Tuple(a), Tuple(b)) => {
                let mut items = a.to_vec();
                items.extend_from_slice(b);
                Ok(Value::tuple(items))
            }
            _ => num_pair(lhs, rhs)
                .map(|(a, b)| Float(a + b))
                .ok_or_else(|| type_error("+", lhs, rhs)),
        },
        BinOp::Sub => match (lhs, rhs) {
            (Int(a), Int(b)) => a
                .checked_sub(*b)
                .map(Int)
                .ok_or_else(|| "OverflowError: integer subtraction overflow".to_string()),
            _ => num_pair(lhs, rhs)
                .map(|(a, b)| Float(a - b))
                .ok_or_else(|| type_error("-", lhs, rhs)),
        },
        BinOp::Mul => match (lhs, rhs) {
            (Int(a), Int(b)) => a
                .checked_mul(*b)
                .map(Int)
                .ok_or_else(|| "OverflowError: integer multiplication overflow".to_string()),
            _ => num_pair(lhs, rhs)
                .map(|(a, b)| Float(a * b))
                .ok_or_else(|| type_error("*", lhs, rhs)),
        },
        BinOp::Div => match num_pair(lhs, rhs) {
            Some((_, b)) if b == 0.0 => {
                Err("ZeroDivisionError: division by zero".to_string())
            }
            Some((a, b)) => Ok(Float(a / b)),
            None => Err(type_error("/", lhs, rhs)),
        },
        BinOp::FloorDiv => match (lhs, rhs) {
            (Int(_), Int(0)) => Err("ZeroDivisionError: integer division by zero".to_string()),
            (Int(a), Int(b)) => Ok(Int(floor_div_i64(*a, *b).expect("checked non-zero"))),
            _ => match num_pair(lhs, rhs) {
                Some((_, b)) if b == 0.0 => {
                    Err("ZeroDivisionError: float floor division by zero".to_string())
                }
                Some((a, b)) => Ok(Float((a / b).floor())),
                None => Err(type_error("//", lhs, rhs)),
            },
        },
        BinOp::Mod => match (lhs, rhs) {
            (Int(_), Int(0)) => Err("ZeroDivisionError: integer modulo by zero".to_string()),
            (Int(a), Int(b)) => Ok(Int(mod_i64(*a, *b).expect("checked non-zero"))),
            _ => match num_pair(lhs, rhs) {
                Some((_, b)) if b == 0.0 => {
                    Err("ZeroDivisionError: float modulo by zero".to_string())
                }
                Some((a, b)) => {
                    let r = a % b;
                    let r = if r != 0.0 && (r < 0.0) != (b < 0.0) {
                        r + b
                    } else {
                        r
                    };
                    Ok(Float(r))
                }
                None => Err(type_error("%", lhs, rhs)),
            },
        },
        BinOp::Eq | BinOp::Ne => {
            let eq = match (lhs, rhs) {
                (Int(a), Int(b)) => a == b,
                (Str(a), Str(b)) => a == b,
                _ => match num_pair(lhs, rhs) {
                    Some((a, b)) => a == b,
                    None => lhs == rhs,
                },
            };
            Ok(Value::Bool(if op == BinOp::Eq { eq } else { !eq }))
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = match (lhs, rhs) {
                (Str(a), Str(b)) => a.partial_cmp(b),
                _ => num_pair(lhs, rhs).and_then(|(a, b)| a.partial_cmp(&b)),
            };
            let Some(ord) = ord else {
                return Err(type_error("comparison", lhs, rhs));
            };
            let result = match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::Index => match (lhs, rhs) {
            (Tuple(items), Int(i)) => {
                let ix = if *i < 0 { *i + items.len() as i64 } else { *i };
                usize::try_from(ix)
                    .ok()
                    .and_then(|ix| items.get(ix))
                    .cloned()
                    .ok_or_else(|| "IndexError: tuple index out of range".to_string())
            }
            (Str(s), Int(i)) => {
                let len = s.chars().count() as i64;
                let ix = if *i < 0 { *i + len } else { *i };
                usize::try_from(ix)
                    .ok()
                    .and_then(|ix| s.chars().nth(ix))
                    .map(|c| Value::str(&c.to_string()))
                    .ok_or_else(|| "IndexError: string index out of range".to_string())
            }
            _ => Err(type_error("[]", lhs, rhs)),
        },
    }
}

fn unary_op(op: UnaryOp, v: &Value) -> Result<Value, String> {
    match op {
        UnaryOp::Neg => match v {
            Value::Int(i) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| "OverflowError: integer negation overflow".to_string()),
            Value::Float(f) => Ok(Value::Float(-f)),
            _ => Err(format!(
                "TypeError: bad operand type for unary -: '{}'",
                type_name(v)
            )),
        },
        UnaryOp::Not => Ok(Value::Bool(!v.is_truthy())),
    }
}
