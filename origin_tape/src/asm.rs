// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Guest bytecode builder.
//!
//! A small, public helper for constructing [`Program`]s without hand-counting
//! instruction indexes: labels resolve jump targets, names intern themselves,
//! and exception handler ranges are declared with the same labels.

use std::collections::HashMap;

use thiserror::Error;

use crate::opcode::{BinOp, Opcode, UnaryOp};
use crate::program::{
    BuiltinId, CodeId, CodeObject, ExceptionHandler, Instr, LineEntry, NameId, Program,
};
use crate::value::Value;

/// A control-flow label.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// A bytecode builder error.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AsmError {
    /// A label was referenced or used in a handler but never placed.
    #[error("label was referenced but never placed")]
    UnresolvedLabel,
    /// Parameters must be declared before any other local.
    #[error("parameters declared after other locals")]
    ParamsNotFirst,
}

/// A [`ProgramBuilder`] error.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BuildError {
    /// A code id was declared but never defined.
    #[error("missing body for code id {0}")]
    MissingBody(u32),
    /// A code body failed to assemble.
    #[error(transparent)]
    Asm(#[from] AsmError),
}

#[derive(Clone, Debug)]
struct HandlerDecl {
    start: Label,
    end: Label,
    target: Label,
    stack_depth: u32,
}

/// Builder for one code object.
#[derive(Debug)]
pub struct Asm {
    name: String,
    source_path: String,
    param_count: u32,
    consts: Vec<Value>,
    local_names: Vec<String>,
    local_index: HashMap<String, u32>,
    instrs: Vec<Instr>,
    lines: Vec<LineEntry>,
    labels: Vec<Option<u32>>,
    // Instruction indexes whose arg is a label to resolve.
    patches: Vec<usize>,
    handlers: Vec<HandlerDecl>,
    params_ok: bool,
}

impl Asm {
    /// Creates a builder for a code object called `name` in `source_path`.
    #[must_use]
    pub fn new(name: &str, source_path: &str) -> Self {
        Self {
            name: name.to_string(),
            source_path: source_path.to_string(),
            param_count: 0,
            consts: Vec::new(),
            local_names: Vec::new(),
            local_index: HashMap::new(),
            instrs: Vec::new(),
            lines: Vec::new(),
            labels: Vec::new(),
            patches: Vec::new(),
            handlers: Vec::new(),
            params_ok: true,
        }
    }

    /// Declares the parameters; must precede any other local use.
    pub fn params(&mut self, names: &[&str]) -> Result<(), AsmError> {
        if !self.params_ok || !self.local_names.is_empty() {
            return Err(AsmError::ParamsNotFirst);
        }
        for n in names {
            self.intern_local(n);
        }
        self.param_count = names.len() as u32;
        self.params_ok = false;
        Ok(())
    }

    /// Interns a local name.
    pub fn local(&mut self, name: &str) -> NameId {
        NameId(self.intern_local(name))
    }

    fn intern_local(&mut self, name: &str) -> u32 {
        if let Some(&ix) = self.local_index.get(name) {
            return ix;
        }
        let ix = self.local_names.len() as u32;
        self.local_names.push(name.to_string());
        self.local_index.insert(name.to_string(), ix);
        ix
    }

    /// Marks subsequent instructions as coming from source `line`.
    pub fn line(&mut self, line: u32) {
        let instr_index = self.instrs.len() as u32;
        if let Some(last) = self.lines.last_mut() {
            if last.instr_index == instr_index {
                last.line = line;
                return;
            }
            if last.line == line {
                return;
            }
        }
        self.lines.push(LineEntry { instr_index, line });
    }

    /// Creates an unplaced label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Places `label` at the next instruction.
    pub fn place(&mut self, label: Label) {
        self.labels[label.0] = Some(self.instrs.len() as u32);
    }

    /// Declares an exception handler: faults between `start` and `end` unwind
    /// the operand stack to `stack_depth`, push the exception and jump to
    /// `target`.
    pub fn handler(&mut self, start: Label, end: Label, target: Label, stack_depth: u32) {
        self.handlers.push(HandlerDecl {
            start,
            end,
            target,
            stack_depth,
        });
    }

    fn emit(&mut self, op: Opcode, arg: u32) {
        self.instrs.push(Instr { op, arg });
    }

    fn emit_label(&mut self, op: Opcode, label: Label) {
        self.patches.push(self.instrs.len());
        self.instrs.push(Instr {
            op,
            arg: label.0 as u32,
        });
    }

    /// `nop`.
    pub fn nop(&mut self) {
        self.emit(Opcode::Nop, 0);
    }

    /// Pushes `value` from the constant pool (interned by equality).
    pub fn load_const(&mut self, value: Value) {
        let ix = self
            .consts
            .iter()
            .position(|c| c == &value)
            .unwrap_or_else(|| {
                self.consts.push(value);
                self.consts.len() - 1
            });
        self.emit(Opcode::LoadConst, ix as u32);
    }

    /// Pushes local `name`.
    pub fn load_local(&mut self, name: &str) {
        let ix = self.intern_local(name);
        self.emit(Opcode::LoadLocal, ix);
    }

    /// Pops into local `name`.
    pub fn store_local(&mut self, name: &str) {
        let ix = self.intern_local(name);
        self.emit(Opcode::StoreLocal, ix);
    }

    /// Pushes module-level binding `name`.
    pub fn load_global(&mut self, name: NameId) {
        self.emit(Opcode::LoadGlobal, name.0);
    }

    /// Pops into module-level binding `name`.
    pub fn store_global(&mut self, name: NameId) {
        self.emit(Opcode::StoreGlobal, name.0);
    }

    /// Pops and discards the top of stack.
    pub fn pop(&mut self) {
        self.emit(Opcode::Pop, 0);
    }

    /// Pushes a copy of the entry `depth` from the top (1 = top).
    pub fn copy(&mut self, depth: u32) {
        self.emit(Opcode::Copy, depth);
    }

    /// Swaps the top with the entry `depth` from the top.
    pub fn swap(&mut self, depth: u32) {
        self.emit(Opcode::Swap, depth);
    }

    /// Binary operator.
    pub fn binary(&mut self, op: BinOp) {
        self.emit(Opcode::Binary, op as u32);
    }

    /// Unary operator.
    pub fn unary(&mut self, op: UnaryOp) {
        self.emit(Opcode::Unary, op as u32);
    }

    /// Pops `n` values, pushes a tuple.
    pub fn build_tuple(&mut self, n: u32) {
        self.emit(Opcode::BuildTuple, n);
    }

    /// Pops a sequence, pushes its `n` elements.
    pub fn unpack(&mut self, n: u32) {
        self.emit(Opcode::UnpackSeq, n);
    }

    /// Unconditional jump.
    pub fn jump(&mut self, target: Label) {
        self.emit_label(Opcode::Jump, target);
    }

    /// Pops; jumps when falsy.
    pub fn branch_if_false(&mut self, target: Label) {
        self.emit_label(Opcode::BranchIfFalse, target);
    }

    /// Pops; jumps when truthy.
    pub fn branch_if_true(&mut self, target: Label) {
        self.emit_label(Opcode::BranchIfTrue, target);
    }

    /// Pops `argc` arguments and a callee, pushes the result.
    pub fn call(&mut self, argc: u32) {
        self.emit(Opcode::Call, argc);
    }

    /// Pops the return value and leaves the frame.
    pub fn ret(&mut self) {
        self.emit(Opcode::Return, 0);
    }

    /// Pops an exception value and raises it.
    pub fn raise(&mut self) {
        self.emit(Opcode::Raise, 0);
    }

    fn resolve(&self, label_ix: u32) -> Result<u32, AsmError> {
        self.labels
            .get(label_ix as usize)
            .copied()
            .flatten()
            .ok_or(AsmError::UnresolvedLabel)
    }

    fn finish(mut self) -> Result<CodeObject, AsmError> {
        let patches = std::mem::take(&mut self.patches);
        for ix in patches {
            let target = self.resolve(self.instrs[ix].arg)?;
            self.instrs[ix].arg = target;
        }
        let mut handlers = Vec::with_capacity(self.handlers.len());
        for h in &self.handlers {
            handlers.push(ExceptionHandler {
                start: self.resolve(h.start.0 as u32)?,
                end: self.resolve(h.end.0 as u32)?,
                target: self.resolve(h.target.0 as u32)?,
                stack_depth: h.stack_depth,
            });
        }
        Ok(CodeObject {
            name: self.name,
            source_path: self.source_path,
            param_count: self.param_count,
            consts: self.consts,
            local_names: self.local_names,
            instrs: self.instrs,
            lines: self.lines,
            handlers,
        })
    }
}

/// Builder for a whole guest program.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    codes: Vec<Option<CodeObject>>,
    global_names: Vec<String>,
    global_index: HashMap<String, u32>,
    builtins: Vec<String>,
    builtin_index: HashMap<String, u32>,
}

impl ProgramBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a module-level name.
    pub fn global(&mut self, name: &str) -> NameId {
        if let Some(&ix) = self.global_index.get(name) {
            return NameId(ix);
        }
        let ix = self.global_names.len() as u32;
        self.global_names.push(name.to_string());
        self.global_index.insert(name.to_string(), ix);
        NameId(ix)
    }

    /// Interns an opaque host callable by its fully-qualified name.
    pub fn builtin(&mut self, name: &str) -> BuiltinId {
        if let Some(&ix) = self.builtin_index.get(name) {
            return BuiltinId(ix);
        }
        let ix = self.builtins.len() as u32;
        self.builtins.push(name.to_string());
        self.builtin_index.insert(name.to_string(), ix);
        BuiltinId(ix)
    }

    /// Reserves a code id so code objects can reference each other.
    pub fn declare(&mut self) -> CodeId {
        self.codes.push(None);
        CodeId(self.codes.len() as u32 - 1)
    }

    /// Defines the body for a declared code id.
    pub fn define(&mut self, id: CodeId, asm: Asm) -> Result<(), AsmError> {
        let code = asm.finish()?;
        self.codes[id.0 as usize] = Some(code);
        Ok(())
    }

    /// Declares and defines in one step.
    pub fn add(&mut self, asm: Asm) -> Result<CodeId, AsmError> {
        let id = self.declare();
        self.define(id, asm)?;
        Ok(id)
    }

    /// Builds the program.
    pub fn build(self) -> Result<Program, BuildError> {
        let mut codes = Vec::with_capacity(self.codes.len());
        for (ix, slot) in self.codes.into_iter().enumerate() {
            codes.push(slot.ok_or(BuildError::MissingBody(ix as u32))?);
        }
        Ok(Program {
            codes,
            global_names: self.global_names,
            builtins: self.builtins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_resolve_to_instruction_indexes() {
        let mut a = Asm::new("f", "f.gx");
        let done = a.label();
        a.load_const(Value::Bool(true));
        a.branch_if_false(done);
        a.load_const(Value::Int(1));
        a.place(done);
        a.ret();
        let code = a.finish().unwrap();
        assert_eq!(code.instrs[1].op, Opcode::BranchIfFalse);
        assert_eq!(code.instrs[1].arg, 3);
    }

    #[test]
    fn unplaced_label_is_an_error() {
        let mut a = Asm::new("f", "f.gx");
        let nowhere = a.label();
        a.jump(nowhere);
        assert_eq!(a.finish().unwrap_err(), AsmError::UnresolvedLabel);
    }

    #[test]
    fn consts_are_interned_by_equality() {
        let mut a = Asm::new("f", "f.gx");
        a.load_const(Value::Int(30));
        a.load_const(Value::Int(30));
        a.load_const(Value::Float(0.01));
        a.ret();
        let code = a.finish().unwrap();
        assert_eq!(code.consts.len(), 2);
    }

    #[test]
    fn params_must_come_first() {
        let mut a = Asm::new("f", "f.gx");
        a.load_local("x");
        assert_eq!(a.params(&["y"]).unwrap_err(), AsmError::ParamsNotFirst);
    }

    #[test]
    fn builder_resolves_declared_codes() {
        let mut pb = ProgramBuilder::new();
        let callee = pb.declare();
        let mut main = Asm::new("<module>", "m.gx");
        main.load_const(Value::Func(callee));
        main.load_const(Value::Int(1));
        main.call(1);
        main.ret();
        let main_id = pb.add(main).unwrap();

        let mut f = Asm::new("f", "m.gx");
        f.params(&["x"]).unwrap();
        f.load_local("x");
        f.ret();
        pb.define(callee, f).unwrap();

        let program = pb.build().unwrap();
        assert_eq!(program.codes.len(), 2);
        assert_eq!(program.code(main_id).unwrap().name, "<module>");
        assert_eq!(program.code(callee).unwrap().param_count, 1);
    }
}
