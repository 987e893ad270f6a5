// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Guest program container and the persisted code table.
//!
//! A [`Program`] is what the evaluator runs: code objects with their constant
//! pools, name tables and exception handler ranges. A [`CodeTable`] is the
//! subset persisted into a trace so replay can resolve names, lines and
//! constant display forms without re-loading the guest program.

use crate::format::{DecodeError, Reader, Writer};
use crate::opcode::Opcode;
use crate::value::Value;

/// Code object identifier (index into [`Program::codes`]).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct CodeId(pub u32);

/// Name identifier (index into a local or global name table).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct NameId(pub u32);

/// Constant pool identifier (index into [`CodeObject::consts`]).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConstId(pub u32);

/// Opaque host callable identifier (index into [`Program::builtins`]).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BuiltinId(pub u32);

/// One decoded guest instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Instr {
    /// Opcode.
    pub op: Opcode,
    /// Opcode argument (constant index, name index, target, arity...).
    pub arg: u32,
}

/// A `(instruction index, source line)` mapping entry.
///
/// Entries are sorted by instruction index; a lookup takes the last entry at
/// or before the queried offset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LineEntry {
    /// First instruction index covered by this entry.
    pub instr_index: u32,
    /// One-based source line.
    pub line: u32,
}

/// An exception handler range.
///
/// A fault at an instruction index in `[start, end)` unwinds the operand
/// stack to `stack_depth`, pushes the exception value and jumps to `target`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Inclusive start of the protected range.
    pub start: u32,
    /// Exclusive end of the protected range.
    pub end: u32,
    /// Handler entry instruction index.
    pub target: u32,
    /// Operand stack depth to unwind to before dispatch.
    pub stack_depth: u32,
}

/// An immutable guest code object.
#[derive(Clone, Debug, PartialEq)]
pub struct CodeObject {
    /// Function name (`<module>` for top-level code).
    pub name: String,
    /// Source file path.
    pub source_path: String,
    /// Number of leading `local_names` that are parameters.
    pub param_count: u32,
    /// Constant pool.
    pub consts: Vec<Value>,
    /// Local variable names.
    pub local_names: Vec<String>,
    /// Instruction stream.
    pub instrs: Vec<Instr>,
    /// Line table, sorted by instruction index.
    pub lines: Vec<LineEntry>,
    /// Exception handler ranges, innermost last.
    pub handlers: Vec<ExceptionHandler>,
}

impl CodeObject {
    /// Returns the source line for the instruction at `instr_index`.
    #[must_use]
    pub fn line_at(&self, instr_index: u32) -> Option<u32> {
        line_at(&self.lines, instr_index)
    }

    /// Returns the innermost handler protecting `instr_index`.
    #[must_use]
    pub fn handler_at(&self, instr_index: u32) -> Option<&ExceptionHandler> {
        self.handlers
            .iter()
            .rev()
            .find(|h| h.start <= instr_index && instr_index < h.end)
    }
}

fn line_at(lines: &[LineEntry], instr_index: u32) -> Option<u32> {
    match lines.binary_search_by_key(&instr_index, |e| e.instr_index) {
        Ok(i) => Some(lines[i].line),
        Err(0) => None,
        Err(i) => Some(lines[i - 1].line),
    }
}

/// A guest program: code objects plus module-level name tables.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Program {
    /// Code objects; [`CodeId`] indexes this list.
    pub codes: Vec<CodeObject>,
    /// Module-level (global) variable names.
    pub global_names: Vec<String>,
    /// Fully-qualified names of opaque host callables.
    pub builtins: Vec<String>,
}

impl Program {
    /// Returns the code object for `id`.
    #[must_use]
    pub fn code(&self, id: CodeId) -> Option<&CodeObject> {
        self.codes.get(id.0 as usize)
    }

    /// Returns the fully-qualified name of a host callable.
    #[must_use]
    pub fn builtin_name(&self, id: BuiltinId) -> Option<&str> {
        self.builtins.get(id.0 as usize).map(String::as_str)
    }

    /// Returns a global name by id.
    #[must_use]
    pub fn global_name(&self, id: NameId) -> Option<&str> {
        self.global_names.get(id.0 as usize).map(String::as_str)
    }
}

/// The persisted view of one code object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeEntry {
    /// Code id the entry describes.
    pub code_id: CodeId,
    /// Function name.
    pub name: String,
    /// Source file path.
    pub source_path: String,
    /// Number of leading locals that are parameters.
    pub param_count: u32,
    /// Local variable names.
    pub local_names: Vec<String>,
    /// Bounded display forms of the constant pool.
    pub const_reprs: Vec<String>,
    /// Line table.
    pub lines: Vec<LineEntry>,
}

impl CodeEntry {
    /// Builds the persisted view of `code`.
    #[must_use]
    pub fn from_code(code_id: CodeId, code: &CodeObject) -> Self {
        Self {
            code_id,
            name: code.name.clone(),
            source_path: code.source_path.clone(),
            param_count: code.param_count,
            local_names: code.local_names.clone(),
            const_reprs: code.consts.iter().map(Value::repr).collect(),
            lines: code.lines.clone(),
        }
    }

    /// Returns the local name for `id`.
    #[must_use]
    pub fn local_name(&self, id: NameId) -> Option<&str> {
        self.local_names.get(id.0 as usize).map(String::as_str)
    }

    /// Returns the source line for the instruction at `instr_index`.
    #[must_use]
    pub fn line_at(&self, instr_index: u32) -> Option<u32> {
        line_at(&self.lines, instr_index)
    }
}

/// The code table persisted at the tail of a trace file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodeTable {
    /// Module-level variable names shared by all entries.
    pub global_names: Vec<String>,
    /// Per-code entries, sorted by code id.
    pub entries: Vec<CodeEntry>,
}

impl CodeTable {
    /// Returns the entry for `id`.
    #[must_use]
    pub fn entry(&self, id: CodeId) -> Option<&CodeEntry> {
        self.entries
            .binary_search_by_key(&id, |e| e.code_id)
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Returns a global name by id.
    #[must_use]
    pub fn global_name(&self, id: NameId) -> Option<&str> {
        self.global_names.get(id.0 as usize).map(String::as_str)
    }

    /// Encodes the table into `w`.
    pub fn encode(&self, w: &mut Writer) {
        w.write_uleb128_u32(self.global_names.len() as u32);
        for name in &self.global_names {
            w.write_len_str(name);
        }
        w.write_uleb128_u32(self.entries.len() as u32);
        for e in &self.entries {
            w.write_u32_le(e.code_id.0);
            w.write_len_str(&e.name);
            w.write_len_str(&e.source_path);
            w.write_uleb128_u32(e.param_count);
            w.write_uleb128_u32(e.local_names.len() as u32);
            for n in &e.local_names {
                w.write_len_str(n);
            }
            w.write_uleb128_u32(e.const_reprs.len() as u32);
            for c in &e.const_reprs {
                w.write_len_str(c);
            }
            w.write_uleb128_u32(e.lines.len() as u32);
            for l in &e.lines {
                w.write_uleb128_u32(l.instr_index);
                w.write_uleb128_u32(l.line);
            }
        }
    }

    /// Decodes a table from `r`.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let global_count = r.read_uleb128_u32()? as usize;
        let mut global_names = Vec::with_capacity(global_count.min(1024));
        for _ in 0..global_count {
            global_names.push(r.read_len_str()?.to_string());
        }
        let entry_count = r.read_uleb128_u32()? as usize;
        let mut entries = Vec::with_capacity(entry_count.min(1024));
        for _ in 0..entry_count {
            let code_id = CodeId(r.read_u32_le()?);
            let name = r.read_len_str()?.to_string();
            let source_path = r.read_len_str()?.to_string();
            let param_count = r.read_uleb128_u32()?;
            let local_count = r.read_uleb128_u32()? as usize;
            let mut local_names = Vec::with_capacity(local_count.min(1024));
            for _ in 0..local_count {
                local_names.push(r.read_len_str()?.to_string());
            }
            let const_count = r.read_uleb128_u32()? as usize;
            let mut const_reprs = Vec::with_capacity(const_count.min(1024));
            for _ in 0..const_count {
                const_reprs.push(r.read_len_str()?.to_string());
            }
            let line_count = r.read_uleb128_u32()? as usize;
            let mut lines = Vec::with_capacity(line_count.min(4096));
            for _ in 0..line_count {
                lines.push(LineEntry {
                    instr_index: r.read_uleb128_u32()?,
                    line: r.read_uleb128_u32()?,
                });
            }
            entries.push(CodeEntry {
                code_id,
                name,
                source_path,
                param_count,
                local_names,
                const_reprs,
                lines,
            });
        }
        Ok(Self {
            global_names,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> CodeEntry {
        CodeEntry {
            code_id: CodeId(3),
            name: "compute".to_string(),
            source_path: "demo/compute.gx".to_string(),
            param_count: 1,
            local_names: vec!["x".to_string(), "acc".to_string()],
            const_reprs: vec!["30".to_string(), "0.01".to_string()],
            lines: vec![
                LineEntry { instr_index: 0, line: 1 },
                LineEntry { instr_index: 4, line: 2 },
            ],
        }
    }

    #[test]
    fn code_table_roundtrip() {
        let table = CodeTable {
            global_names: vec!["rate".to_string()],
            entries: vec![sample_entry()],
        };
        let mut w = Writer::new();
        table.encode(&mut w);
        let mut r = Reader::new(w.as_slice());
        let back = CodeTable::decode(&mut r).unwrap();
        assert_eq!(back, table);
        assert!(r.is_empty());
    }

    #[test]
    fn line_lookup_uses_last_entry_at_or_before() {
        let e = sample_entry();
        assert_eq!(e.line_at(0), Some(1));
        assert_eq!(e.line_at(3), Some(1));
        assert_eq!(e.line_at(4), Some(2));
        assert_eq!(e.line_at(100), Some(2));
    }

    #[test]
    fn handler_lookup_prefers_innermost() {
        let code = CodeObject {
            name: "f".to_string(),
            source_path: String::new(),
            param_count: 0,
            consts: vec![],
            local_names: vec![],
            instrs: vec![],
            lines: vec![],
            handlers: vec![
                ExceptionHandler { start: 0, end: 10, target: 10, stack_depth: 0 },
                ExceptionHandler { start: 2, end: 6, target: 12, stack_depth: 1 },
            ],
        };
        assert_eq!(code.handler_at(3).unwrap().target, 12);
        assert_eq!(code.handler_at(8).unwrap().target, 10);
        assert!(code.handler_at(11).is_none());
    }
}
