// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Wire codec for trace events.
//!
//! Each record is framed as `tag | body_len | body | crc32`. The tag's low
//! nibble is the record kind; the high nibble is the count of fixed-prefix
//! varint fields, so readers can describe records they do not understand.
//! Readers skip unknown kinds by `body_len` and ignore unknown trailing body
//! bytes, which is how newer writers stay readable.
//!
//! Tokens are encoded as `(thread, index-and-counter)` varint pairs rather
//! than raw 64-bit values; both components are small in practice.

use crate::event::{
    AbortEvent, Binding, BindingScope, EnterEvent, ExternalCall, InstructionEvent, TraceEvent,
};
use crate::format::{crc32, DecodeError, Reader, Writer};
use crate::host::SigHash;
use crate::opcode::Opcode;
use crate::program::{CodeId, NameId};
use crate::token::{FrameOrd, Tok};

/// Record kind for [`InstructionEvent`].
pub const KIND_INSTR: u8 = 1;
/// Record kind for [`EnterEvent`].
pub const KIND_ENTER: u8 = 2;
/// Record kind for [`AbortEvent`].
pub const KIND_ABORT: u8 = 3;

const INSTR_PREFIX_FIELDS: u8 = 8;
const ENTER_PREFIX_FIELDS: u8 = 6;
const ABORT_PREFIX_FIELDS: u8 = 2;

const FLAG_FAULT: u8 = 1 << 0;
const FLAG_EXT: u8 = 1 << 1;

const BINDING_SCOPE_GLOBAL: u8 = 1 << 0;
const BINDING_HAS_REPR: u8 = 1 << 1;

/// A decoded record plus its encoded length.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedRecord {
    /// The record, or `None` for a well-formed record of an unknown kind.
    pub event: Option<TraceEvent>,
    /// Total encoded length including tag, length, body and checksum.
    pub byte_len: usize,
}

fn write_tok(w: &mut Writer, tok: Tok) {
    w.write_uleb128_u32(u32::from(tok.thread_id()));
    // Index and counter travel together; the index is zero for all but
    // multi-product (unpack) events, so this usually costs nothing extra.
    w.write_uleb128_u64(tok.sequence_bits());
}

fn read_tok(r: &mut Reader<'_>) -> Result<Tok, DecodeError> {
    let thread = r.read_uleb128_u32()?;
    let thread = u16::try_from(thread).map_err(|_| DecodeError::OutOfBounds)?;
    let seq = r.read_uleb128_u64()?;
    Ok(Tok::from_parts(thread, seq))
}

fn write_toks(w: &mut Writer, toks: &[Tok]) {
    w.write_uleb128_u32(toks.len() as u32);
    for &t in toks {
        write_tok(w, t);
    }
}

fn read_toks(r: &mut Reader<'_>) -> Result<Vec<Tok>, DecodeError> {
    let n = r.read_uleb128_u32()? as usize;
    let mut toks = Vec::with_capacity(n.min(1024));
    for _ in 0..n {
        toks.push(read_tok(r)?);
    }
    Ok(toks)
}

fn write_bindings(w: &mut Writer, bindings: &[Binding]) {
    w.write_uleb128_u32(bindings.len() as u32);
    for b in bindings {
        let mut flags = 0u8;
        if b.scope == BindingScope::Global {
            flags |= BINDING_SCOPE_GLOBAL;
        }
        if b.repr.is_some() {
            flags |= BINDING_HAS_REPR;
        }
        w.write_u8(flags);
        w.write_uleb128_u32(b.name.0);
        write_tok(w, b.tok);
        if let Some(repr) = &b.repr {
            w.write_len_str(repr);
        }
    }
}

fn read_bindings(r: &mut Reader<'_>) -> Result<Vec<Binding>, DecodeError> {
    let n = r.read_uleb128_u32()? as usize;
    let mut bindings = Vec::with_capacity(n.min(1024));
    for _ in 0..n {
        let flags = r.read_u8()?;
        let name = NameId(r.read_uleb128_u32()?);
        let tok = read_tok(r)?;
        let repr = if flags & BINDING_HAS_REPR != 0 {
            Some(Box::<str>::from(r.read_len_str()?))
        } else {
            None
        };
        bindings.push(Binding {
            scope: if flags & BINDING_SCOPE_GLOBAL != 0 {
                BindingScope::Global
            } else {
                BindingScope::Local
            },
            name,
            tok,
            repr,
        });
    }
    Ok(bindings)
}

fn encode_instr_body(e: &InstructionEvent, w: &mut Writer) {
    w.write_uleb128_u64(e.counter);
    w.write_uleb128_u64(e.frame_ord.raw());
    w.write_uleb128_u32(u32::from(e.thread_id));
    w.write_uleb128_u32(u32::from(e.opcode as u16));
    w.write_uleb128_u32(e.arg);
    w.write_uleb128_u32(e.code_id.0);
    w.write_uleb128_u32(e.instr_offset);
    let mut flags = 0u8;
    if e.fault {
        flags |= FLAG_FAULT;
    }
    if e.ext.is_some() {
        flags |= FLAG_EXT;
    }
    w.write_u8(flags);
    write_toks(w, &e.consumed);
    write_toks(w, &e.produced);
    write_bindings(w, &e.reads);
    write_bindings(w, &e.writes);
    if let Some(ext) = &e.ext {
        w.write_len_str(&ext.callee_name);
        w.write_u64_le(ext.sig_hash.0);
    }
}

fn decode_instr_body(r: &mut Reader<'_>) -> Result<InstructionEvent, DecodeError> {
    let counter = r.read_uleb128_u64()?;
    let frame_ord = FrameOrd::from_raw(r.read_uleb128_u64()?);
    let thread_id =
        u16::try_from(r.read_uleb128_u32()?).map_err(|_| DecodeError::OutOfBounds)?;
    let opcode_raw =
        u16::try_from(r.read_uleb128_u32()?).map_err(|_| DecodeError::OutOfBounds)?;
    let opcode = Opcode::from_u16(opcode_raw).ok_or(DecodeError::OutOfBounds)?;
    let arg = r.read_uleb128_u32()?;
    let code_id = CodeId(r.read_uleb128_u32()?);
    let instr_offset = r.read_uleb128_u32()?;
    let flags = r.read_u8()?;
    let consumed = read_toks(r)?;
    let produced = read_toks(r)?;
    let reads = read_bindings(r)?;
    let writes = read_bindings(r)?;
    let ext = if flags & FLAG_EXT != 0 {
        let callee_name = Box::<str>::from(r.read_len_str()?);
        let sig_hash = SigHash(r.read_u64_le()?);
        Some(ExternalCall {
            callee_name,
            sig_hash,
        })
    } else {
        None
    };
    Ok(InstructionEvent {
        counter,
        frame_ord,
        thread_id,
        opcode,
        arg,
        code_id,
        instr_offset,
        fault: flags & FLAG_FAULT != 0,
        consumed,
        produced,
        reads,
        writes,
        ext,
    })
}

fn encode_enter_body(e: &EnterEvent, w: &mut Writer) {
    w.write_uleb128_u64(e.counter);
    w.write_uleb128_u64(e.frame_ord.raw());
    w.write_uleb128_u32(u32::from(e.thread_id));
    w.write_uleb128_u32(e.code_id.0);
    // Parent is biased by one so "no parent" encodes as zero.
    w.write_uleb128_u64(e.parent.map_or(0, |p| p.raw() + 1));
    w.write_u8(0);
    write_toks(w, &e.args);
    write_bindings(w, &e.writes);
}

fn decode_enter_body(r: &mut Reader<'_>) -> Result<EnterEvent, DecodeError> {
    let counter = r.read_uleb128_u64()?;
    let frame_ord = FrameOrd::from_raw(r.read_uleb128_u64()?);
    let thread_id =
        u16::try_from(r.read_uleb128_u32()?).map_err(|_| DecodeError::OutOfBounds)?;
    let code_id = CodeId(r.read_uleb128_u32()?);
    let parent_raw = r.read_uleb128_u64()?;
    let parent = if parent_raw == 0 {
        None
    } else {
        Some(FrameOrd::from_raw(parent_raw - 1))
    };
    let _flags = r.read_u8()?;
    let args = read_toks(r)?;
    let writes = read_bindings(r)?;
    Ok(EnterEvent {
        counter,
        frame_ord,
        thread_id,
        code_id,
        parent,
        args,
        writes,
    })
}

fn encode_abort_body(e: &AbortEvent, w: &mut Writer) {
    w.write_uleb128_u64(e.counter);
    w.write_uleb128_u32(u32::from(e.thread_id));
    w.write_len_str(&e.reason);
}

fn decode_abort_body(r: &mut Reader<'_>) -> Result<AbortEvent, DecodeError> {
    let counter = r.read_uleb128_u64()?;
    let thread_id =
        u16::try_from(r.read_uleb128_u32()?).map_err(|_| DecodeError::OutOfBounds)?;
    let reason = Box::<str>::from(r.read_len_str()?);
    Ok(AbortEvent {
        counter,
        thread_id,
        reason,
    })
}

/// Encodes one record into `out`.
pub fn encode_event(event: &TraceEvent, out: &mut Writer) {
    let mut body = Writer::new();
    let tag = match event {
        TraceEvent::Instr(e) => {
            encode_instr_body(e, &mut body);
            KIND_INSTR | (INSTR_PREFIX_FIELDS << 4)
        }
        TraceEvent::Enter(e) => {
            encode_enter_body(e, &mut body);
            KIND_ENTER | (ENTER_PREFIX_FIELDS << 4)
        }
        TraceEvent::Abort(e) => {
            encode_abort_body(e, &mut body);
            KIND_ABORT | (ABORT_PREFIX_FIELDS << 4)
        }
    };

    let start = out.len();
    out.write_u8(tag);
    out.write_uleb128_u32(body.len() as u32);
    out.write_bytes(body.as_slice());
    let crc = crc32(&out.as_slice()[start..]);
    out.write_u32_le(crc);
}

/// Decodes one record from the start of `bytes`.
///
/// `file_offset` is the position of `bytes[0]` in the containing file and is
/// only used for error reporting.
pub fn decode_event(bytes: &[u8], file_offset: u64) -> Result<DecodedRecord, DecodeError> {
    let mut r = Reader::new(bytes);
    let tag = r.read_u8()?;
    let body_len = r.read_uleb128_u32()? as usize;
    let body_start = r.offset();
    let body = r.read_bytes(body_len)?;
    let checked_len = body_start + body_len;
    let stored_crc = r.read_u32_le()?;
    if crc32(&bytes[..checked_len]) != stored_crc {
        return Err(DecodeError::ChecksumMismatch {
            offset: file_offset,
        });
    }

    let mut body_r = Reader::new(body);
    let event = match tag & 0x0F {
        KIND_INSTR => Some(TraceEvent::Instr(decode_instr_body(&mut body_r)?)),
        KIND_ENTER => Some(TraceEvent::Enter(decode_enter_body(&mut body_r)?)),
        KIND_ABORT => Some(TraceEvent::Abort(decode_abort_body(&mut body_r)?)),
        // Unknown kind: the tag's arity hint and the length prefix describe
        // the record well enough to step over it.
        _ => None,
    };
    // Trailing body bytes belong to a newer writer; ignore them.

    Ok(DecodedRecord {
        event,
        byte_len: r.offset(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_instr() -> TraceEvent {
        TraceEvent::Instr(InstructionEvent {
            counter: 42,
            frame_ord: FrameOrd::new(0, 2),
            thread_id: 0,
            opcode: Opcode::Binary,
            arg: 2,
            code_id: CodeId(1),
            instr_offset: 7,
            fault: false,
            consumed: vec![Tok::mint(0, 40), Tok::mint(0, 41)],
            produced: vec![Tok::mint(0, 42)],
            reads: vec![],
            writes: vec![Binding {
                scope: BindingScope::Local,
                name: NameId(3),
                tok: Tok::mint(0, 42),
                repr: Some("0.3".into()),
            }],
            ext: None,
        })
    }

    #[test]
    fn instr_roundtrip() {
        let event = sample_instr();
        let mut w = Writer::new();
        encode_event(&event, &mut w);
        let decoded = decode_event(w.as_slice(), 0).unwrap();
        assert_eq!(decoded.byte_len, w.len());
        assert_eq!(decoded.event, Some(event));
    }

    #[test]
    fn enter_roundtrip_without_parent() {
        let event = TraceEvent::Enter(EnterEvent {
            counter: 1,
            frame_ord: FrameOrd::new(0, 0),
            thread_id: 0,
            code_id: CodeId(0),
            parent: None,
            args: vec![],
            writes: vec![],
        });
        let mut w = Writer::new();
        encode_event(&event, &mut w);
        let decoded = decode_event(w.as_slice(), 0).unwrap();
        assert_eq!(decoded.event, Some(event));
    }

    #[test]
    fn abort_roundtrip() {
        let event = TraceEvent::Abort(AbortEvent {
            counter: 9,
            thread_id: 4,
            reason: "forked-child".into(),
        });
        let mut w = Writer::new();
        encode_event(&event, &mut w);
        let decoded = decode_event(w.as_slice(), 0).unwrap();
        assert_eq!(decoded.event, Some(event));
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let mut w = Writer::new();
        encode_event(&sample_instr(), &mut w);
        let mut bytes = w.into_vec();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        let err = decode_event(&bytes, 128).unwrap_err();
        assert!(matches!(err, DecodeError::ChecksumMismatch { offset: 128 }));
    }

    #[test]
    fn unknown_kind_is_skipped_not_rejected() {
        let mut w = Writer::new();
        let start = w.len();
        w.write_u8(0x0F | (2 << 4));
        let mut body = Writer::new();
        body.write_uleb128_u64(5);
        body.write_uleb128_u64(6);
        w.write_uleb128_u32(body.len() as u32);
        w.write_bytes(body.as_slice());
        let crc = crc32(&w.as_slice()[start..]);
        w.write_u32_le(crc);

        let decoded = decode_event(w.as_slice(), 0).unwrap();
        assert_eq!(decoded.event, None);
        assert_eq!(decoded.byte_len, w.len());
    }

    #[test]
    fn unknown_trailing_fields_are_tolerated() {
        let event = sample_instr();
        let mut body = Writer::new();
        if let TraceEvent::Instr(e) = &event {
            encode_instr_body(e, &mut body);
        }
        // A future writer appended an extra field.
        body.write_uleb128_u64(0xDEAD);

        let mut w = Writer::new();
        w.write_u8(KIND_INSTR | (INSTR_PREFIX_FIELDS << 4));
        w.write_uleb128_u32(body.len() as u32);
        w.write_bytes(body.as_slice());
        let crc = crc32(w.as_slice());
        w.write_u32_le(crc);

        let decoded = decode_event(w.as_slice(), 0).unwrap();
        assert_eq!(decoded.event, Some(event));
    }
}
