// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![allow(missing_docs, reason = "integration test crate")]

//! End-to-end scenarios: record a guest program, close the trace, reopen it
//! through the query service and check what provenance says about it.

use std::sync::Arc;

use origin_tape::asm::{Asm, ProgramBuilder};
use origin_tape::config::{per_process_path, ForkPolicy, RecorderConfig};
use origin_tape::host::{sig_hash, Host, HostError, NoHost, SigHash};
use origin_tape::opcode::{BinOp, Opcode};
use origin_tape::program::{CodeId, Program};
use origin_tape::query::{QueryService, SessionId};
use origin_tape::recorder::{RecordError, Recorder};
use origin_tape::replay::Trace;
use origin_tape::token::{Tok, TokKind};
use origin_tape::value::Value;
use origin_tape::vm::{Limits, Vm, VmError};
use origin_tape::writer::TraceWriter;

struct RandHost;

impl Host for RandHost {
    fn call(&mut self, symbol: &str, _sig: SigHash, _args: &[Value]) -> Result<Value, HostError> {
        match symbol {
            "random.randint" => Ok(Value::Int(57)),
            _ => Err(HostError::UnknownSymbol),
        }
    }
}

fn no_callback_config() -> RecorderConfig {
    RecorderConfig {
        callback_at: 0,
        ..RecorderConfig::default()
    }
}

/// Records `program` into a fresh trace file and returns the file (kept alive
/// by the tempdir) plus the VM outcome.
fn record<H: Host>(
    host: H,
    program: &Program,
    entry: CodeId,
) -> (tempfile::TempDir, std::path::PathBuf, Result<Value, VmError>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scenario.rtrc");
    let writer = Arc::new(TraceWriter::create(&path, ForkPolicy::Refuse).unwrap());
    let mut recorder = Recorder::new(writer.clone(), 0, &no_callback_config());
    let outcome = Vm::new(host, Limits::default()).run(program, entry, Some(&mut recorder));
    recorder.finish().unwrap();
    writer.close().unwrap();
    (dir, path, outcome)
}

fn open_session(service: &QueryService, path: &std::path::Path) -> SessionId {
    service.open_trace(path).unwrap().session_id
}

fn find_variable(service: &QueryService, session: SessionId, name: &str) -> Tok {
    let pattern = format!("^{name}$");
    let matches = service.search_variables(session, &pattern).unwrap();
    assert_eq!(matches.len(), 1, "expected exactly one binding for {name}");
    matches[0].tok
}

/// `a = 30; b = 0.01; c = a * b` — the chain from `c` runs through the
/// multiply, both loads, both stores, and ends at the two constants.
#[test]
fn constant_propagation_chain() {
    let mut asm = Asm::new("<module>", "scenario1.gx");
    asm.line(1);
    asm.load_const(Value::Int(30));
    asm.store_local("a");
    asm.line(2);
    asm.load_const(Value::Float(0.01));
    asm.store_local("b");
    asm.line(3);
    asm.load_local("a");
    asm.load_local("b");
    asm.binary(BinOp::Mul);
    asm.store_local("c");
    asm.load_const(Value::None);
    asm.ret();
    let mut pb = ProgramBuilder::new();
    let entry = pb.add(asm).unwrap();
    let program = pb.build().unwrap();

    let (_dir, path, outcome) = record(NoHost, &program, entry);
    assert_eq!(outcome.unwrap(), Value::None);

    let service = QueryService::new();
    let session = open_session(&service, &path);
    // Stop after `c` is bound but before the frame returns.
    service.run_to_instruction(session, 9).unwrap();

    let c_tok = find_variable(&service, session, "c");
    assert_eq!(c_tok, Tok::mint(0, 9));

    let chain = service.trace_provenance(session, c_tok, None).unwrap();
    assert_eq!(chain.nodes[0].info.tok, c_tok);
    // store c <- mul
    assert_eq!(chain.nodes[0].parents, vec![Tok::mint(0, 8)]);

    let mul = chain
        .nodes
        .iter()
        .find(|n| n.info.tok == Tok::mint(0, 8))
        .unwrap();
    assert_eq!(mul.info.opcode, Some(Opcode::Binary));
    assert_eq!(mul.info.line, Some(3));
    // mul <- load a, load b
    assert_eq!(mul.parents, vec![Tok::mint(0, 6), Tok::mint(0, 7)]);

    let load_a = chain
        .nodes
        .iter()
        .find(|n| n.info.tok == Tok::mint(0, 6))
        .unwrap();
    // load a <- store a
    assert_eq!(load_a.parents, vec![Tok::mint(0, 3)]);

    let store_a = chain
        .nodes
        .iter()
        .find(|n| n.info.tok == Tok::mint(0, 3))
        .unwrap();
    // store a <- const 30
    assert_eq!(store_a.parents, vec![Tok::mint(0, 2)]);

    let const_30 = chain
        .nodes
        .iter()
        .find(|n| n.info.tok == Tok::mint(0, 2))
        .unwrap();
    assert_eq!(const_30.info.kind, TokKind::Const);
    assert_eq!(const_30.info.line, Some(1));
    assert!(const_30.parents.is_empty());

    // The other branch terminates at the 0.01 constant.
    let const_001 = chain
        .nodes
        .iter()
        .find(|n| n.info.tok == Tok::mint(0, 4))
        .unwrap();
    assert_eq!(const_001.info.kind, TokKind::Const);

    let locals = service
        .inspect_stack(session, chain_frame(&service, session), 9)
        .unwrap();
    let c = locals.locals.iter().find(|l| l.name == "c").unwrap();
    assert_eq!(c.repr.as_deref(), Some("0.3"));
}

fn chain_frame(service: &QueryService, session: SessionId) -> origin_tape::token::FrameOrd {
    let frames = service.list_frames_at_step(session, 9).unwrap();
    frames[0].frame_ord
}

/// Chained multiplies: the back-walk from the final result must reach the
/// original `const 30` root.
#[test]
fn chained_multiply_reaches_root_const() {
    let mut asm = Asm::new("<module>", "scenario2.gx");
    asm.load_const(Value::Int(30));
    asm.store_local("a");
    asm.load_const(Value::Float(0.01));
    asm.store_local("b");
    asm.load_local("a");
    asm.load_local("b");
    asm.binary(BinOp::Mul);
    asm.store_local("c");
    asm.load_local("c");
    asm.load_const(Value::Float(0.9));
    asm.binary(BinOp::Mul);
    asm.load_const(Value::Float(0.85));
    asm.binary(BinOp::Mul);
    asm.store_local("d");
    asm.load_local("d");
    asm.ret();
    let mut pb = ProgramBuilder::new();
    let entry = pb.add(asm).unwrap();
    let program = pb.build().unwrap();

    let (_dir, path, outcome) = record(NoHost, &program, entry);
    assert_eq!(outcome.unwrap(), Value::Float(0.3 * 0.9 * 0.85));

    let service = QueryService::new();
    let session = open_session(&service, &path);
    service.run_to_instruction(session, 15).unwrap();

    let d_tok = find_variable(&service, session, "d");
    let chain = service.trace_provenance(session, d_tok, None).unwrap();

    // The root constant 30 is reachable and terminal.
    let root = chain
        .nodes
        .iter()
        .find(|n| n.info.tok == Tok::mint(0, 2))
        .expect("const 30 must be reachable from d");
    assert_eq!(root.info.kind, TokKind::Const);
    assert!(root.parents.is_empty());

    // Every visited parent is itself visited (the walk ran to the roots).
    let visited: Vec<Tok> = chain.nodes.iter().map(|n| n.info.tok).collect();
    for node in &chain.nodes {
        for p in &node.parents {
            assert!(visited.contains(p), "parent {p:?} missing from walk");
        }
    }
}

/// An opaque call's result is a provenance root tagged with the callee name
/// and signature hash.
#[test]
fn opaque_call_is_a_root() {
    let mut pb = ProgramBuilder::new();
    let randint = pb.builtin("random.randint");
    let mut asm = Asm::new("<module>", "scenario3.gx");
    asm.load_const(Value::Builtin(randint));
    asm.load_const(Value::Int(1));
    asm.load_const(Value::Int(100));
    asm.call(2);
    asm.store_local("r");
    asm.load_local("r");
    asm.ret();
    let entry = pb.add(asm).unwrap();
    let program = pb.build().unwrap();

    let (_dir, path, outcome) = record(RandHost, &program, entry);
    assert_eq!(outcome.unwrap(), Value::Int(57));

    let service = QueryService::new();
    let session = open_session(&service, &path);
    service.run_to_instruction(session, 6).unwrap();

    let r_tok = find_variable(&service, session, "r");
    let trace = Trace::open(&path).unwrap();
    let call_tok = trace.parents_of(r_tok).unwrap()[0];

    // The returned token has no parents; its metadata names the callee.
    assert_eq!(trace.parents_of(call_tok).unwrap(), Vec::<Tok>::new());
    let info = trace.tok_info(call_tok).unwrap();
    assert_eq!(info.kind, TokKind::External);
    let (callee, sig) = info.ext.expect("external root carries callee metadata");
    assert_eq!(callee, "random.randint");
    assert_eq!(
        sig,
        sig_hash("random.randint", &[Value::Int(1), Value::Int(100)])
    );
}

/// With `callback_at = 5` the callback fires exactly once at counter 5;
/// returning 10 re-arms it for exactly one more fire at counter 10.
#[test]
fn stepping_callback_rearms_at_returned_counter() {
    let mut asm = Asm::new("<module>", "scenario4.gx");
    for _ in 0..12 {
        asm.nop();
    }
    asm.load_const(Value::None);
    asm.ret();
    let mut pb = ProgramBuilder::new();
    let entry = pb.add(asm).unwrap();
    let program = pb.build().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scenario4.rtrc");
    let writer = Arc::new(TraceWriter::create(&path, ForkPolicy::Refuse).unwrap());
    let config = RecorderConfig {
        callback_at: 5,
        ..RecorderConfig::default()
    };
    let mut recorder = Recorder::new(writer.clone(), 0, &config);
    let fired = Arc::new(std::sync::Mutex::new(Vec::new()));
    let fired_in_cb = fired.clone();
    recorder.set_callback(Box::new(move |ctx| {
        let mut log = fired_in_cb.lock().unwrap();
        log.push(ctx.counter());
        if log.len() == 1 {
            Ok(Some(10))
        } else {
            Ok(None)
        }
    }));
    Vm::new(NoHost, Limits::default())
        .run(&program, entry, Some(&mut recorder))
        .unwrap();
    recorder.finish().unwrap();
    writer.close().unwrap();

    assert_eq!(*fired.lock().unwrap(), vec![5, 10]);
}

/// Fork policy `Refuse`: a forked child's first append is refused and the
/// parent's trace stays valid and complete.
#[test]
fn forked_child_is_refused() {
    let mut asm = Asm::new("<module>", "scenario5a.gx");
    asm.load_const(Value::Int(1));
    asm.store_local("a");
    asm.load_const(Value::None);
    asm.ret();
    let mut pb = ProgramBuilder::new();
    let entry = pb.add(asm).unwrap();
    let program = pb.build().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scenario5a.rtrc");
    let writer = Arc::new(TraceWriter::create(&path, ForkPolicy::Refuse).unwrap());
    let mut recorder = Recorder::new(writer.clone(), 0, &no_callback_config());
    Vm::new(NoHost, Limits::default())
        .run(&program, entry, Some(&mut recorder))
        .unwrap();
    recorder.finish().unwrap();
    writer.close().unwrap();

    // Pretend this writer was inherited across a fork.
    writer.override_owner_pid(std::process::id().wrapping_add(1));
    let mut child = Recorder::new(writer.clone(), 1, &no_callback_config());
    let err = child
        .enter_root(entry, program.code(entry).unwrap())
        .unwrap_err();
    assert!(matches!(err, RecordError::ForkedChild));

    // The parent's counters are all there.
    let trace = Trace::open(&path).unwrap();
    assert!(!trace.is_truncated());
    assert_eq!(trace.thread_ids(), vec![0]);
    assert_eq!(trace.max_counter(0), Some(5));
}

/// Fork policy `PerProcessFile`: the child transparently continues into
/// exactly one fresh per-process file; the parent file is untouched.
#[test]
fn forked_child_opens_per_process_file() {
    let mut asm = Asm::new("<module>", "scenario5b.gx");
    asm.load_const(Value::Int(1));
    asm.store_local("a");
    asm.load_const(Value::None);
    asm.ret();
    let mut pb = ProgramBuilder::new();
    let entry = pb.add(asm).unwrap();
    let program = pb.build().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scenario5b.rtrc");
    let writer = Arc::new(TraceWriter::create(&path, ForkPolicy::PerProcessFile).unwrap());
    let mut recorder = Recorder::new(writer.clone(), 0, &no_callback_config());
    Vm::new(NoHost, Limits::default())
        .run(&program, entry, Some(&mut recorder))
        .unwrap();
    recorder.finish().unwrap();
    writer.close().unwrap();

    // Pretend the fork happened; the child keeps recording.
    writer.override_owner_pid(std::process::id().wrapping_add(1));
    let mut child = Recorder::new(writer.clone(), 0, &no_callback_config());
    Vm::new(NoHost, Limits::default())
        .run(&program, entry, Some(&mut child))
        .unwrap();
    child.finish().unwrap();
    writer.close().unwrap();

    let child_path = per_process_path(&path, std::process::id());
    assert_eq!(writer.path(), child_path);
    let child_trace = Trace::open(&child_path).unwrap();
    assert_eq!(child_trace.max_counter(0), Some(5));

    // The parent trace was finalized before the fork and is still complete.
    let parent_trace = Trace::open(&path).unwrap();
    assert!(!parent_trace.is_truncated());
    assert_eq!(parent_trace.max_counter(0), Some(5));
}

/// Division by zero: the exception token's parents are both operands, and the
/// `except` binding resolves to the exception token.
#[test]
fn exception_parents_and_binding() {
    let mut asm = Asm::new("<module>", "scenario6.gx");
    let start = asm.label();
    let end = asm.label();
    let handler = asm.label();
    asm.handler(start, end, handler, 0);
    asm.place(start);
    asm.load_const(Value::Int(1));
    asm.load_const(Value::Int(0));
    asm.binary(BinOp::Div);
    asm.place(end);
    asm.ret();
    asm.place(handler);
    asm.store_local("e");
    asm.load_local("e");
    asm.ret();
    let mut pb = ProgramBuilder::new();
    let entry = pb.add(asm).unwrap();
    let program = pb.build().unwrap();

    let (_dir, path, outcome) = record(NoHost, &program, entry);
    assert_eq!(
        outcome.unwrap(),
        Value::str("ZeroDivisionError: division by zero")
    );

    let trace = Trace::open(&path).unwrap();
    // counters: 1 enter, 2 const 1, 3 const 0, 4 div (fault), 5 push-exc,
    // 6 store e, 7 load e, 8 ret
    let exc_tok = Tok::mint(0, 4);
    let info = trace.tok_info(exc_tok).unwrap();
    assert_eq!(info.kind, TokKind::Exception);
    assert_eq!(
        trace.parents_of(exc_tok).unwrap(),
        vec![Tok::mint(0, 2), Tok::mint(0, 3)]
    );

    let service = QueryService::new();
    let session = open_session(&service, &path);
    service.run_to_instruction(session, 6).unwrap();
    let e_tok = find_variable(&service, session, "e");
    assert_eq!(trace.parents_of(e_tok).unwrap(), vec![exc_tok]);
}

/// Frames, locals and source queries across an instrumented call.
#[test]
fn frames_and_locals_across_calls() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("prog.gx");
    std::fs::write(
        &source_path,
        "def scale(x):\n    return x * 2\n\ny = scale(21)\n",
    )
    .unwrap();
    let source = source_path.display().to_string();

    let mut pb = ProgramBuilder::new();
    let callee = pb.declare();
    let mut f = Asm::new("scale", &source);
    f.params(&["x"]).unwrap();
    f.line(2);
    f.load_local("x");
    f.load_const(Value::Int(2));
    f.binary(BinOp::Mul);
    f.ret();
    pb.define(callee, f).unwrap();

    let mut m = Asm::new("<module>", &source);
    m.line(4);
    m.load_const(Value::Func(callee));
    m.load_const(Value::Int(21));
    m.call(1);
    m.store_local("y");
    m.load_local("y");
    m.ret();
    let entry = pb.add(m).unwrap();
    let program = pb.build().unwrap();

    let (_trace_dir, path, outcome) = record(NoHost, &program, entry);
    assert_eq!(outcome.unwrap(), Value::Int(42));

    let service = QueryService::new();
    let session = open_session(&service, &path);

    // counters: 1 enter module, 2 func const, 3 const 21, 4 call, 5 enter
    // scale, 6 load x, 7 const 2, 8 mul, 9 ret, 10 store y, 11 load y, 12 ret
    let frames = service.list_frames_at_step(session, 7).unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].function, "scale");
    assert_eq!(frames[1].function, "<module>");
    assert_eq!(frames[0].parent, Some(frames[1].frame_ord));
    assert_eq!(frames[0].line, Some(2));

    // Records serialize as-is for the outer shell.
    let json = serde_json::to_string(&frames).unwrap();
    assert!(json.contains("\"function\":\"scale\""));

    let locals = service
        .inspect_stack(session, frames[0].frame_ord, 7)
        .unwrap();
    let x = locals.locals.iter().find(|l| l.name == "x").unwrap();
    assert_eq!(x.repr.as_deref(), Some("21"));

    // The parameter re-binds the caller's argument: its chain reaches the
    // const 21 the module loaded.
    let chain = service.trace_provenance(session, x.tok, None).unwrap();
    assert!(chain.nodes.iter().any(|n| n.info.kind == TokKind::Const));

    // `y` is bound from the callee's returned value.
    service.run_to_instruction(session, 10).unwrap();
    let y_tok = find_variable(&service, session, "y");
    let trace = Trace::open(&path).unwrap();
    let ret_tok = trace.parents_of(y_tok).unwrap()[0];
    assert_eq!(ret_tok, Tok::mint(0, 9));
    assert_eq!(trace.parents_of(ret_tok).unwrap(), vec![Tok::mint(0, 8)]);

    let src = service.get_source(session, callee, 2, 1).unwrap();
    assert_eq!(src.lines.len(), 3);
    assert!(src.lines[1].current);
    assert_eq!(src.lines[1].content, "    return x * 2");

    let summary = service.execution_summary(session).unwrap();
    assert_eq!(summary.max_counter, 12);
    assert_eq!(summary.thread_ids, vec![0]);
    assert!(!summary.truncated);

    let sessions = service.list_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, session);

    service.close_trace(session).unwrap();
    assert!(service.list_sessions().is_empty());
}

/// Counters outside the trace are caller-visible errors, not panics.
#[test]
fn out_of_range_queries_are_reported() {
    let mut asm = Asm::new("<module>", "oor.gx");
    asm.load_const(Value::None);
    asm.ret();
    let mut pb = ProgramBuilder::new();
    let entry = pb.add(asm).unwrap();
    let program = pb.build().unwrap();

    let (_dir, path, _) = record(NoHost, &program, entry);
    let service = QueryService::new();
    let session = open_session(&service, &path);

    // run_to clamps...
    let run = service.run_to_instruction(session, 1_000).unwrap();
    assert_eq!(run.stopped_at, 3);
    // ...but state queries at missing counters fail.
    assert!(service.list_frames_at_step(session, 1_000).is_err());

    let trace = Trace::open(&path).unwrap();
    assert!(trace.parents_of(Tok::mint(0, 999)).is_err());
    assert!(trace.parents_of(Tok::NONE).is_err());
}

/// Unpacking mints one token per element: all resolve to the unpack event,
/// the index tells element origins apart.
#[test]
fn unpack_elements_get_indexed_tokens() {
    let mut asm = Asm::new("<module>", "unpack.gx");
    asm.load_const(Value::Int(1));
    asm.load_const(Value::Int(2));
    asm.build_tuple(2);
    asm.unpack(2);
    asm.store_local("right");
    asm.store_local("left");
    asm.load_const(Value::None);
    asm.ret();
    let mut pb = ProgramBuilder::new();
    let entry = pb.add(asm).unwrap();
    let program = pb.build().unwrap();

    let (_dir, path, _) = record(NoHost, &program, entry);
    let service = QueryService::new();
    let session = open_session(&service, &path);
    // counters: 1 enter, 2 const, 3 const, 4 build, 5 unpack, 6 store right,
    // 7 store left
    service.run_to_instruction(session, 7).unwrap();

    let left = find_variable(&service, session, "left");
    let right = find_variable(&service, session, "right");
    let trace = Trace::open(&path).unwrap();
    // Elements push left-to-right, so `right` (stored first) took the top of
    // stack: element 1.
    let left_src = trace.parents_of(left).unwrap()[0];
    let right_src = trace.parents_of(right).unwrap()[0];
    assert_ne!(left_src, right_src);
    assert_eq!(left_src, Tok::mint_indexed(0, 5, 0));
    assert_eq!(right_src, Tok::mint_indexed(0, 5, 1));
    // Every element chains to the tuple the unpack exploded.
    assert_eq!(trace.parents_of(left_src).unwrap(), vec![Tok::mint(0, 4)]);
    assert_eq!(trace.parents_of(right_src).unwrap(), vec![Tok::mint(0, 4)]);
}
