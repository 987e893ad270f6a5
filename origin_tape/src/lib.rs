// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `origin_tape`: a record-and-replay provenance engine for a
//! dynamically-typed bytecode guest.
//!
//! The recorder observes every instruction a guest program executes, assigns
//! each produced value a unique origin token, propagates tokens through the
//! operand stack and local bindings in lock-step with the evaluator, and
//! appends an event log that can later be queried offline: *which
//! instruction first produced this value, and what values fed into it?*
//!
//! Three layers:
//! - recording: [`vm::Vm`] (the bundled guest evaluator) drives a
//!   [`recorder::Recorder`] which appends events through a
//!   [`writer::TraceWriter`];
//! - replay: [`replay::Trace`] loads a persisted log, [`replay::ReplayCursor`]
//!   reconstructs frame and binding state at any counter;
//! - queries: [`query::QueryService`] exposes the session-keyed operations
//!   consumed by an outer shell.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use origin_tape::asm::{Asm, ProgramBuilder};
//! use origin_tape::config::{ForkPolicy, RecorderConfig};
//! use origin_tape::host::NoHost;
//! use origin_tape::opcode::BinOp;
//! use origin_tape::query::QueryService;
//! use origin_tape::recorder::Recorder;
//! use origin_tape::value::Value;
//! use origin_tape::vm::{Limits, Vm};
//! use origin_tape::writer::TraceWriter;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // a = 30; b = 0.01; c = a * b
//! let mut asm = Asm::new("<module>", "demo.gx");
//! asm.load_const(Value::Int(30));
//! asm.store_local("a");
//! asm.load_const(Value::Float(0.01));
//! asm.store_local("b");
//! asm.load_local("a");
//! asm.load_local("b");
//! asm.binary(BinOp::Mul);
//! asm.store_local("c");
//! asm.load_const(Value::None);
//! asm.ret();
//!
//! let mut pb = ProgramBuilder::new();
//! let entry = pb.add(asm)?;
//! let program = pb.build()?;
//!
//! let config = RecorderConfig::from_env();
//! let path = config.trace_path("demo");
//! let writer = Arc::new(TraceWriter::create(&path, ForkPolicy::Refuse)?);
//! let mut recorder = Recorder::new(writer.clone(), 0, &config);
//! Vm::new(NoHost, Limits::default()).run(&program, entry, Some(&mut recorder))?;
//! recorder.finish()?;
//! writer.close()?;
//!
//! let service = QueryService::new();
//! let open = service.open_trace(&path)?;
//! // Stop just after the store to `c`, while the module frame is live.
//! service.run_to_instruction(open.session_id, 9)?;
//! let hits = service.search_variables(open.session_id, "^c$")?;
//! let chain = service.trace_provenance(open.session_id, hits[0].tok, None)?;
//! for node in &chain.nodes {
//!     println!("{:?} <- {:?}", node.info.tok, node.parents);
//! }
//! # Ok(())
//! # }
//! ```

pub mod asm;
pub mod codec;
pub mod config;
pub mod event;
pub mod format;
pub mod frame;
pub mod host;
pub mod opcode;
pub mod program;
pub mod query;
pub mod recorder;
pub mod replay;
pub mod thread;
pub mod token;
pub mod value;
pub mod vm;
pub mod writer;
