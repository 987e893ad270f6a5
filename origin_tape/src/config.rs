// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Recorder configuration.
//!
//! The environment carries the knobs the outer shell is expected to set:
//! `TRACE_DIR` (output directory), `DEBUG_TRACE` (diagnostic logging) and
//! `RECORDER_CALLBACK_AT` (initial stepping-callback threshold). The fork
//! policy has no environment knob; it is a deliberate configuration-time
//! decision of the embedder.

use std::env;
use std::path::{Path, PathBuf};

/// What the trace writer does when it finds itself in a forked child.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ForkPolicy {
    /// Refuse to record in the child: the first append fails and the child's
    /// stream ends with an `aborted` event (reason `forked-child`). The
    /// parent's trace stays valid.
    #[default]
    Refuse,
    /// Close the inherited handle and continue into a fresh file named
    /// `<stem>.<pid>.rtrc` next to the original.
    PerProcessFile,
}

/// Recorder configuration.
#[derive(Clone, Debug)]
pub struct RecorderConfig {
    /// Directory trace files are created in.
    pub trace_dir: PathBuf,
    /// Initial stepping-callback threshold (`0` = disabled).
    pub callback_at: u64,
    /// Emit diagnostic log lines from the evaluator.
    pub debug: bool,
    /// Fork handling policy.
    pub fork_policy: ForkPolicy,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            trace_dir: PathBuf::from("."),
            callback_at: 1,
            debug: false,
            fork_policy: ForkPolicy::default(),
        }
    }
}

impl RecorderConfig {
    /// Builds a configuration from the process environment.
    ///
    /// Unset or unparsable variables fall back to defaults; a bad value is
    /// reported through `tracing` rather than failing the session.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(dir) = env::var_os("TRACE_DIR") {
            cfg.trace_dir = PathBuf::from(dir);
        }
        if let Ok(raw) = env::var("RECORDER_CALLBACK_AT") {
            match raw.parse::<u64>() {
                Ok(v) => cfg.callback_at = v,
                Err(_) => {
                    tracing::warn!(value = %raw, "ignoring unparsable RECORDER_CALLBACK_AT");
                }
            }
        }
        if let Ok(raw) = env::var("DEBUG_TRACE") {
            cfg.debug = raw == "1" || raw.eq_ignore_ascii_case("true");
        }
        cfg
    }

    /// Returns the path for a trace named `stem` in the configured directory.
    #[must_use]
    pub fn trace_path(&self, stem: &str) -> PathBuf {
        self.trace_dir.join(format!("{stem}.rtrc"))
    }
}

/// Returns the per-process sibling of `path` used by
/// [`ForkPolicy::PerProcessFile`].
#[must_use]
pub fn per_process_path(path: &Path, pid: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("trace");
    let name = format!("{stem}.{pid}.rtrc");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_path_appends_extension() {
        let cfg = RecorderConfig {
            trace_dir: PathBuf::from("/tmp/traces"),
            ..RecorderConfig::default()
        };
        assert_eq!(
            cfg.trace_path("run1"),
            PathBuf::from("/tmp/traces/run1.rtrc")
        );
    }

    #[test]
    fn per_process_path_keeps_directory() {
        let p = per_process_path(Path::new("/tmp/traces/run1.rtrc"), 4242);
        assert_eq!(p, PathBuf::from("/tmp/traces/run1.4242.rtrc"));
    }

    #[test]
    fn default_arms_callback_at_first_instruction() {
        assert_eq!(RecorderConfig::default().callback_at, 1);
        assert_eq!(RecorderConfig::default().fork_policy, ForkPolicy::Refuse);
    }
}
