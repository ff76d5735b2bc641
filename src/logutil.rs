//! Logging utilities: single-line escaping for untrusted mesh text and the
//! per-deployment [`MeshLogger`] handed to every stage of a bridge.

use std::fmt;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates very long strings (over `max_preview`) with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Logger bound to one deployment.
///
/// Every line is tagged `[mesh:<id>]` so interleaved output from concurrently
/// running deployments stays attributable. Constructed once per deployment and
/// cloned into the tasks that need it; there is no process-wide tag state.
#[derive(Debug, Clone)]
pub struct MeshLogger {
    mesh_id: String,
}

impl MeshLogger {
    pub fn new(mesh_id: impl Into<String>) -> Self {
        Self {
            mesh_id: mesh_id.into(),
        }
    }

    pub fn mesh_id(&self) -> &str {
        &self.mesh_id
    }

    pub fn prefix(&self, message: fmt::Arguments<'_>) -> String {
        format!("[mesh:{}] {}", self.mesh_id, message)
    }

    pub fn debug(&self, message: fmt::Arguments<'_>) {
        log::debug!(target: "meshrelay::mesh", "[mesh:{}] {}", self.mesh_id, message);
    }

    pub fn info(&self, message: fmt::Arguments<'_>) {
        log::info!(target: "meshrelay::mesh", "[mesh:{}] {}", self.mesh_id, message);
    }

    pub fn warn(&self, message: fmt::Arguments<'_>) {
        log::warn!(target: "meshrelay::mesh", "[mesh:{}] {}", self.mesh_id, message);
    }

    pub fn error(&self, message: fmt::Arguments<'_>) {
        log::error!(target: "meshrelay::mesh", "[mesh:{}] {}", self.mesh_id, message);
    }
}
