//! Terminal sinks for process output and status lines.

use colored::Colorize;
use std::io::Write;

/// Where install, dev server and test output goes.
///
/// Fire-and-forget: sinks swallow their own write errors.
pub trait Terminal: Send + Sync {
    /// Writes a line of text.
    fn writeln(&self, text: &str);
    /// Writes a raw output chunk as-is.
    fn write(&self, chunk: &str);
    /// Clears the screen.
    fn clear(&self);
}

/// Writes to the process's stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutTerminal;

impl Terminal for StdoutTerminal {
    fn writeln(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{text}");
        let _ = out.flush();
    }

    fn write(&self, chunk: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(chunk.as_bytes());
        let _ = out.flush();
    }

    fn clear(&self) {
        self.write("\u{1b}[2J\u{1b}[H");
    }
}

/// Writes to stderr, leaving stdout to a machine-readable protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrTerminal;

impl Terminal for StderrTerminal {
    fn writeln(&self, text: &str) {
        let _ = writeln!(std::io::stderr().lock(), "{text}");
    }

    fn write(&self, chunk: &str) {
        let _ = std::io::stderr().lock().write_all(chunk.as_bytes());
    }

    fn clear(&self) {}
}

/// Formats a success line.
pub fn success(text: &str) -> String {
    format!("{} {}", "✓".green(), text)
}

/// Formats a failure line.
pub fn failure(text: &str) -> String {
    format!("{} {}", "✗".red(), text.red())
}

/// Formats an informational line.
pub fn note(text: &str) -> String {
    format!("{} {}", "ℹ".blue(), text)
}
