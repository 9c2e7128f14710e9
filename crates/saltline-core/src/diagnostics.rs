//! Diagnostic output channel.
//!
//! The transport reports remote failure causes and, in debug mode, wire
//! metadata through a `DiagnosticSink` supplied when the client is built.
//! Internal logging still goes through `tracing`.

use std::sync::{Arc, Mutex};

pub trait DiagnosticSink: Send + Sync {
    fn line(&self, message: &str);
}

/// Writes each diagnostic line to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn line(&self, message: &str) {
        eprintln!("{}", message);
    }
}

/// Keeps diagnostic lines in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

impl DiagnosticSink for MemorySink {
    fn line(&self, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(message.to_string());
        }
    }
}

pub fn stderr() -> Arc<dyn DiagnosticSink> {
    Arc::new(StderrSink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_shares_lines_across_clones() {
        let sink = MemorySink::new();
        let handle: Arc<dyn DiagnosticSink> = Arc::new(sink.clone());
        handle.line("first");
        handle.line("second");
        assert_eq!(sink.lines(), vec!["first", "second"]);
    }
}
