//! Diagnostic buffer for backend output
//!
//! The buffer accumulates everything the build step and the running backend
//! write to their standard streams. It is reset once per reload cycle; every
//! reset starts a new generation, and writers bound to an older generation
//! are silently ignored so a dying process can't leak output into the next
//! cycle.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn};

#[derive(Debug, Default)]
struct BufferState {
    generation: u64,
    bytes: Vec<u8>,
}

/// Shared, append-only sink for backend output
#[derive(Debug, Clone, Default)]
pub struct DiagnosticBuffer {
    state: Arc<Mutex<BufferState>>,
}

impl DiagnosticBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a writer bound to the current generation
    pub fn writer(&self) -> BufferWriter {
        BufferWriter {
            state: Arc::clone(&self.state),
            generation: self.state.lock().generation,
        }
    }

    /// Drop all captured output and invalidate outstanding writers
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.bytes.clear();
    }

    /// Copy of everything captured since the last reset
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append handle for one generation of the buffer
#[derive(Debug, Clone)]
pub struct BufferWriter {
    state: Arc<Mutex<BufferState>>,
    generation: u64,
}

impl BufferWriter {
    /// Append bytes. Returns false if the buffer has been reset since this
    /// writer was created, in which case nothing is written.
    pub fn append(&self, data: &[u8]) -> bool {
        let mut state = self.state.lock();
        if state.generation != self.generation {
            return false;
        }
        state.bytes.extend_from_slice(data);
        true
    }
}

/// Stream a child's output into the buffer until EOF, mirroring each line to
/// the console. `source` is either "build" or "backend".
pub async fn pump<R>(reader: R, writer: BufferWriter, source: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                writer.append(&line);
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                match source {
                    "build" => info!(target: "devgate::build", "{}", text),
                    _ => info!(target: "devgate::backend", "{}", text),
                }
            }
            Err(e) => {
                warn!(source, error = %e, "Error reading child output");
                break;
            }
        }
    }
}

/// Render the body of a failure response
pub fn render_failure(message: &str, diagnostics: &[u8]) -> String {
    format!(
        "{}\n\nBEGIN backend output:\n{}\nEND",
        message,
        String::from_utf8_lossy(diagnostics)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_snapshot() {
        let buffer = DiagnosticBuffer::new();
        let writer = buffer.writer();

        assert!(writer.append(b"compiling\n"));
        assert!(writer.append(b"listening on :3000\n"));

        assert_eq!(buffer.snapshot(), b"compiling\nlistening on :3000\n");
        assert_eq!(buffer.len(), 29);
    }

    #[test]
    fn test_reset_invalidates_old_writers() {
        let buffer = DiagnosticBuffer::new();
        let old = buffer.writer();
        old.append(b"first cycle\n");

        buffer.reset();
        assert!(buffer.is_empty());

        // Late output from the previous process is discarded
        assert!(!old.append(b"late output\n"));
        assert!(buffer.is_empty());

        let current = buffer.writer();
        assert!(current.append(b"second cycle\n"));
        assert_eq!(buffer.snapshot(), b"second cycle\n");
    }

    #[tokio::test]
    async fn test_pump_preserves_bytes() {
        let buffer = DiagnosticBuffer::new();
        let input: &[u8] = b"line one\nline two\nno trailing newline";

        pump(input, buffer.writer(), "backend").await;

        assert_eq!(buffer.snapshot(), input);
    }

    #[test]
    fn test_render_failure() {
        let body = render_failure("build command failed", b"syntax error");
        assert_eq!(
            body,
            "build command failed\n\nBEGIN backend output:\nsyntax error\nEND"
        );
    }
}
