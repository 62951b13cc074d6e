//! Console streaming
//!
//! When the device is not paused it chats freely on the serial line: log
//! lines, tracking output, JSON status blobs. Streaming mode drains that
//! output line by line to a callback until cancelled. The raw stream needs
//! normalization first since the firmware mixes line endings and sometimes
//! runs JSON objects together on one line.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::transport::Transport;

/// Poll backoff when the port has nothing for us
const IDLE_BACKOFF: Duration = Duration::from_millis(30);
/// Backoff after a read error before trying again
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Normalize raw console text for line splitting:
/// bare CR becomes LF, back-to-back objects (`}{` with optional whitespace)
/// get a line break between them, and indentation before a line-leading `{`
/// is stripped.
pub fn normalize_console(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    // Start of input is a line start too: the retained tail of a previous
    // chunk may put us mid-line-leading-whitespace with the `{` still ahead
    let mut ws = String::new();
    while let Some(&next) = chars.peek() {
        if next == ' ' || next == '\t' {
            ws.push(next);
            chars.next();
        } else {
            break;
        }
    }
    if chars.peek() != Some(&'{') {
        out.push_str(&ws);
    }
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push('\n');
            }
            '}' => {
                out.push('}');
                // Look past whitespace for an immediately following object
                let mut ws = String::new();
                while let Some(&next) = chars.peek() {
                    if next == ' ' || next == '\t' || next == '\n' {
                        ws.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if chars.peek() == Some(&'{') {
                    out.push('\n');
                } else {
                    out.push_str(&ws);
                }
            }
            '\n' => {
                out.push('\n');
                // Strip indentation when the line starts with an object
                let mut ws = String::new();
                while let Some(&next) = chars.peek() {
                    if next == ' ' || next == '\t' {
                        ws.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if chars.peek() != Some(&'{') {
                    out.push_str(&ws);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Reads the console and delivers complete lines until cancelled
pub struct ConsoleStreamer;

impl ConsoleStreamer {
    /// Run the streaming loop. Returns when `cancel` flips to `true` or the
    /// transport disconnects. Partial trailing lines are held back until
    /// their terminator arrives; whatever is left on cancel is discarded.
    pub async fn run(
        transport: &dyn Transport,
        mut on_line: impl FnMut(String) + Send,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut carry = String::new();
        debug!("console streaming started");

        loop {
            if *cancel.borrow_and_update() {
                break;
            }
            if !transport.is_connected() {
                debug!("transport gone, console streaming over");
                break;
            }

            let chunk = match transport.read_chunk().await {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(error = %e, "console read failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };
            if chunk.is_empty() {
                tokio::time::sleep(IDLE_BACKOFF).await;
                continue;
            }

            carry.push_str(&String::from_utf8_lossy(&chunk));
            let normalized = normalize_console(&carry);

            // Emit complete lines, blank ones included, keep the
            // unterminated tail
            let mut rest = normalized.as_str();
            while let Some(pos) = rest.find('\n') {
                let line = &rest[..pos];
                trace!(line, "console");
                on_line(line.to_string());
                rest = &rest[pos + 1..];
            }
            carry = rest.to_string();
        }

        debug!("console streaming stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::error::EngineError;
    use crate::transport::ControlLine;

    #[test]
    fn test_bare_cr_becomes_newline() {
        assert_eq!(normalize_console("a\rb\r\nc"), "a\nb\nc");
    }

    #[test]
    fn test_indentation_at_input_start_dedented() {
        // The retained tail of a previous chunk can leave line-leading
        // whitespace at the very start of the next pass
        assert_eq!(normalize_console("   {\"x\":1}"), "{\"x\":1}");
        assert_eq!(normalize_console("   detail"), "   detail");
    }

    #[test]
    fn test_adjacent_objects_split() {
        assert_eq!(
            normalize_console("{\"a\":1}{\"b\":2}"),
            "{\"a\":1}\n{\"b\":2}"
        );
        assert_eq!(
            normalize_console("{\"a\":1}  \n\t{\"b\":2}"),
            "{\"a\":1}\n{\"b\":2}"
        );
    }

    #[test]
    fn test_indented_object_line_dedented() {
        assert_eq!(normalize_console("log\n   {\"x\":1}"), "log\n{\"x\":1}");
    }

    #[test]
    fn test_plain_indentation_kept() {
        assert_eq!(normalize_console("log\n   detail"), "log\n   detail");
    }

    #[test]
    fn test_brace_without_follower_untouched() {
        assert_eq!(normalize_console("end} trailing"), "end} trailing");
    }

    /// Transport that replays a fixed script of read chunks
    struct ScriptedPort {
        chunks: Mutex<VecDeque<Vec<u8>>>,
    }

    impl ScriptedPort {
        fn new(chunks: Vec<&[u8]>) -> Arc<Self> {
            Arc::new(Self {
                chunks: Mutex::new(chunks.into_iter().map(|c| c.to_vec()).collect()),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedPort {
        async fn connect(&self, _baud_rate: u32) -> Result<(), EngineError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), EngineError> {
            Ok(())
        }

        async fn write(&self, _bytes: &[u8]) -> Result<(), EngineError> {
            Ok(())
        }

        async fn read_chunk(&self) -> Result<Vec<u8>, EngineError> {
            Ok(self.chunks.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn set_control_line(
            &self,
            _line: ControlLine,
            _level: bool,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        async fn wait_for_release(&self, _timeout: Duration) {}

        fn is_connected(&self) -> bool {
            true
        }

        async fn is_present(&self) -> bool {
            true
        }
    }

    async fn stream_lines(port: Arc<ScriptedPort>) -> Vec<String> {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            ConsoleStreamer::run(
                port.as_ref(),
                move |line| sink.lock().unwrap().push(line),
                cancel_rx,
            )
            .await;
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = cancel_tx.send(true);
        task.await.unwrap();
        Arc::try_unwrap(lines).unwrap().into_inner().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_indent_stripped_when_chunk_splits_before_object() {
        // Chunk boundary lands between the line-leading whitespace and the
        // object it indents
        let port = ScriptedPort::new(vec![b"log line\n   ", b"{\"x\":1}\n"]);
        let lines = stream_lines(port).await;
        assert_eq!(lines, vec!["log line".to_string(), "{\"x\":1}".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_lines_preserved() {
        let port = ScriptedPort::new(vec![b"first\n\nsecond\n"]);
        let lines = stream_lines(port).await;
        assert_eq!(
            lines,
            vec!["first".to_string(), String::new(), "second".to_string()]
        );
    }
}
