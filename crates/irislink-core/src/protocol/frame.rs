//! Stream framing
//!
//! Extracts complete JSON frames from the raw serial byte stream. The device
//! interleaves control responses with console text on one channel, so the
//! extractor has to find well-formed objects inside arbitrary noise, across
//! arbitrary chunk boundaries.
//!
//! Brace depth is tracked with explicit string/escape state so that `{` or
//! `}` characters inside quoted values never confuse the framing.

use serde_json::Value;

/// One complete structured value extracted from the stream
pub type Frame = Value;

/// Incremental frame extractor
///
/// Feed it received chunks as they arrive; it owns the unconsumed tail of the
/// stream between calls. Normalization (ANSI color stripping, bare-CR to LF)
/// happens in the same pass so chunk boundaries inside an escape sequence or
/// a CRLF pair are handled.
#[derive(Debug, Default)]
pub struct FrameExtractor {
    buf: Vec<u8>,
    pending_cr: bool,
    ansi: AnsiState,
}

#[derive(Debug, Default, PartialEq)]
enum AnsiState {
    #[default]
    Ground,
    /// Saw ESC, waiting to see if a CSI sequence follows
    Escape,
    /// Inside `ESC [ ...`, collecting parameter bytes
    Csi(Vec<u8>),
}

/// Parser state for balanced-object scanning
#[derive(Debug, Clone, Copy, Default)]
struct ScanState {
    depth: u32,
    in_string: bool,
    escape_next: bool,
}

impl ScanState {
    fn step(&mut self, byte: u8) {
        if self.in_string {
            if self.escape_next {
                self.escape_next = false;
            } else if byte == b'\\' {
                self.escape_next = true;
            } else if byte == b'"' {
                self.in_string = false;
            }
            return;
        }
        match byte {
            b'"' => self.in_string = true,
            b'{' => self.depth += 1,
            b'}' => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
    }
}

impl FrameExtractor {
    /// Create an empty extractor
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received chunk, returning any complete frames in stream order
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.normalize(chunk);
        self.extract()
    }

    /// Bytes currently buffered and not yet part of a returned frame
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Strip ANSI color sequences and convert bare CR to LF, appending the
    /// result to the internal buffer. CRLF pairs pass through untouched.
    fn normalize(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    self.buf.extend_from_slice(b"\r\n");
                    continue;
                }
                self.buf.push(b'\n');
                // fall through: the current byte still needs handling
            }
            match std::mem::take(&mut self.ansi) {
                AnsiState::Ground => match byte {
                    0x1b => self.ansi = AnsiState::Escape,
                    b'\r' => self.pending_cr = true,
                    _ => self.buf.push(byte),
                },
                AnsiState::Escape => {
                    if byte == b'[' {
                        self.ansi = AnsiState::Csi(Vec::new());
                    } else {
                        // Lone ESC: not a color sequence, keep it
                        self.buf.push(0x1b);
                        self.buf.push(byte);
                    }
                }
                AnsiState::Csi(mut params) => {
                    if byte == b'm' {
                        // Color sequence complete, drop it
                    } else if byte.is_ascii_digit() || byte == b';' {
                        params.push(byte);
                        self.ansi = AnsiState::Csi(params);
                    } else {
                        // Not a color sequence after all, replay it verbatim
                        self.buf.extend_from_slice(&[0x1b, b'[']);
                        self.buf.extend_from_slice(&params);
                        self.buf.push(byte);
                    }
                }
            }
        }
    }

    /// Scan the buffer for balanced objects, parsing each candidate span.
    /// Spans that balance but fail to parse are console noise and dropped.
    fn extract(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut consumed = 0;

        loop {
            let Some(rel) = self.buf[consumed..].iter().position(|&b| b == b'{') else {
                break;
            };
            let start = consumed + rel;

            let Some(len) = balanced_span(&self.buf[start..]) else {
                // Incomplete object, wait for more data
                break;
            };
            let end = start + len;

            match serde_json::from_slice::<Value>(&self.buf[start..end]) {
                Ok(frame) => {
                    frames.push(frame);
                    consumed = end;
                }
                Err(_) => {
                    // Balanced but not JSON (e.g. log text with braces); skip it
                    consumed = end;
                }
            }
        }

        if consumed > 0 {
            self.buf.drain(..consumed);
        }
        frames
    }
}

/// Length of the balanced `{...}` span at the start of `bytes`, if complete
fn balanced_span(bytes: &[u8]) -> Option<usize> {
    debug_assert_eq!(bytes.first(), Some(&b'{'));
    let mut state = ScanState::default();
    for (i, &byte) in bytes.iter().enumerate() {
        state.step(byte);
        if state.depth == 0 && !state.in_string {
            return Some(i + 1);
        }
    }
    None
}
