//! Event-stream framing: records, lines and partial reads

/// Event name used when a record carries data but no `event:` line
pub const DEFAULT_EVENT: &str = "message";

/// One record of the event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Value of the `event:` line (or [`DEFAULT_EVENT`])
    pub event: String,
    /// `data:` lines joined with `\n`
    pub data: String,
}

/// Parse a single record into its event name and payload.
///
/// Returns `None` when the record has neither an event name nor any data;
/// callers skip such records instead of failing the stream. `id:`, `retry:`,
/// comment lines and anything unrecognized are ignored.
pub fn parse_frame(raw: &str) -> Option<Frame> {
    let mut event: Option<String> = None;
    let mut data: Vec<&str> = Vec::new();

    for line in raw.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim();
            if !value.is_empty() {
                event = Some(value.to_string());
            }
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.trim());
        }
    }

    let data = data.join("\n");
    if event.is_none() && data.trim().is_empty() {
        return None;
    }

    Some(Frame {
        event: event.unwrap_or_else(|| DEFAULT_EVENT.to_string()),
        data,
    })
}

/// Locate the first blank line. Returns `(record_end, next_record_start)`.
///
/// Accepts `\n\n`, `\r\n\r\n` and mixtures of the two.
fn find_record_boundary(buffer: &str) -> Option<(usize, usize)> {
    let bytes = buffer.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        let mut j = i + 1;
        if bytes.get(j) == Some(&b'\r') {
            j += 1;
        }
        if bytes.get(j) == Some(&b'\n') {
            return Some((i, j + 1));
        }
    }
    None
}

/// Split a buffer into complete records and the trailing partial fragment.
pub fn split_records(buffer: &str) -> (Vec<&str>, &str) {
    let mut records = Vec::new();
    let mut rest = buffer;
    while let Some((end, next)) = find_record_boundary(rest) {
        records.push(&rest[..end]);
        rest = &rest[next..];
    }
    (records, rest)
}

/// Rolling text buffer that turns arbitrary read boundaries into frames
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: String,
}

impl FrameBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append decoded text and return every record completed by it
    pub fn push(&mut self, text: &str) -> Vec<Frame> {
        self.buffer.push_str(text);

        let (frames, consumed) = {
            let (records, rest) = split_records(&self.buffer);
            let frames: Vec<Frame> = records
                .into_iter()
                .filter_map(|record| {
                    let frame = parse_frame(record);
                    if frame.is_none() {
                        tracing::trace!("Skipping empty record");
                    }
                    frame
                })
                .collect();
            (frames, self.buffer.len() - rest.len())
        };

        self.buffer.drain(..consumed);
        frames
    }

    /// Flush a final record that never received its terminating blank line
    pub fn finish(&mut self) -> Option<Frame> {
        let rest = std::mem::take(&mut self.buffer);
        parse_frame(&rest)
    }

    /// Text waiting for a record boundary
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

/// Decodes byte chunks to text without splitting multi-byte characters
/// across reads.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    /// Create a decoder with no carried bytes
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + chunk` as possible.
    ///
    /// An incomplete trailing sequence is carried to the next call; invalid
    /// bytes become U+FFFD.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Truncated sequence at the end: wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush carried bytes at end of stream
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}
