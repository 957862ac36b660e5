//! Content-Length framed transport for DAP messages.
//!
//! Inbound: `Content-Length: <n>\r\n\r\n<n bytes of JSON>`. Headers other
//! than `Content-Length` are ignored with a warning. Outbound messages
//! are framed the same way and flushed immediately; the writer is shared
//! behind a mutex so events emitted from the control-listener thread
//! cannot interleave with responses from the request loop.

use std::io::{BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::error::DapError;
use crate::protocol::DapRequest;

/// Reader side of the DAP stream.
pub struct DapReader<R> {
    reader: BufReader<R>,
}

impl<R: Read> DapReader<R> {
    pub fn new(input: R) -> Self {
        Self { reader: BufReader::new(input) }
    }

    /// Read one framed message. Returns `None` at EOF.
    pub fn read_message(&mut self) -> Result<Option<DapRequest>, DapError> {
        let mut content_length: Option<String> = None;
        let mut line = String::new();

        // Header block, terminated by an empty line. The spec says CRLF;
        // some clients send bare LF, so trim both.
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                return Ok(None); // EOF
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                if content_length.is_some() {
                    break;
                }
                continue; // stray blank line before any header
            }
            match trimmed.split_once(':') {
                Some((name, value)) if name.trim() == "Content-Length" => {
                    content_length = Some(value.trim().to_string());
                }
                Some((name, _)) => {
                    tracing::warn!(header = name.trim(), "unknown header from DAP client");
                }
                None => {
                    tracing::warn!(line = trimmed, "malformed header from DAP client");
                }
            }
        }

        let raw = content_length.ok_or(DapError::MissingContentLength)?;
        let length: usize =
            raw.parse().map_err(|_| DapError::BadContentLength(raw.clone()))?;
        if length == 0 {
            return Err(DapError::BadContentLength(raw));
        }

        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body)?;
        let request = serde_json::from_slice(&body)?;
        Ok(Some(request))
    }
}

/// Shared, serialized writer for responses and events. Clones share one
/// underlying stream and one outbound sequence counter.
pub struct DapWriter<W> {
    inner: Arc<Mutex<W>>,
    next_seq: Arc<AtomicI64>,
}

impl<W> Clone for DapWriter<W> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner), next_seq: Arc::clone(&self.next_seq) }
    }
}

impl<W: Write> DapWriter<W> {
    pub fn new(output: W) -> Self {
        Self { inner: Arc::new(Mutex::new(output)), next_seq: Arc::new(AtomicI64::new(1)) }
    }

    /// Next outbound sequence number.
    pub fn next_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Serialize, frame, write, flush.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), DapError> {
        let payload = serde_json::to_string(message)?;
        let mut writer = self.lock();
        write!(writer, "Content-Length: {}\r\n\r\n{}", payload.len(), payload)?;
        writer.flush()?;
        tracing::trace!(len = payload.len(), "DAP message sent");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, W> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(json: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", json.len(), json).into_bytes()
    }

    #[test]
    fn reads_framed_messages() {
        let mut bytes = frame(r#"{"seq":1,"type":"request","command":"initialize"}"#);
        bytes.extend(frame(r#"{"seq":2,"type":"request","command":"threads","arguments":{}}"#));
        let mut reader = DapReader::new(Cursor::new(bytes));

        let first = reader.read_message().unwrap().unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.command, "initialize");
        let second = reader.read_message().unwrap().unwrap();
        assert_eq!(second.command, "threads");
        assert!(reader.read_message().unwrap().is_none());
    }

    #[test]
    fn ignores_unknown_headers() {
        let json = r#"{"seq":7,"type":"request","command":"threads"}"#;
        let bytes = format!(
            "Content-Length: {}\r\nUser-Agent: some-ide\r\n\r\n{}",
            json.len(),
            json
        )
        .into_bytes();
        let mut reader = DapReader::new(Cursor::new(bytes));
        let message = reader.read_message().unwrap().unwrap();
        assert_eq!(message.seq, 7);
    }

    #[test]
    fn tolerates_bare_lf_line_endings() {
        let json = r#"{"seq":3,"type":"request","command":"threads"}"#;
        let bytes = format!("Content-Length: {}\n\n{}", json.len(), json).into_bytes();
        let mut reader = DapReader::new(Cursor::new(bytes));
        assert_eq!(reader.read_message().unwrap().unwrap().seq, 3);
    }

    #[test]
    fn missing_content_length_is_an_error() {
        let bytes = b"X-Whatever: 1\r\n\r\n{}".to_vec();
        let mut reader = DapReader::new(Cursor::new(bytes));
        // The header block never terminates before EOF without a
        // Content-Length, so this surfaces as EOF.
        assert!(reader.read_message().unwrap().is_none());
    }

    #[test]
    fn writer_frames_and_drops_null_fields() {
        let writer = DapWriter::new(Vec::new());
        let response = crate::protocol::DapResponse {
            seq: writer.next_seq(),
            msg_type: "response".into(),
            request_seq: 1,
            success: true,
            command: "initialize".into(),
            message: None,
            body: None,
        };
        writer.send(&response).unwrap();
        let bytes = Arc::try_unwrap(writer.inner).map_err(|_| ()).unwrap().into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("Content-Length: "));
        // Null fields must be dropped from the JSON.
        assert!(!text.contains("message"));
        assert!(!text.contains("body"));
        let json_start = text.find("\r\n\r\n").unwrap() + 4;
        let declared: usize =
            text["Content-Length: ".len()..text.find('\r').unwrap()].parse().unwrap();
        assert_eq!(text.len() - json_start, declared);
    }
}
