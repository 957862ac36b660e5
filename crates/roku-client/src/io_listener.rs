//! Listener for the target's I/O port.
//!
//! The target announces a second TCP port (CONNECT_IO_PORT update) that
//! streams the running script's stdout. A dedicated thread copies those
//! bytes verbatim to the configured sink, optionally capturing complete
//! lines for test code to inspect.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

#[derive(Debug, Default)]
struct SaveState {
    enabled: bool,
    buffer: Vec<u8>,
    lines: Vec<String>,
}

#[derive(Debug, Default)]
struct SavedOutput {
    state: Mutex<SaveState>,
}

impl SavedOutput {
    fn push_bytes(&self, bytes: &[u8]) {
        let mut state = self.lock();
        if !state.enabled {
            return;
        }
        for &b in bytes {
            if b == b'\n' {
                let line = String::from_utf8_lossy(&state.buffer).into_owned();
                state.lines.push(line);
                state.buffer.clear();
            } else {
                state.buffer.push(b);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SaveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the I/O listener thread.
#[derive(Debug)]
pub struct IoListener {
    stream: TcpStream,
    saved: Arc<SavedOutput>,
}

impl IoListener {
    /// Connect to the target's I/O port and start forwarding its output
    /// to `sink`.
    pub fn start(
        host: &str,
        port: u16,
        mut sink: Box<dyn Write + Send>,
    ) -> std::io::Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        tracing::debug!(host, port, "connected to target I/O port");
        let saved = Arc::new(SavedOutput::default());
        let saved_for_thread = Arc::clone(&saved);
        let reader = stream.try_clone()?;

        thread::Builder::new().name("target-io-listener".into()).spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; 512];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        tracing::debug!("EOF on target I/O stream");
                        break;
                    }
                    Ok(n) => {
                        if let Err(err) = sink.write_all(&buf[..n]).and_then(|()| sink.flush()) {
                            tracing::warn!(error = %err, "could not forward target output");
                            break;
                        }
                        saved_for_thread.push_bytes(&buf[..n]);
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "target I/O stream closed");
                        break;
                    }
                }
            }
        })?;

        Ok(Self { stream, saved })
    }

    /// Toggle line capture. Enabling (or disabling) clears anything
    /// previously captured.
    pub fn set_save_output(&self, enable: bool) {
        let mut state = self.saved.lock();
        if state.enabled == enable {
            return;
        }
        state.enabled = enable;
        state.buffer.clear();
        state.lines.clear();
    }

    /// Drain the captured complete lines.
    pub fn take_output_lines(&self) -> Vec<String> {
        let mut state = self.saved.lock();
        std::mem::take(&mut state.lines)
    }

    pub fn disconnect(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
