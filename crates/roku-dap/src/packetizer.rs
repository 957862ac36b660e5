//! Output packetizer: turns the target's stdout stream into DAP output
//! events.
//!
//! Complete lines flush immediately; partial lines are held briefly
//! (~250 ms) so interactive output is not sprayed byte-by-byte at the
//! IDE. A condvar-paced thread does the delayed flushing.

use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Receives a completed chunk of output to forward to the IDE.
pub type OutputEmitter = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct PacketizerState {
    buffer: String,
    /// Deadline for the pending partial-line flush.
    flush_at: Option<Instant>,
    done: bool,
}

struct Shared {
    state: Mutex<PacketizerState>,
    condvar: Condvar,
    emit: OutputEmitter,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PacketizerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush_locked(&self, state: &mut PacketizerState) {
        if !state.buffer.is_empty() {
            (self.emit)(&state.buffer);
            state.buffer.clear();
        }
        state.flush_at = None;
    }
}

/// A `Write` sink that batches bytes into output events.
pub struct OutputPacketizer {
    shared: Arc<Shared>,
}

impl OutputPacketizer {
    pub fn new(emit: OutputEmitter) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PacketizerState::default()),
            condvar: Condvar::new(),
            emit,
        });

        let timer_shared = Arc::clone(&shared);
        // Flush timer; exits when the packetizer is dropped.
        if let Err(err) = thread::Builder::new().name("dap-output".into()).spawn(move || {
            let mut state = timer_shared.lock();
            loop {
                if state.done {
                    timer_shared.flush_locked(&mut state);
                    break;
                }
                match state.flush_at {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            timer_shared.flush_locked(&mut state);
                            continue;
                        }
                        let (guard, _) = timer_shared
                            .condvar
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner);
                        state = guard;
                    }
                    None => {
                        state = timer_shared
                            .condvar
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
        }) {
            tracing::error!(error = %err, "could not start output flush thread");
        }

        Self { shared }
    }
}

impl Write for OutputPacketizer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let mut state = self.shared.lock();
        state.buffer.push_str(&text);
        if state.buffer.ends_with('\n') {
            self.shared.flush_locked(&mut state);
        } else if state.flush_at.is_none() {
            state.flush_at = Some(Instant::now() + FLUSH_INTERVAL);
        }
        self.shared.condvar.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // Flushing is time-driven; the timer handles stragglers.
        Ok(())
    }
}

impl Drop for OutputPacketizer {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.done = true;
        self.shared.condvar.notify_all();
    }
}
