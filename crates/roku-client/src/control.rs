//! Pending-request registry and the control listener thread.
//!
//! The listener owns the read side of the control socket. Each decoded
//! message is correlated against the registry (by request id for
//! responses, by allowed update type for commands that resolve via an
//! asynchronous event), caches are updated, and the front-end callback is
//! invoked. The loop exits when the callback says it is done, on
//! shutdown, or on a fatal stream error.

use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use roku_protocol::{read_update, Request, Update, UpdatePayload, UpdateType, WireReader};

use crate::client::{ClientInner, HandlerOutcome, TargetEvent, UpdateHandler};

#[derive(Debug)]
struct PendingEntry {
    request: Request,
    /// Asynchronous update types that may resolve this request instead of
    /// a direct response (a step usually ends in ALL_THREADS_STOPPED).
    allowed_update_types: Vec<UpdateType>,
}

/// Requests sent but not yet answered. A request with no matching
/// response is never retried; it stays here until the session ends.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    entries: Mutex<Vec<PendingEntry>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().is_empty()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn add(&self, request: Request, allowed_update_types: &[UpdateType]) {
        let mut entries = self.lock();
        entries.push(PendingEntry {
            request,
            allowed_update_types: allowed_update_types.to_vec(),
        });
        tracing::trace!(count = entries.len(), "pending request added");
    }

    /// Remove and return the request with the given id.
    pub(crate) fn take_by_id(&self, request_id: u32) -> Option<Request> {
        let mut entries = self.lock();
        let index = entries.iter().position(|e| e.request.request_id == request_id)?;
        Some(entries.remove(index).request)
    }

    /// Remove and return the oldest request that allows resolution by
    /// the given update type.
    pub(crate) fn take_by_update_type(&self, update_type: UpdateType) -> Option<Request> {
        let mut entries = self.lock();
        let index = entries
            .iter()
            .position(|e| e.allowed_update_types.contains(&update_type))?;
        Some(entries.remove(index).request)
    }

    pub(crate) fn remove_by_id(&self, request_id: u32) {
        self.lock().retain(|e| e.request.request_id != request_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingEntry>> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Body of the control listener thread.
pub(crate) fn run_listener(
    inner: Arc<ClientInner>,
    mut reader: WireReader<TcpStream>,
    mut handler: UpdateHandler,
) {
    tracing::debug!("control listener running");
    loop {
        let result = read_update(&mut reader, inner.features(), |id| inner.pending.take_by_id(id));
        let mut update: Update = match result {
            Ok(update) => update,
            Err(err) => {
                if inner.is_shutting_down() {
                    tracing::debug!("control stream closed during shutdown");
                } else {
                    tracing::error!(error = %err, "fatal error on control stream");
                    handler(TargetEvent::ConnectionError(err.into()));
                }
                break;
            }
        };

        // An asynchronous update can resolve a pending request whose
        // command completes via an event rather than a response.
        if update.request_id == 0 {
            if let Some(update_type) = update.update_type() {
                if let Some(request) = inner.pending.take_by_update_type(update_type) {
                    tracing::trace!(request_id = request.request_id, ?update_type,
                        "pending request resolved by update");
                    update.request = Some(request);
                }
            }
        }

        // CONNECT_IO_PORT is handled inside the client: it wires up the
        // second connection carrying target stdout.
        if let UpdatePayload::ConnectIoPort { io_port } = update.payload {
            inner.start_io_listener(io_port);
            continue;
        }

        // Caches first, so the callback observes consistent state.
        inner.apply_to_caches(&update);

        match handler(TargetEvent::Update(update)) {
            HandlerOutcome::Continue => {}
            HandlerOutcome::Done => {
                tracing::debug!("update handler is done; listener exiting");
                break;
            }
        }
    }
    tracing::debug!("control listener exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use roku_protocol::RequestArgs;

    fn request(id: u32, args: RequestArgs) -> Request {
        let mut r = Request::new(args);
        r.request_id = id;
        r
    }

    #[test]
    fn take_by_id_removes_exactly_one() {
        let registry = PendingRegistry::new();
        registry.add(request(1, RequestArgs::Threads), &[]);
        registry.add(request(2, RequestArgs::Threads), &[]);
        assert_eq!(registry.count(), 2);
        let taken = registry.take_by_id(1).unwrap();
        assert_eq!(taken.request_id, 1);
        assert_eq!(registry.count(), 1);
        assert!(registry.take_by_id(1).is_none());
        assert!(registry.has_pending());
    }

    #[test]
    fn take_by_update_type_matches_allowed_entries_only() {
        let registry = PendingRegistry::new();
        registry.add(request(1, RequestArgs::Threads), &[]);
        registry.add(
            request(
                2,
                RequestArgs::Step {
                    thread_index: 0,
                    step_type: roku_protocol::StepType::Over,
                },
            ),
            &[UpdateType::AllThreadsStopped, UpdateType::ThreadAttached],
        );
        assert!(registry.take_by_update_type(UpdateType::CompileError).is_none());
        let step = registry.take_by_update_type(UpdateType::AllThreadsStopped).unwrap();
        assert_eq!(step.request_id, 2);
        // Entry is consumed; a later stop update matches nothing.
        assert!(registry.take_by_update_type(UpdateType::AllThreadsStopped).is_none());
        assert_eq!(registry.count(), 1);
    }
}
