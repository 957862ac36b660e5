//! Test support: an in-process fake debug target.
//!
//! [`FakeTarget`] listens on a loopback port, performs the target side of
//! the handshake, forwards every decoded request to the test, and lets
//! the test script responses and asynchronous updates. It exists for the
//! integration suites of this crate and the DAP bridge; production code
//! has no business here.

use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use roku_protocol::{
    read_request, write_update, FeatureSet, ProtocolVersion, Request, Update, WireReader,
    WireWriter, DEBUGGER_MAGIC,
};

use crate::client::{HandlerOutcome, TargetEvent, UpdateHandler};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A scripted stand-in for a Roku device's debug service.
pub struct FakeTarget {
    port: u16,
    features: FeatureSet,
    request_rx: Mutex<Receiver<Request>>,
    conn_rx: Mutex<Receiver<TcpStream>>,
    writer: Mutex<Option<WireWriter<TcpStream>>>,
}

impl FakeTarget {
    /// Bind a loopback port and serve one debug session for `version`.
    #[allow(clippy::unwrap_used, clippy::panic)]
    pub fn start(version: ProtocolVersion) -> Arc<FakeTarget> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (request_tx, request_rx) = mpsc::channel();
        let (conn_tx, conn_rx) = mpsc::channel();

        thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else { return };
            let mut reader = WireReader::new(stream.try_clone().unwrap());
            let mut writer = WireWriter::new(stream.try_clone().unwrap());

            // Target side of the handshake: magic exchange, then the
            // version report.
            let magic = reader.read_u64().unwrap();
            assert_eq!(magic, DEBUGGER_MAGIC, "client sent bad magic");
            writer.write_u64(DEBUGGER_MAGIC).unwrap();
            writer.write_u32(version.major).unwrap();
            writer.write_u32(version.minor).unwrap();
            writer.write_u32(version.patch).unwrap();
            if version.major >= 3 {
                writer.write_u32(12).unwrap(); // length field + revision
                writer.write_i64(version.platform_revision().unwrap_or(0)).unwrap();
            }
            writer.flush().unwrap();
            conn_tx.send(stream).unwrap();

            // Forward decoded requests until the client hangs up.
            while let Ok(request) = read_request(&mut reader) {
                if request_tx.send(request).is_err() {
                    break;
                }
            }
        });

        Arc::new(FakeTarget {
            port,
            features: FeatureSet::from_version(version),
            request_rx: Mutex::new(request_rx),
            conn_rx: Mutex::new(conn_rx),
            writer: Mutex::new(None),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    /// Next request the client sent, in order.
    #[allow(clippy::unwrap_used, clippy::panic)]
    pub fn wait_request(&self) -> Request {
        self.request_rx
            .lock()
            .unwrap()
            .recv_timeout(RECV_TIMEOUT)
            .unwrap_or_else(|err| match err {
                RecvTimeoutError::Timeout => panic!("no request from client within timeout"),
                RecvTimeoutError::Disconnected => panic!("fake target serve thread died"),
            })
    }

    /// Write a response or asynchronous update to the client.
    #[allow(clippy::unwrap_used, clippy::panic)]
    pub fn send(&self, update: &Update) {
        let mut writer = self.writer.lock().unwrap();
        if writer.is_none() {
            let stream = self
                .conn_rx
                .lock()
                .unwrap()
                .recv_timeout(RECV_TIMEOUT)
                .unwrap_or_else(|_| panic!("client never connected"));
            *writer = Some(WireWriter::new(stream));
        }
        let writer = writer.as_mut().unwrap();
        write_update(update, &self.features, writer).unwrap();
    }
}

/// What a [`FakeTarget`]-driven session handler recorded.
#[derive(Debug)]
pub enum CollectedEvent {
    Update(Update),
    ConnectionError(String),
}

/// Collects handler events and lets the test wait for them.
#[derive(Clone, Default)]
pub struct EventCollector {
    shared: Arc<(Mutex<Vec<CollectedEvent>>, Condvar)>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::unwrap_used)]
    pub fn handler(&self) -> UpdateHandler {
        let shared = Arc::clone(&self.shared);
        Box::new(move |event| {
            let (events, condvar) = &*shared;
            let mut events = events.lock().unwrap();
            events.push(match event {
                TargetEvent::Update(update) => CollectedEvent::Update(update),
                TargetEvent::ConnectionError(err) => {
                    CollectedEvent::ConnectionError(err.to_string())
                }
            });
            condvar.notify_all();
            HandlerOutcome::Continue
        })
    }

    /// Block until an event matching `pred` has been collected; returns
    /// its index.
    #[allow(clippy::unwrap_used, clippy::panic)]
    pub fn wait_for<F>(&self, mut pred: F) -> usize
    where
        F: FnMut(&CollectedEvent) -> bool,
    {
        let deadline = Instant::now() + RECV_TIMEOUT;
        let (events, condvar) = &*self.shared;
        let mut events = events.lock().unwrap();
        loop {
            if let Some(index) = events.iter().position(&mut pred) {
                return index;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            assert!(!remaining.is_zero(), "timed out waiting for event; saw {events:?}");
            let (guard, _) = condvar.wait_timeout(events, remaining).unwrap();
            events = guard;
        }
    }

    #[allow(clippy::unwrap_used)]
    pub fn with_events<R>(&self, f: impl FnOnce(&[CollectedEvent]) -> R) -> R {
        let (events, _) = &*self.shared;
        let events = events.lock().unwrap();
        f(&events)
    }
}

/// Discarding output sink for sessions that never touch the I/O port.
pub struct NullSink;

impl std::io::Write for NullSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
