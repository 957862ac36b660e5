//! End-to-end bridge tests: a simulated IDE on one side, a fake target
//! on the other.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use roku_client::testing::FakeTarget;
use roku_dap::{DapBridge, LaunchSupport};
use roku_protocol::{
    Command, ErrCode, ErrorData, ProtocolVersion, RequestArgs, StackFrame, StacktraceResponse,
    ThreadInfo, ThreadStopReason, ThreadsResponse, Update, UpdatePayload, VariablesResponse,
    ERR_FLAG_MISSING_KEY_IN_PATH,
};

const WAIT: Duration = Duration::from_secs(5);

/// Blocking reader fed by a channel; EOF when the sender drops.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.buf.len() {
            match self.rx.recv() {
                Ok(bytes) => {
                    self.buf = bytes;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Shared byte sink capturing everything the bridge writes.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Simulated IDE: writes framed requests, parses framed messages back.
struct IdeSim {
    tx: Sender<Vec<u8>>,
    out: SharedBuf,
    consumed: usize,
    messages: Vec<Value>,
    claimed: Vec<bool>,
    next_seq: i64,
}

impl IdeSim {
    fn request(&mut self, command: &str, arguments: Value) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut message = json!({ "seq": seq, "type": "request", "command": command });
        if !arguments.is_null() {
            message["arguments"] = arguments;
        }
        let payload = message.to_string();
        let frame = format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload);
        self.tx.send(frame.into_bytes()).unwrap();
        seq
    }

    /// Parse any newly-written frames into `messages`.
    fn pump(&mut self) {
        let bytes = self.out.0.lock().unwrap().clone();
        while let Some((value, next)) = parse_frame(&bytes, self.consumed) {
            self.messages.push(value);
            self.claimed.push(false);
            self.consumed = next;
        }
    }

    /// Wait for (and claim) the first unclaimed message matching `pred`.
    fn wait_for(&mut self, what: &str, pred: impl Fn(&Value) -> bool) -> Value {
        let deadline = Instant::now() + WAIT;
        loop {
            self.pump();
            for (index, message) in self.messages.iter().enumerate() {
                if !self.claimed[index] && pred(message) {
                    self.claimed[index] = true;
                    return message.clone();
                }
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {what}; saw {:#?}",
                self.messages
            );
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn wait_response(&mut self, command: &str, request_seq: i64) -> Value {
        self.wait_for(&format!("{command} response"), |m| {
            m["type"] == "response" && m["command"] == command && m["request_seq"] == request_seq
        })
    }

    fn wait_event(&mut self, event: &str) -> Value {
        self.wait_for(&format!("{event} event"), |m| m["type"] == "event" && m["event"] == event)
    }

    /// Let the pipeline settle and assert no unclaimed message matches.
    fn assert_none(&mut self, what: &str, pred: impl Fn(&Value) -> bool) {
        thread::sleep(Duration::from_millis(150));
        self.pump();
        for (index, message) in self.messages.iter().enumerate() {
            assert!(
                self.claimed[index] || !pred(message),
                "unexpected {what}: {message:#?}"
            );
        }
    }
}

fn parse_frame(bytes: &[u8], from: usize) -> Option<(Value, usize)> {
    let text = std::str::from_utf8(&bytes[from..]).ok()?;
    let header_end = text.find("\r\n\r\n")?;
    let header = &text[..header_end];
    let length: usize = header
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length:"))
        .and_then(|v| v.trim().parse().ok())?;
    let body_start = header_end + 4;
    if text.len() < body_start + length {
        return None;
    }
    let value = serde_json::from_str(&text[body_start..body_start + length]).ok()?;
    Some((value, from + body_start + length))
}

/// Launch support that only records what it was asked to do.
#[derive(Clone, Default)]
struct StubLaunch {
    calls: Arc<Mutex<Vec<String>>>,
}

impl LaunchSupport for StubLaunch {
    fn package(&self, _project_root: &Path, out_dir: &Path) -> anyhow::Result<PathBuf> {
        self.calls.lock().unwrap().push("package".into());
        Ok(out_dir.join("channel-dev.zip"))
    }
    fn remove_installed(&self, _device_ip: &str, _password: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("remove".into());
        Ok(())
    }
    fn install(
        &self,
        _device_ip: &str,
        _password: &str,
        _archive: &Path,
        remote_debug: bool,
    ) -> anyhow::Result<()> {
        assert!(remote_debug, "launch must enable remote debug");
        self.calls.lock().unwrap().push("install".into());
        Ok(())
    }
}

struct Session {
    ide: IdeSim,
    target: Arc<FakeTarget>,
    launch_calls: Arc<Mutex<Vec<String>>>,
    _project_dir: tempfile::TempDir,
}

/// Spin up bridge + fake target and run initialize/launch.
fn start_session(version: ProtocolVersion) -> Session {
    let target = FakeTarget::start(version);
    let stub = StubLaunch::default();
    let launch_calls = Arc::clone(&stub.calls);

    let out = SharedBuf::default();
    let bridge = DapBridge::new(out.clone(), Box::new(stub)).with_control_port(target.port());

    let (tx, rx) = mpsc::channel();
    let reader = ChannelReader { rx, buf: Vec::new(), pos: 0 };
    let run_bridge = bridge.clone();
    thread::spawn(move || {
        let _ = run_bridge.run(reader);
    });

    let project_dir = tempfile::tempdir().unwrap();
    let mut ide = IdeSim {
        tx,
        out,
        consumed: 0,
        messages: Vec::new(),
        claimed: Vec::new(),
        next_seq: 1,
    };

    let seq = ide.request("initialize", json!({ "adapterId": "roku" }));
    let response = ide.wait_response("initialize", seq);
    assert_eq!(response["success"], true);
    assert_eq!(response["body"]["supportsConfigurationDoneRequest"], true);

    let seq = ide.request(
        "launch",
        json!({
            "projectRootFolder": project_dir.path().join("proj"),
            "outFolder": project_dir.path().join("out"),
            "rokuDeviceIP": "127.0.0.1",
            "rokuDevicePassword": "aaaa",
        }),
    );
    let response = ide.wait_response("launch", seq);
    assert_eq!(response["success"], true, "launch failed: {response:#?}");

    Session { ide, target, launch_calls, _project_dir: project_dir }
}

fn v3_1_1() -> ProtocolVersion {
    ProtocolVersion::new(3, 1, 1).with_platform_revision(1_700_000_000_000)
}

fn ok_response(request_id: u32, payload: UpdatePayload) -> Update {
    Update { request_id, err_code: ErrCode::Ok, packet_length: None, request: None, payload }
}

fn all_stopped() -> Update {
    Update {
        request_id: 0,
        err_code: ErrCode::Ok,
        packet_length: None,
        request: None,
        payload: UpdatePayload::AllThreadsStopped {
            primary_thread_index: 0,
            stop_reason: ThreadStopReason::Break,
            stop_reason_detail: String::new(),
        },
    }
}

fn one_thread() -> ThreadsResponse {
    ThreadsResponse {
        threads: vec![ThreadInfo {
            is_primary: true,
            is_detached: false,
            stop_reason: ThreadStopReason::Break,
            stop_reason_detail: "Break".into(),
            line_number: 12,
            function_name: "main".into(),
            file_path: "pkg:/source/main.brs".into(),
            code_snippet: String::new(),
        }],
    }
}

fn two_frames() -> StacktraceResponse {
    StacktraceResponse {
        frames: vec![
            StackFrame {
                line_number: 5,
                function_name: "main".into(),
                file_path: "pkg:/source/main.brs".into(),
            },
            StackFrame {
                line_number: 12,
                function_name: "helper".into(),
                file_path: "pkg:/source/util.brs".into(),
            },
        ],
    }
}

/// Launch on a stop-on-launch target defers `initialized` until the
/// first ALL_THREADS_STOPPED; configurationDone then resumes the target.
#[test]
fn initialized_deferred_until_first_stop_on_v3() {
    let mut session = start_session(v3_1_1());

    session.ide.assert_none("early initialized event", |m| {
        m["type"] == "event" && m["event"] == "initialized"
    });
    assert_eq!(
        *session.launch_calls.lock().unwrap(),
        vec!["package".to_string(), "remove".to_string(), "install".to_string()]
    );

    session.target.send(&all_stopped());
    session.ide.wait_event("initialized");
    // The first stop is the launch signal, not a user-visible stop.
    session.ide.assert_none("stopped event for launch stop", |m| {
        m["type"] == "event" && m["event"] == "stopped"
    });

    let seq = session.ide.request("configurationDone", Value::Null);
    session.ide.wait_response("configurationDone", seq);
    let request = session.target.wait_request();
    assert_eq!(request.command(), Command::Continue);
}

/// Targets without stop-on-launch are ready right after launch.
#[test]
fn initialized_immediate_on_v1() {
    let mut session = start_session(ProtocolVersion::new(1, 2, 0));
    session.ide.wait_event("initialized");

    // configurationDone must not resume a target that never stopped;
    // the next request the target sees is the threads query, not a
    // continue.
    let seq = session.ide.request("configurationDone", Value::Null);
    session.ide.wait_response("configurationDone", seq);
    let seq = session.ide.request("threads", Value::Null);
    let request = session.target.wait_request();
    assert_eq!(request.command(), Command::Threads);
    session.target.send(&ok_response(request.request_id, UpdatePayload::Threads(one_thread())));
    session.ide.wait_response("threads", seq);
}

/// The scopes chain from cold caches: threads, stacktrace, variables,
/// then exactly one scopes response.
#[test]
fn scopes_chain_from_cold_caches() {
    let mut session = start_session(v3_1_1());
    session.target.send(&all_stopped());
    session.ide.wait_event("initialized");

    // Mint frame ids with a stackTrace round trip.
    session.target.send(&all_stopped()); // user-visible stop
    session.ide.wait_event("stopped");
    let seq = session.ide.request("stackTrace", json!({ "threadId": 0 }));
    let request = session.target.wait_request();
    assert_eq!(request.command(), Command::Stacktrace);
    session.target.send(&ok_response(request.request_id, UpdatePayload::Stacktrace(two_frames())));
    let response = session.ide.wait_response("stackTrace", seq);
    let frames = response["body"]["stackFrames"].as_array().unwrap();
    assert_eq!(frames.len(), 2);
    let frame_id = frames[1]["id"].as_i64().unwrap();

    // Invalidate every cache, then ask for scopes.
    session.target.send(&all_stopped());
    session.ide.wait_event("stopped");
    let seq = session.ide.request("scopes", json!({ "frameId": frame_id }));

    // Chain link 1: threads.
    let request = session.target.wait_request();
    assert_eq!(request.command(), Command::Threads);
    session.target.send(&ok_response(request.request_id, UpdatePayload::Threads(one_thread())));

    // Chain link 2: stacktrace.
    let request = session.target.wait_request();
    let RequestArgs::Stacktrace { thread_index } = request.args else {
        panic!("expected stacktrace, got {:?}", request.args)
    };
    assert_eq!(thread_index, 0);
    session.target.send(&ok_response(request.request_id, UpdatePayload::Stacktrace(two_frames())));

    // Chain link 3: variables for the frame's locals.
    let request = session.target.wait_request();
    let RequestArgs::Variables(args) = &request.args else {
        panic!("expected variables, got {:?}", request.args)
    };
    assert_eq!(args.thread_index, 0);
    assert_eq!(args.frame_index, 1);
    assert!(args.variable_path.is_empty());
    assert!(!args.get_child_keys);
    let vars = VariablesResponse {
        variables: vec![roku_protocol::Variable {
            name: Some("i".into()),
            var_type: Some(roku_protocol::VariableType::Integer),
            value: Some(roku_protocol::VariableValue::Integer(7)),
            is_child_key: true,
            ..Default::default()
        }],
    };
    session.target.send(&ok_response(request.request_id, UpdatePayload::Variables(vars)));

    let response = session.ide.wait_response("scopes", seq);
    let scopes = response["body"]["scopes"].as_array().unwrap();
    assert_eq!(scopes.len(), 1);
    assert_eq!(scopes[0]["name"], "Locals");
    assert_eq!(scopes[0]["variablesReference"], frame_id);
    // Exactly one scopes response.
    session.ide.assert_none("second scopes response", |m| {
        m["type"] == "response" && m["command"] == "scopes"
    });
}

/// Evaluate of an unknown member names the path and cites the failing
/// index from the error flags.
#[test]
fn evaluate_unknown_variable_cites_path_index() {
    let mut session = start_session(v3_1_1());
    session.target.send(&all_stopped());
    session.ide.wait_event("initialized");
    session.target.send(&all_stopped());
    session.ide.wait_event("stopped");

    // Mint a frame id.
    let seq = session.ide.request("stackTrace", json!({ "threadId": 0 }));
    let request = session.target.wait_request();
    session.target.send(&ok_response(request.request_id, UpdatePayload::Stacktrace(two_frames())));
    let response = session.ide.wait_response("stackTrace", seq);
    let frame_id = response["body"]["stackFrames"][0]["id"].as_i64().unwrap();

    let seq = session.ide.request(
        "evaluate",
        json!({ "expression": "foo.bar", "frameId": frame_id, "context": "hover" }),
    );
    let request = session.target.wait_request();
    let RequestArgs::Variables(args) = &request.args else {
        panic!("expected variables, got {:?}", request.args)
    };
    assert_eq!(args.variable_path, vec!["foo".to_string(), "bar".to_string()]);

    session.target.send(&Update {
        request_id: request.request_id,
        err_code: ErrCode::InvalidArgs,
        packet_length: None,
        request: None,
        payload: UpdatePayload::TargetError(ErrorData {
            err_flags: ERR_FLAG_MISSING_KEY_IN_PATH,
            invalid_value_path_index: None,
            missing_key_path_index: Some(1),
        }),
    });

    let response = session.ide.wait_response("evaluate", seq);
    assert_eq!(response["success"], false);
    let message = response["message"].as_str().unwrap();
    assert!(message.contains("foo.bar"), "message must name the path: {message}");
    assert!(message.contains('1'), "message must cite the index: {message}");
}

/// The spurious THREAD_ATTACHED right after a step is suppressed; real
/// attaches still produce thread and stopped events.
#[test]
fn spurious_thread_attached_after_step_is_suppressed() {
    let mut session = start_session(v3_1_1());
    session.target.send(&all_stopped());
    session.ide.wait_event("initialized");
    session.target.send(&all_stopped());
    session.ide.wait_event("stopped");

    let seq = session.ide.request("next", json!({ "threadId": 0 }));
    // Immediate acknowledgement.
    let response = session.ide.wait_response("next", seq);
    assert_eq!(response["success"], true);

    let request = session.target.wait_request();
    assert_eq!(request.command(), Command::Step);

    // Firmware quirk: a THREAD_ATTACHED trails the step. It must not
    // surface as events.
    session.target.send(&Update {
        request_id: 0,
        err_code: ErrCode::Ok,
        packet_length: None,
        request: None,
        payload: UpdatePayload::ThreadAttached {
            thread_index: 0,
            stop_reason: ThreadStopReason::Break,
            stop_reason_detail: "step".into(),
        },
    });
    session.ide.assert_none("events for suppressed attach", |m| {
        m["type"] == "event" && (m["event"] == "thread" || m["event"] == "stopped")
    });

    // The step's acknowledgement produces the stopped(step) event.
    session.target.send(&ok_response(request.request_id, UpdatePayload::CommandAck));
    let stopped = session.ide.wait_event("stopped");
    assert_eq!(stopped["body"]["reason"], "step");

    // A later, genuine attach produces both events.
    session.target.send(&Update {
        request_id: 0,
        err_code: ErrCode::Ok,
        packet_length: None,
        request: None,
        payload: UpdatePayload::ThreadAttached {
            thread_index: 1,
            stop_reason: ThreadStopReason::Break,
            stop_reason_detail: "entered".into(),
        },
    });
    let thread_event = session.ide.wait_event("thread");
    assert_eq!(thread_event["body"]["reason"], "started");
    assert_eq!(thread_event["body"]["threadId"], 1);
    let stopped = session.ide.wait_event("stopped");
    assert_eq!(stopped["body"]["threadId"], 1);
}

/// stackTrace while the target is running is rejected: thread ids are
/// only valid at stop time.
#[test]
fn stack_trace_while_running_is_an_error() {
    let mut session = start_session(v3_1_1());
    session.target.send(&all_stopped());
    session.ide.wait_event("initialized");

    // configurationDone resumes the target; ids are now stale.
    let seq = session.ide.request("configurationDone", Value::Null);
    session.ide.wait_response("configurationDone", seq);
    let request = session.target.wait_request();
    assert_eq!(request.command(), Command::Continue);

    let seq = session.ide.request("stackTrace", json!({ "threadId": 0 }));
    let response = session.ide.wait_response("stackTrace", seq);
    assert_eq!(response["success"], false);
}

/// Threads responses map indices to DAP thread ids.
#[test]
fn threads_request_round_trip() {
    let mut session = start_session(v3_1_1());
    session.target.send(&all_stopped());
    session.ide.wait_event("initialized");

    let seq = session.ide.request("threads", Value::Null);
    let request = session.target.wait_request();
    assert_eq!(request.command(), Command::Threads);
    session.target.send(&ok_response(request.request_id, UpdatePayload::Threads(one_thread())));
    let response = session.ide.wait_response("threads", seq);
    let threads = response["body"]["threads"].as_array().unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0]["id"], 0);
}
