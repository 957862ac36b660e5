//! The DAP bridge state machine.
//!
//! One task reads framed DAP requests from the IDE and translates them
//! into debugger requests; the client's update callback translates
//! responses and asynchronous target events back into DAP responses and
//! events. The originating DAP request rides along as each debugger
//! request's opaque caller data, so a response can always be routed to
//! the IDE message that caused it.
//!
//! The interesting translation problems:
//!
//! - DAP wants stable integer handles (`frameId`, `variablesReference`);
//!   the target only has thread/frame indices valid while stopped. The
//!   client's stack-reference ids bridge the two.
//! - A single `scopes` request may need up to three chained target
//!   requests (threads, stacktrace, variables); the chain re-checks the
//!   client's caches at every completion and only issues what is missing.
//! - `initialized` must not be emitted until the target is actually
//!   ready for configuration; targets that always stop on launch make
//!   that the first ALL_THREADS_STOPPED.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;

use roku_client::{
    ClientConfig, DebuggerClient, HandlerOutcome, TargetError, TargetEvent, UpdateHandler,
};
use roku_protocol::{
    BreakpointSpec, Command, ErrCode, ProtocolFeature, Request, RequestArgs, StepType,
    UpdatePayload, VariablesArgs, DEBUGGER_PORT,
};

use crate::error::DapError;
use crate::launch::LaunchSupport;
use crate::packetizer::OutputPacketizer;
use crate::protocol::*;
use crate::transport::{DapReader, DapWriter};

/// What the request loop does after handling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

#[derive(Default)]
struct BridgeState {
    client: Option<DebuggerClient>,
    project_root: Option<PathBuf>,
    /// First ALL_THREADS_STOPPED seen (drives the deferred initialized
    /// event on stop-on-launch targets).
    all_stopped_seen: bool,
    /// Workaround for targets that emit a spurious THREAD_ATTACHED right
    /// after a step command.
    suppress_next_attached: bool,
    /// Thread indices are only meaningful while the target is stopped.
    target_stopped: bool,
}

struct BridgeShared<W> {
    writer: DapWriter<W>,
    launch_support: Box<dyn LaunchSupport>,
    state: Mutex<BridgeState>,
    control_port: u16,
    connect_budget: Duration,
}

/// The DAP front-end. Cheap to clone; the update callback holds a clone.
pub struct DapBridge<W> {
    shared: Arc<BridgeShared<W>>,
}

impl<W> Clone for DapBridge<W> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<W: Write + Send + 'static> DapBridge<W> {
    pub fn new(output: W, launch_support: Box<dyn LaunchSupport>) -> Self {
        Self {
            shared: Arc::new(BridgeShared {
                writer: DapWriter::new(output),
                launch_support,
                state: Mutex::new(BridgeState::default()),
                control_port: DEBUGGER_PORT,
                connect_budget: Duration::from_secs(60),
            }),
        }
    }

    /// Override the target control port (tests talk to a loopback fake).
    /// Only effective before the bridge is cloned or run.
    pub fn with_control_port(mut self, port: u16) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.control_port = port;
        }
        self
    }

    /// Override the connect retry budget. Only effective before the
    /// bridge is cloned or run.
    pub fn with_connect_budget(mut self, budget: Duration) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.connect_budget = budget;
        }
        self
    }

    /// Serve one DAP session: read requests until EOF or disconnect.
    pub fn run<R: Read>(&self, input: R) -> Result<(), DapError> {
        let mut reader = DapReader::new(input);
        while let Some(request) = reader.read_message()? {
            if self.handle_request(&request) == Flow::Exit {
                break;
            }
        }
        tracing::debug!("DAP request loop finished");
        Ok(())
    }

    fn handle_request(&self, request: &DapRequest) -> Flow {
        tracing::debug!(command = %request.command, seq = request.seq, "DAP request");
        let result = match request.command.as_str() {
            "initialize" => self.handle_initialize(request),
            "launch" => self.handle_launch(request),
            "configurationDone" => self.handle_configuration_done(request),
            "setBreakpoints" => self.handle_set_breakpoints(request),
            "setExceptionBreakpoints" => {
                // BrightScript has no exceptions.
                self.send_failure(request, None);
                Ok(())
            }
            "threads" => self.forward_simple(request, RequestArgs::Threads),
            "stackTrace" => self.handle_stack_trace(request),
            "scopes" => self.continue_scopes(request),
            "variables" => self.handle_variables(request),
            "evaluate" => self.handle_evaluate(request),
            "continue" => self.handle_continue(request),
            "next" => self.handle_step(request, StepType::Over),
            "stepIn" => self.handle_step(request, StepType::Line),
            "stepOut" => self.handle_step(request, StepType::Out),
            "pause" => self.handle_pause(request),
            "terminate" => self.handle_terminate(request),
            "disconnect" => return self.handle_disconnect(request),
            other => {
                tracing::warn!(command = other, "unknown command from DAP client");
                self.send_failure(request, Some(format!("Unknown command: {other}")));
                Ok(())
            }
        };
        if let Err(err) = result {
            tracing::warn!(command = %request.command, error = %err, "DAP request failed");
            self.send_failure(request, Some(err.to_string()));
        }
        Flow::Continue
    }

    // ================================================================
    // DAP command handlers
    // ================================================================

    fn handle_initialize(&self, request: &DapRequest) -> anyhow::Result<()> {
        let capabilities = Capabilities {
            supports_configuration_done_request: Some(true),
            supports_conditional_breakpoints: Some(true),
            supports_hit_conditional_breakpoints: Some(true),
            supports_evaluate_for_hovers: Some(true),
            supports_terminate_request: Some(true),
        };
        self.send_response(request, Some(serde_json::to_value(capabilities)?));
        Ok(())
    }

    fn handle_launch(&self, request: &DapRequest) -> anyhow::Result<()> {
        let args: LaunchArguments = parse_arguments(request)?;
        let project_root = PathBuf::from(
            args.project_root_folder.context("IDE did not send projectRootFolder")?,
        );
        let out_dir = PathBuf::from(args.out_folder.context("IDE did not send outFolder")?);
        let device_ip = args.roku_device_ip.context("IDE did not send rokuDeviceIP")?;
        let password = args.roku_device_password.context("IDE did not send rokuDevicePassword")?;

        let archive = self
            .shared
            .launch_support
            .package(&project_root, &out_dir)
            .context("could not package channel")?;
        tracing::info!(archive = %archive.display(), "channel packaged");

        self.shared.launch_support.remove_installed(&device_ip, &password)?;
        self.shared.launch_support.install(&device_ip, &password, &archive, true)?;

        // Target stdout becomes DAP output events, batched by the
        // packetizer.
        let emit_writer = self.writer().clone();
        let packetizer = OutputPacketizer::new(Box::new(move |chunk: &str| {
            let event = DapEvent {
                seq: emit_writer.next_seq(),
                msg_type: "event".into(),
                event: "output".into(),
                body: serde_json::to_value(OutputEventBody {
                    category: "stdout".into(),
                    output: chunk.to_string(),
                })
                .ok(),
            };
            if let Err(err) = emit_writer.send(&event) {
                tracing::warn!(error = %err, "could not emit output event");
            }
        }));

        let bridge = self.clone();
        let handler: UpdateHandler = Box::new(move |event| bridge.on_target_event(event));

        let mut config = ClientConfig::new(device_ip);
        config.port = self.shared.control_port;
        config.connect_budget = self.shared.connect_budget;
        let client = DebuggerClient::connect(config, handler, Box::new(packetizer))
            .context("could not open debug control connection")?;

        let stop_on_launch = client.has_feature(ProtocolFeature::StopOnLaunchAlways);
        {
            let mut state = self.state();
            state.client = Some(client);
            state.project_root = Some(project_root);
        }

        self.send_response(request, None);
        // Ready for configuration now, unless the target stops on launch
        // and readiness is signaled by the first stop.
        if !stop_on_launch {
            self.send_event("initialized", None);
        }
        Ok(())
    }

    fn handle_configuration_done(&self, request: &DapRequest) -> anyhow::Result<()> {
        self.send_response(request, None);
        let client = self.client()?;
        if client.has_feature(ProtocolFeature::StopOnLaunchAlways) {
            self.state().target_stopped = false;
            client.send(Request::new(RequestArgs::Continue))?;
        }
        Ok(())
    }

    fn handle_set_breakpoints(&self, request: &DapRequest) -> anyhow::Result<()> {
        let args: SetBreakpointsArguments = parse_arguments(request)?;
        let client = self.client()?;
        let source_path = args.source.path.clone().context("setBreakpoints without source path")?;
        let project_root = self.state().project_root.clone();

        let mut specs = Vec::new();
        match source_uri(&source_path, project_root.as_deref()) {
            Some(uri) => {
                for bp in args.breakpoints.unwrap_or_default() {
                    let ignore_count = bp
                        .hit_condition
                        .as_deref()
                        .and_then(|s| s.trim().parse::<u32>().ok())
                        .unwrap_or(0);
                    let mut spec = BreakpointSpec::new(uri.clone(), bp.line, ignore_count);
                    if let Some(condition) = bp.condition.filter(|c| !c.trim().is_empty()) {
                        spec = spec.with_condition(condition);
                    }
                    specs.push(spec);
                }
            }
            None => {
                tracing::warn!(
                    path = %source_path,
                    "breakpoints ignored: path not under project root"
                );
            }
        }

        if specs.is_empty() {
            let body = SetBreakpointsResponseBody { breakpoints: Vec::new() };
            self.send_response(request, Some(serde_json::to_value(body)?));
            return Ok(());
        }

        let conditional = specs.iter().any(|s| s.cond_expr.is_some())
            && client.has_feature(ProtocolFeature::ConditionalBreakpoints);
        let caller = serde_json::to_value(request)?;
        let args = if conditional {
            // The conditional command wants a condition for every entry.
            for spec in &mut specs {
                spec.cond_expr.get_or_insert_with(String::new);
            }
            RequestArgs::AddConditionalBreakpoints { breakpoints: specs }
        } else {
            RequestArgs::AddBreakpoints { breakpoints: specs }
        };
        client.send(Request::new(args).with_caller_data(caller))?;
        Ok(())
    }

    fn forward_simple(&self, request: &DapRequest, args: RequestArgs) -> anyhow::Result<()> {
        let client = self.client()?;
        let caller = serde_json::to_value(request)?;
        client.send(Request::new(args).with_caller_data(caller))?;
        Ok(())
    }

    fn handle_stack_trace(&self, request: &DapRequest) -> anyhow::Result<()> {
        let args: StackTraceArguments = parse_arguments(request)?;
        if !self.state().target_stopped {
            anyhow::bail!("target is not stopped; thread ids are stale");
        }
        let thread_index = u32::try_from(args.thread_id).context("bad threadId")?;
        self.forward_simple(request, RequestArgs::Stacktrace { thread_index })
    }

    /// Drive the scopes chain: threads, stacktrace, variables, issuing
    /// only what the caches are missing, then synthesize the response.
    fn continue_scopes(&self, request: &DapRequest) -> anyhow::Result<()> {
        let args: ScopesArguments = parse_arguments(request)?;
        let client = self.client()?;
        let frame_ref = u32::try_from(args.frame_id).context("bad frameId")?;
        let (thread_index, frame_index, _) = client.decode_stack_ref_id(frame_ref)?;
        let caller = serde_json::to_value(request)?;

        match client.threads() {
            None => {
                client.send(Request::new(RequestArgs::Threads).with_caller_data(caller))?;
                return Ok(());
            }
            Some(Err(err)) => return self.scopes_chain_error(request, &err),
            Some(Ok(_)) => {}
        }
        match client.stacktrace(thread_index) {
            None => {
                client.send(
                    Request::new(RequestArgs::Stacktrace { thread_index }).with_caller_data(caller),
                )?;
                return Ok(());
            }
            Some(Err(err)) => return self.scopes_chain_error(request, &err),
            Some(Ok(_)) => {}
        }
        match client.variables(thread_index, frame_index, &[], false) {
            None => {
                client.send(
                    Request::new(RequestArgs::Variables(VariablesArgs {
                        thread_index,
                        frame_index,
                        variable_path: Vec::new(),
                        force_case_insensitive: Vec::new(),
                        get_child_keys: false,
                    }))
                    .with_caller_data(caller),
                )?;
                Ok(())
            }
            Some(Err(err)) => self.scopes_chain_error(request, &err),
            Some(Ok(_)) => self.respond_scopes(request),
        }
    }

    fn scopes_chain_error(&self, request: &DapRequest, err: &TargetError) -> anyhow::Result<()> {
        let message = format!("BrightScript protocol error: {}", err.err_code.user_str());
        self.send_console(&message);
        self.send_failure(request, Some(message));
        Ok(())
    }

    fn handle_variables(&self, request: &DapRequest) -> anyhow::Result<()> {
        let args: VariablesArguments = parse_arguments(request)?;
        let client = self.client()?;
        let ref_id = u32::try_from(args.variables_reference).context("bad variablesReference")?;
        let (thread_index, frame_index, variable_path) = client.decode_stack_ref_id(ref_id)?;

        match client.variables(thread_index, frame_index, &variable_path, true) {
            Some(Ok(_)) => self.respond_variables(request),
            Some(Err(err)) => {
                self.send_failure(
                    request,
                    Some(format!("BrightScript protocol error: {}", err.err_code.user_str())),
                );
                Ok(())
            }
            None => {
                let caller = serde_json::to_value(request)?;
                let path_len = variable_path.len();
                client.send(
                    Request::new(RequestArgs::Variables(VariablesArgs {
                        thread_index,
                        frame_index,
                        variable_path,
                        force_case_insensitive: vec![false; path_len],
                        get_child_keys: true,
                    }))
                    .with_caller_data(caller),
                )?;
                Ok(())
            }
        }
    }

    fn handle_evaluate(&self, request: &DapRequest) -> anyhow::Result<()> {
        let args: EvaluateArguments = parse_arguments(request)?;
        let client = self.client()?;

        let expression = args.expression.trim();
        let expression = expression.strip_prefix("print ").unwrap_or(expression).trim();
        if expression.is_empty() {
            anyhow::bail!("No expression found in request");
        }
        let frame_id = args.frame_id.filter(|id| *id > 0).context("No stack frame specified")?;
        let frame_ref = u32::try_from(frame_id).context("bad frameId")?;
        let (thread_index, frame_index, base_path) = client.decode_stack_ref_id(frame_ref)?;

        // Only variable paths are evaluated; BrightScript identifiers
        // are case-insensitive, lower case is canonical.
        let mut variable_path = base_path;
        variable_path.extend(expression.to_lowercase().split('.').map(str::to_string));
        let get_child_keys = args.context.as_deref() == Some("repl");

        let caller = serde_json::to_value(request)?;
        let path_len = variable_path.len();
        client.send(
            Request::new(RequestArgs::Variables(VariablesArgs {
                thread_index,
                frame_index,
                variable_path,
                force_case_insensitive: vec![false; path_len],
                get_child_keys,
            }))
            .with_caller_data(caller),
        )?;
        Ok(())
    }

    fn handle_continue(&self, request: &DapRequest) -> anyhow::Result<()> {
        let client = self.client()?;
        self.state().target_stopped = false;
        let caller = serde_json::to_value(request)?;
        client.send(Request::new(RequestArgs::Continue).with_caller_data(caller))?;
        Ok(())
    }

    fn handle_step(&self, request: &DapRequest, step_type: StepType) -> anyhow::Result<()> {
        let args: ThreadArguments = parse_arguments(request)?;
        let client = self.client()?;
        let thread_index = u32::try_from(args.thread_id).context("bad threadId")?;

        if client.has_feature(ProtocolFeature::AttachedMessageDuringStepBug) {
            self.state().suppress_next_attached = true;
        }
        self.state().target_stopped = false;

        // Acknowledge immediately; the stopped event follows when the
        // target reports the step complete.
        self.send_response(request, None);
        let caller = serde_json::to_value(request)?;
        client.send_expecting_stop(
            Request::new(RequestArgs::Step { thread_index, step_type }).with_caller_data(caller),
        )?;
        Ok(())
    }

    fn handle_pause(&self, request: &DapRequest) -> anyhow::Result<()> {
        let client = self.client()?;
        // Acknowledge without waiting for the actual stop.
        self.send_response(request, None);
        let caller = serde_json::to_value(request)?;
        client.send(Request::new(RequestArgs::Stop).with_caller_data(caller))?;
        Ok(())
    }

    fn handle_terminate(&self, request: &DapRequest) -> anyhow::Result<()> {
        let client = self.client()?;
        let caller = serde_json::to_value(request)?;
        client.send(Request::new(RequestArgs::ExitChannel).with_caller_data(caller))?;
        Ok(())
    }

    fn handle_disconnect(&self, request: &DapRequest) -> Flow {
        // This bridge always launches (never attaches), so disconnecting
        // ends the debuggee too.
        if let Ok(client) = self.client() {
            client.shutdown();
        }
        self.send_response(request, None);
        Flow::Exit
    }

    // ================================================================
    // Updates from the target
    // ================================================================

    fn on_target_event(&self, event: TargetEvent) -> HandlerOutcome {
        match event {
            TargetEvent::ConnectionError(err) => {
                tracing::error!(error = %err, "debug session lost");
                self.send_console(&format!("Debug session lost: {err}"));
                self.send_event("terminated", None);
                HandlerOutcome::Done
            }
            TargetEvent::Update(update) => {
                if let Err(err) = self.handle_target_update(update) {
                    tracing::warn!(error = %err, "target update not handled");
                }
                HandlerOutcome::Continue
            }
        }
    }

    fn handle_target_update(&self, update: roku_protocol::Update) -> anyhow::Result<()> {
        match &update.payload {
            UpdatePayload::AllThreadsStopped {
                primary_thread_index, stop_reason, stop_reason_detail,
            } => {
                let (first_stop, stop_on_launch) = {
                    let mut state = self.state();
                    state.target_stopped = true;
                    let first = !state.all_stopped_seen;
                    state.all_stopped_seen = true;
                    let feature = state
                        .client
                        .as_ref()
                        .is_some_and(|c| c.has_feature(ProtocolFeature::StopOnLaunchAlways));
                    (first, feature)
                };
                if first_stop && stop_on_launch {
                    // Launch complete: now ready for configuration.
                    self.send_event("initialized", None);
                } else {
                    self.send_stopped_event(
                        stop_reason_for_dap(*stop_reason),
                        Some(stop_reason_detail.clone()),
                        i64::from(*primary_thread_index),
                    );
                }
                Ok(())
            }
            UpdatePayload::ThreadAttached { thread_index, .. } => {
                self.state().target_stopped = true;
                {
                    let mut state = self.state();
                    if state.suppress_next_attached {
                        // Known firmware quirk: drop the attach that
                        // trails a step command.
                        state.suppress_next_attached = false;
                        tracing::debug!("suppressed spurious THREAD_ATTACHED after step");
                        return Ok(());
                    }
                }
                // The target never announces thread starts; the attach is
                // the first we hear of this thread.
                let body = ThreadEventBody { reason: "started".into(), thread_id: i64::from(*thread_index) };
                self.send_event("thread", serde_json::to_value(body).ok());
                self.send_stopped_event("pause", Some("Thread entered".into()), i64::from(*thread_index));
                Ok(())
            }
            UpdatePayload::BreakpointError(err) => {
                for message in
                    err.compile_errors.iter().chain(&err.runtime_errors).chain(&err.other_errors)
                {
                    self.send_console(&format!("Breakpoint {}: {message}", err.breakpoint_id));
                }
                Ok(())
            }
            UpdatePayload::CompileError(err) => {
                self.send_console(&err.format_for_user());
                Ok(())
            }
            UpdatePayload::ConnectIoPort { .. } => Ok(()), // consumed by the client
            _ => self.handle_target_response(update),
        }
    }

    fn handle_target_response(&self, update: roku_protocol::Update) -> anyhow::Result<()> {
        let Some(request) = &update.request else {
            tracing::debug!(request_id = update.request_id, "response without request context");
            return Ok(());
        };
        let Some(caller) = &request.caller_data else {
            // Internal request (e.g. the shutdown exit_channel).
            return Ok(());
        };
        let dap_request: DapRequest =
            serde_json::from_value(caller.clone()).context("bad caller data on request")?;

        match request.command() {
            Command::Threads => self.on_threads_response(&update, &dap_request),
            Command::Stacktrace => self.on_stacktrace_response(&update, &dap_request),
            Command::Variables => self.on_variables_response(&update, &dap_request),
            Command::Step => {
                if update.is_error() {
                    self.send_failure(
                        &dap_request,
                        Some(format!("Command failed: {}", dap_request.command)),
                    );
                } else {
                    let thread_id = parse_arguments::<ThreadArguments>(&dap_request)
                        .map(|a| a.thread_id)
                        .unwrap_or(0);
                    self.send_stopped_event("step", Some(dap_request.command.clone()), thread_id);
                }
                Ok(())
            }
            Command::Stop => {
                let thread_id = parse_arguments::<ThreadArguments>(&dap_request)
                    .map(|a| a.thread_id)
                    .unwrap_or(0);
                self.send_stopped_event("pause", Some("Paused".into()), thread_id);
                Ok(())
            }
            Command::Continue => {
                let body = ContinueResponseBody { all_threads_continued: true };
                self.send_response(&dap_request, Some(serde_json::to_value(body)?));
                Ok(())
            }
            Command::ExitChannel => {
                if update.is_error() {
                    self.send_failure(&dap_request, None);
                } else {
                    self.send_response(&dap_request, None);
                }
                self.send_event("terminated", None);
                Ok(())
            }
            Command::AddBreakpoints | Command::AddConditionalBreakpoints => {
                self.on_breakpoints_response(&update, &dap_request)
            }
            // This front-end drives evaluation through VARIABLES, not
            // EXECUTE, and never lists or removes breakpoints remotely.
            Command::Execute | Command::ListBreakpoints | Command::RemoveBreakpoints => Ok(()),
        }
    }

    fn on_threads_response(
        &self,
        update: &roku_protocol::Update,
        dap_request: &DapRequest,
    ) -> anyhow::Result<()> {
        if update.is_error() {
            self.send_failure(dap_request, Some("threads request failed".into()));
            return Ok(());
        }
        if dap_request.command == "scopes" {
            return self.continue_scopes(dap_request);
        }
        let UpdatePayload::Threads(response) = &update.payload else {
            anyhow::bail!("unexpected payload for threads response");
        };
        // Thread ids are indices, only meaningful while stopped.
        let threads = (0..response.threads.len())
            .map(|index| DapThread { id: index as i64, name: index.to_string() })
            .collect();
        let body = ThreadsResponseBody { threads };
        self.send_response(dap_request, Some(serde_json::to_value(body)?));
        Ok(())
    }

    fn on_stacktrace_response(
        &self,
        update: &roku_protocol::Update,
        dap_request: &DapRequest,
    ) -> anyhow::Result<()> {
        if update.is_error() {
            let message = "BrightScript protocol error: stacktrace failed".to_string();
            self.send_console(&message);
            self.send_failure(dap_request, Some(message));
            return Ok(());
        }
        if dap_request.command == "scopes" {
            return self.continue_scopes(dap_request);
        }

        let UpdatePayload::Stacktrace(response) = &update.payload else {
            anyhow::bail!("unexpected payload for stacktrace response");
        };
        let Some(request) = &update.request else {
            anyhow::bail!("stacktrace response without request");
        };
        let RequestArgs::Stacktrace { thread_index } = request.args else {
            anyhow::bail!("stacktrace response for wrong request");
        };
        let client = self.client()?;
        let project_root = self.state().project_root.clone();

        // Firmware with the stacktrace line bug reports a wrong line for
        // the stop site; the threads response carries the right one.
        let line_fixup = if client.has_feature(ProtocolFeature::BadLineNumberInStacktraceBug) {
            client.threads().and_then(|entry| entry.ok()).and_then(|threads| {
                threads.threads.get(thread_index as usize).map(|t| t.line_number)
            })
        } else {
            None
        };

        let innermost = response.frames.len().saturating_sub(1);
        let mut stack_frames = Vec::with_capacity(response.frames.len());
        for (frame_index, frame) in response.frames.iter().enumerate() {
            let id = client.stack_ref_id(thread_index, frame_index as u32, &[]);
            let line = match line_fixup {
                Some(fixed) if frame_index == innermost => fixed,
                _ => frame.line_number,
            };
            stack_frames.push(DapStackFrame {
                id: i64::from(id),
                name: frame.function_name.clone(),
                source: Some(source_for(&frame.file_path, project_root.as_deref())),
                line,
                column: 1,
            });
        }
        let total = stack_frames.len() as i64;
        let body = StackTraceResponseBody { stack_frames, total_frames: Some(total) };
        self.send_response(dap_request, Some(serde_json::to_value(body)?));
        Ok(())
    }

    fn on_variables_response(
        &self,
        update: &roku_protocol::Update,
        dap_request: &DapRequest,
    ) -> anyhow::Result<()> {
        match dap_request.command.as_str() {
            "evaluate" => self.respond_evaluate(update, dap_request),
            "scopes" => {
                if update.is_error() {
                    let message = "BrightScript protocol error: variables failed".to_string();
                    self.send_console(&message);
                    self.send_failure(dap_request, Some(message));
                    return Ok(());
                }
                self.respond_scopes(dap_request)
            }
            "variables" => {
                if update.is_error() {
                    self.send_failure(dap_request, Some("variables request failed".into()));
                    return Ok(());
                }
                self.respond_variables(dap_request)
            }
            other => {
                anyhow::bail!("variables response for unexpected DAP command {other}")
            }
        }
    }

    // ================================================================
    // Response synthesis (requires caches to be populated)
    // ================================================================

    fn respond_scopes(&self, dap_request: &DapRequest) -> anyhow::Result<()> {
        let args: ScopesArguments = parse_arguments(dap_request)?;
        let client = self.client()?;
        let frame_ref = u32::try_from(args.frame_id).context("bad frameId")?;
        let (thread_index, frame_index, _) = client.decode_stack_ref_id(frame_ref)?;

        let stacktrace = client
            .stacktrace(thread_index)
            .and_then(Result::ok)
            .context("stacktrace not cached for scopes")?;
        let frame = stacktrace
            .frames
            .get(frame_index as usize)
            .with_context(|| format!("no frame {frame_index} in thread {thread_index}"))?;
        let variables = client
            .variables(thread_index, frame_index, &[], false)
            .and_then(Result::ok)
            .context("variables not cached for scopes")?;

        let project_root = self.state().project_root.clone();
        // One scope per frame (locals), so the frame reference doubles
        // as the scope's variables reference.
        let scope = DapScope {
            name: "Locals".into(),
            variables_reference: i64::from(frame_ref),
            expensive: false,
            named_variables: Some(variables.variables.len() as i64),
            source: Some(source_for(&frame.file_path, project_root.as_deref())),
            line: Some(frame.line_number),
        };
        let body = ScopesResponseBody { scopes: vec![scope] };
        self.send_response(dap_request, Some(serde_json::to_value(body)?));
        Ok(())
    }

    fn respond_variables(&self, dap_request: &DapRequest) -> anyhow::Result<()> {
        let args: VariablesArguments = parse_arguments(dap_request)?;
        let client = self.client()?;
        let parent_ref = u32::try_from(args.variables_reference).context("bad variablesReference")?;
        let (thread_index, frame_index, variable_path) = client.decode_stack_ref_id(parent_ref)?;
        let response = client
            .variables(thread_index, frame_index, &variable_path, true)
            .and_then(Result::ok)
            .context("variables not cached")?;

        let mut dap_vars = Vec::new();
        let mut indexed_count = 0u32;
        for var in response.child_vars() {
            // Unnamed children are numerically indexed (array elements);
            // the target always sends the full list, in order.
            let name = match &var.name {
                Some(name) => name.clone(),
                None => {
                    let index = indexed_count;
                    indexed_count += 1;
                    index.to_string()
                }
            };
            let variables_reference = if var.is_container {
                i64::from(client.child_stack_ref_id(parent_ref, &name)?)
            } else {
                0
            };
            dap_vars.push(DapVariable {
                name,
                value: var.value_str_for_user(true),
                type_name: Some(var.type_name_for_user()),
                variables_reference,
            });
        }
        let body = VariablesResponseBody { variables: dap_vars };
        self.send_response(dap_request, Some(serde_json::to_value(body)?));
        Ok(())
    }

    fn respond_evaluate(
        &self,
        update: &roku_protocol::Update,
        dap_request: &DapRequest,
    ) -> anyhow::Result<()> {
        let Some(request) = &update.request else {
            anyhow::bail!("evaluate response without request");
        };
        let RequestArgs::Variables(var_args) = &request.args else {
            anyhow::bail!("evaluate response for wrong request");
        };
        let path_str = var_args.variable_path.join(".");

        if update.is_error() {
            let UpdatePayload::TargetError(data) = &update.payload else {
                anyhow::bail!("error update without error payload");
            };
            let shown = if path_str.is_empty() { "<empty>" } else { path_str.as_str() };
            let mut message = if update.err_code == ErrCode::InvalidArgs {
                format!("Unknown variable: {shown}")
            } else {
                format!("Evaluation failed: {}", update.err_code.user_str())
            };
            if let Some(index) = data.missing_key_path_index {
                message.push_str(&format!(" (missing key at path index {index})"));
            } else if let Some(index) = data.invalid_value_path_index {
                message.push_str(&format!(" (invalid value at path index {index})"));
            }
            self.send_failure(dap_request, Some(message));
            return Ok(());
        }

        let UpdatePayload::Variables(response) = &update.payload else {
            anyhow::bail!("unexpected payload for evaluate response");
        };
        let parent = response.parent_var().context("evaluate returned no variable")?;
        let eval_args: EvaluateArguments = parse_arguments(dap_request)?;
        let include_type = eval_args.context.as_deref() == Some("repl");

        let client = self.client()?;
        let variables_reference = if parent.is_container {
            i64::from(client.stack_ref_id(
                var_args.thread_index,
                var_args.frame_index,
                &var_args.variable_path,
            ))
        } else {
            0
        };

        let mut result = String::new();
        if include_type {
            result.push_str(&parent.type_name_for_user());
            result.push(' ');
        }
        result.push_str(&parent.value_str_for_user(!include_type));
        let body = EvaluateResponseBody {
            result,
            type_name: Some(parent.type_name_for_user()),
            variables_reference,
        };
        self.send_response(dap_request, Some(serde_json::to_value(body)?));
        Ok(())
    }

    fn on_breakpoints_response(
        &self,
        update: &roku_protocol::Update,
        dap_request: &DapRequest,
    ) -> anyhow::Result<()> {
        if update.is_error() {
            self.send_failure(dap_request, Some("setBreakpoints failed".into()));
            return Ok(());
        }
        let UpdatePayload::Breakpoints(response) = &update.payload else {
            anyhow::bail!("unexpected payload for breakpoints response");
        };
        let Some(request) = &update.request else {
            anyhow::bail!("breakpoints response without request");
        };
        let specs = match &request.args {
            RequestArgs::AddBreakpoints { breakpoints }
            | RequestArgs::AddConditionalBreakpoints { breakpoints } => breakpoints,
            _ => anyhow::bail!("breakpoints response for wrong request"),
        };

        let project_root = self.state().project_root.clone();
        // The target's response is sparse; positions line up with the
        // request entries.
        let mut breakpoints = Vec::with_capacity(specs.len());
        for (spec, info) in specs.iter().zip(&response.breakpoints) {
            breakpoints.push(DapBreakpoint {
                id: Some(i64::from(info.remote_id)),
                verified: info.err_code == ErrCode::Ok && info.remote_id != 0,
                line: spec.line_number,
                source: Some(source_for(&spec.file_uri, project_root.as_deref())),
            });
        }
        let body = SetBreakpointsResponseBody { breakpoints };
        self.send_response(dap_request, Some(serde_json::to_value(body)?));
        Ok(())
    }

    // ================================================================
    // Plumbing
    // ================================================================

    fn writer(&self) -> &DapWriter<W> {
        &self.shared.writer
    }

    fn state(&self) -> MutexGuard<'_, BridgeState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self) -> anyhow::Result<DebuggerClient> {
        self.state().client.clone().context("no debug session; launch first")
    }

    fn send_response(&self, request: &DapRequest, body: Option<Value>) {
        let response = DapResponse {
            seq: self.writer().next_seq(),
            msg_type: "response".into(),
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body,
        };
        if let Err(err) = self.writer().send(&response) {
            tracing::error!(error = %err, "could not send DAP response");
        }
    }

    fn send_failure(&self, request: &DapRequest, message: Option<String>) {
        let response = DapResponse {
            seq: self.writer().next_seq(),
            msg_type: "response".into(),
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message,
            body: None,
        };
        if let Err(err) = self.writer().send(&response) {
            tracing::error!(error = %err, "could not send DAP error response");
        }
    }

    fn send_event(&self, event: &str, body: Option<Value>) {
        let message = DapEvent {
            seq: self.writer().next_seq(),
            msg_type: "event".into(),
            event: event.to_string(),
            body,
        };
        if let Err(err) = self.writer().send(&message) {
            tracing::error!(error = %err, event, "could not send DAP event");
        }
    }

    fn send_stopped_event(&self, reason: &str, description: Option<String>, thread_id: i64) {
        let body = StoppedEventBody {
            reason: reason.to_string(),
            description,
            // Negative means "unset" on the wire; DAP has no such notion.
            thread_id: (thread_id >= 0).then_some(thread_id),
            all_threads_stopped: Some(true),
        };
        self.send_event("stopped", serde_json::to_value(body).ok());
    }

    fn send_console(&self, message: &str) {
        let body = OutputEventBody { category: "console".into(), output: format!("{message}\n") };
        self.send_event("output", serde_json::to_value(body).ok());
    }
}

fn parse_arguments<T: serde::de::DeserializeOwned>(request: &DapRequest) -> anyhow::Result<T> {
    let arguments = request
        .arguments
        .clone()
        .with_context(|| format!("missing arguments for {}", request.command))?;
    serde_json::from_value(arguments)
        .with_context(|| format!("invalid arguments for {}", request.command))
}

fn stop_reason_for_dap(reason: roku_protocol::ThreadStopReason) -> &'static str {
    use roku_protocol::ThreadStopReason::*;
    match reason {
        Break => "breakpoint",
        StopStatement => "pause",
        Error => "exception",
        NormalExit | NotStopped | Undefined => "pause",
    }
}

/// Map an IDE file path to a `pkg:/` URI relative to the project root.
fn source_uri(path: &str, project_root: Option<&Path>) -> Option<String> {
    let root = project_root?;
    let relative = Path::new(path).strip_prefix(root).ok()?;
    let mut uri = String::from("pkg:/");
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    uri.push_str(&parts.join("/"));
    Some(uri)
}

/// Map a target file URI back to an IDE source descriptor.
fn source_for(file_uri: &str, project_root: Option<&Path>) -> Source {
    let name = file_uri.rsplit('/').next().map(str::to_string);
    let path = match (file_uri.strip_prefix("pkg:/"), project_root) {
        (Some(relative), Some(root)) => root.join(relative).to_string_lossy().into_owned(),
        _ => file_uri.to_string(),
    };
    Source { path: Some(path), name }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_uri_requires_project_root_prefix() {
        let root = PathBuf::from("/proj");
        assert_eq!(
            source_uri("/proj/source/main.brs", Some(&root)).as_deref(),
            Some("pkg:/source/main.brs")
        );
        assert_eq!(source_uri("/elsewhere/main.brs", Some(&root)), None);
        assert_eq!(source_uri("/proj/source/main.brs", None), None);
    }

    #[test]
    fn source_for_round_trips_pkg_uris() {
        let root = PathBuf::from("/proj");
        let source = source_for("pkg:/source/main.brs", Some(&root));
        assert_eq!(source.path.as_deref(), Some("/proj/source/main.brs"));
        assert_eq!(source.name.as_deref(), Some("main.brs"));

        // lib: URIs have no local counterpart; passed through untouched.
        let source = source_for("lib:/mylib/util.brs", Some(&root));
        assert_eq!(source.path.as_deref(), Some("lib:/mylib/util.brs"));
    }

    #[test]
    fn stop_reasons_map_to_dap_vocabulary() {
        use roku_protocol::ThreadStopReason;
        assert_eq!(stop_reason_for_dap(ThreadStopReason::Break), "breakpoint");
        assert_eq!(stop_reason_for_dap(ThreadStopReason::Error), "exception");
        assert_eq!(stop_reason_for_dap(ThreadStopReason::StopStatement), "pause");
    }
}
