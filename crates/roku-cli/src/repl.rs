//! Interactive command-line front-end.
//!
//! The driver loop reads one command line at a time, sends the matching
//! debugger request, and waits on a condvar-backed queue for the
//! response. Asynchronous updates (stops, attaches, compile errors) are
//! announced as they arrive, whatever the prompt is doing.

use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;

use roku_client::{
    Breakpoint, BreakpointManager, DebuggerClient, HandlerOutcome, TargetEvent, UpdateHandler,
};
use roku_protocol::{
    ErrCode, ProtocolFeature, Request, RequestArgs, StepType, Update, UpdatePayload, VariablesArgs,
};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Queue of responses, fed by the update callback, drained by the
/// driver loop.
#[derive(Default)]
pub struct ResponseQueue {
    responses: Mutex<VecDeque<Update>>,
    condvar: Condvar,
    done: Mutex<bool>,
}

impl ResponseQueue {
    fn push(&self, update: Update) {
        self.lock().push_back(update);
        self.condvar.notify_all();
    }

    fn mark_done(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.condvar.notify_all();
    }

    fn is_done(&self) -> bool {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the response to a specific request.
    fn wait_for(&self, request_id: u32) -> Option<Update> {
        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        let mut responses = self.lock();
        loop {
            if let Some(index) =
                responses.iter().position(|u| u.request_id == request_id)
            {
                return responses.remove(index);
            }
            if self.is_done() {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .condvar
                .wait_timeout(responses, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            responses = guard;
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Update>> {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Build the update handler wired into the client: responses go to the
/// queue, asynchronous events go straight to the terminal.
pub fn update_handler(queue: Arc<ResponseQueue>) -> UpdateHandler {
    Box::new(move |event| match event {
        TargetEvent::Update(update) => {
            match &update.payload {
                UpdatePayload::AllThreadsStopped {
                    primary_thread_index,
                    stop_reason,
                    stop_reason_detail,
                } => {
                    let mut line =
                        format!("\ntarget stopped: {}", stop_reason.user_str());
                    if !stop_reason_detail.is_empty() {
                        line.push_str(&format!(": {stop_reason_detail}"));
                    }
                    line.push_str(&format!(" (primary thread {primary_thread_index})"));
                    println!("{line}");
                }
                UpdatePayload::ThreadAttached { thread_index, stop_reason, .. } => {
                    println!("\nthread {thread_index} attached: {}", stop_reason.user_str());
                }
                UpdatePayload::CompileError(err) => {
                    println!("\ncompile error: {}", err.format_for_user());
                }
                UpdatePayload::BreakpointError(err) => {
                    for message in err
                        .compile_errors
                        .iter()
                        .chain(&err.runtime_errors)
                        .chain(&err.other_errors)
                    {
                        println!("\nbreakpoint {} error: {message}", err.breakpoint_id);
                    }
                }
                _ => {}
            }
            if update.is_response() {
                queue.push(update);
            }
            HandlerOutcome::Continue
        }
        TargetEvent::ConnectionError(err) => {
            println!("\nconnection to target lost: {err}");
            queue.mark_done();
            HandlerOutcome::Done
        }
    })
}

/// The interactive session.
pub struct Repl {
    client: DebuggerClient,
    queue: Arc<ResponseQueue>,
    breakpoints: BreakpointManager,
}

impl Repl {
    pub fn new(client: DebuggerClient, queue: Arc<ResponseQueue>) -> Self {
        Self { client, queue, breakpoints: BreakpointManager::new() }
    }

    /// Drive the session until `quit`, EOF, or connection loss.
    pub fn run(&mut self) -> anyhow::Result<()> {
        println!(
            "connected, protocol version {} (type 'help' for commands)",
            self.client.protocol_version()
        );
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            if self.queue.is_done() {
                return Ok(());
            }
            print!("rokudebug> ");
            std::io::stdout().flush()?;
            line.clear();
            if stdin.lock().read_line(&mut line)? == 0 {
                break; // EOF
            }
            match self.dispatch(line.trim()) {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => println!("error: {err}"),
            }
        }
        self.client.shutdown();
        Ok(())
    }

    /// Returns `true` when the session should end.
    fn dispatch(&mut self, line: &str) -> anyhow::Result<bool> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else { return Ok(false) };
        let args: Vec<&str> = words.collect();

        match command {
            "help" | "h" => print_help(),
            "quit" | "q" | "exit" => return Ok(true),
            "status" => self.cmd_status(),
            "threads" | "thr" => self.cmd_threads()?,
            "stacktrace" | "bt" => self.cmd_stacktrace(&args)?,
            "vars" | "v" => self.cmd_vars(&args)?,
            "print" | "p" => self.cmd_print(&args)?,
            "exec" => self.cmd_execute(&args)?,
            "step" | "s" => self.cmd_step(&args, StepType::Line)?,
            "over" => self.cmd_step(&args, StepType::Over)?,
            "out" => self.cmd_step(&args, StepType::Out)?,
            "continue" | "c" => self.cmd_ack_command(RequestArgs::Continue)?,
            "stop" => self.cmd_ack_command(RequestArgs::Stop)?,
            "break" | "b" => self.cmd_add_breakpoint(&args)?,
            "delete" | "d" => self.cmd_remove_breakpoint(&args)?,
            "breakpoints" | "lb" => self.cmd_list_breakpoints(),
            other => println!("unknown command: {other} (try 'help')"),
        }
        Ok(false)
    }

    fn cmd_status(&self) {
        println!("protocol version: {}", self.client.protocol_version());
        println!("pending requests: {}", self.client.pending_request_count());
        let features: Vec<_> =
            self.client.features().iter().map(|f| f.user_name()).collect();
        println!("target features: {}", features.join(","));
    }

    fn cmd_threads(&self) -> anyhow::Result<()> {
        let update = self.roundtrip(Request::new(RequestArgs::Threads))?;
        match &update.payload {
            UpdatePayload::Threads(response) => {
                for (index, thread) in response.threads.iter().enumerate() {
                    let marker = if thread.is_primary { "*" } else { " " };
                    println!(
                        "{marker}{index}: {}() {}:{} ({})",
                        thread.function_name,
                        thread.file_path,
                        thread.line_number,
                        thread.stop_reason.user_str(),
                    );
                }
            }
            payload => print_unexpected(&update, payload),
        }
        Ok(())
    }

    fn cmd_stacktrace(&self, args: &[&str]) -> anyhow::Result<()> {
        let thread_index = parse_index(args.first(), 0)?;
        let update =
            self.roundtrip(Request::new(RequestArgs::Stacktrace { thread_index }))?;
        match &update.payload {
            UpdatePayload::Stacktrace(response) => {
                // Innermost frame first, like a conventional backtrace.
                for (index, frame) in response.frames.iter().enumerate().rev() {
                    println!(
                        "#{index}: {}() {}:{}",
                        frame.function_name, frame.file_path, frame.line_number
                    );
                }
            }
            payload => print_unexpected(&update, payload),
        }
        Ok(())
    }

    fn cmd_vars(&self, args: &[&str]) -> anyhow::Result<()> {
        let thread_index = parse_index(args.first(), 0)?;
        let frame_index = parse_index(args.get(1), 0)?;
        let update = self.roundtrip(Request::new(RequestArgs::Variables(VariablesArgs {
            thread_index,
            frame_index,
            variable_path: Vec::new(),
            force_case_insensitive: Vec::new(),
            get_child_keys: true,
        })))?;
        self.print_variables(&update);
        Ok(())
    }

    fn cmd_print(&self, args: &[&str]) -> anyhow::Result<()> {
        let expr = args.first().context("usage: print <variable[.path]> [thread] [frame]")?;
        let thread_index = parse_index(args.get(1), 0)?;
        let frame_index = parse_index(args.get(2), 0)?;
        let path: Vec<String> = expr.to_lowercase().split('.').map(str::to_string).collect();
        let path_len = path.len();
        let update = self.roundtrip(Request::new(RequestArgs::Variables(VariablesArgs {
            thread_index,
            frame_index,
            variable_path: path,
            force_case_insensitive: vec![true; path_len],
            get_child_keys: true,
        })))?;
        self.print_variables(&update);
        Ok(())
    }

    fn print_variables(&self, update: &Update) {
        match &update.payload {
            UpdatePayload::Variables(response) => {
                if let Some(parent) = response.parent_var() {
                    println!(
                        "{} {}",
                        parent.type_name_for_user(),
                        parent.value_str_for_user(false)
                    );
                }
                for var in response.child_vars() {
                    println!(
                        "    {} {} {}",
                        var.name.as_deref().unwrap_or("-"),
                        var.type_name_for_user(),
                        var.value_str_for_user(true)
                    );
                }
            }
            payload => print_unexpected(update, payload),
        }
    }

    fn cmd_execute(&self, args: &[&str]) -> anyhow::Result<()> {
        if !self.client.has_feature(ProtocolFeature::ExecuteCommand) {
            anyhow::bail!("target does not support the execute command");
        }
        let source_code = args.join(" ");
        if source_code.is_empty() {
            anyhow::bail!("usage: exec <brightscript source>");
        }
        let update = self.roundtrip(Request::new(RequestArgs::Execute {
            thread_index: 0,
            frame_index: 0,
            source_code,
        }))?;
        match &update.payload {
            UpdatePayload::Execute(response) => {
                if response.run_success {
                    println!("executed");
                } else {
                    println!("execution failed");
                }
                for err in response
                    .compile_errors
                    .iter()
                    .chain(&response.runtime_errors)
                    .chain(&response.other_errors)
                {
                    println!("    {err}");
                }
            }
            // Pre-3.0 targets acknowledge without a payload.
            UpdatePayload::CommandAck => println!("executed"),
            payload => print_unexpected(&update, payload),
        }
        Ok(())
    }

    fn cmd_step(&self, args: &[&str], step_type: StepType) -> anyhow::Result<()> {
        if !self.client.has_feature(ProtocolFeature::StepCommands) {
            anyhow::bail!("target does not support step commands");
        }
        let thread_index = parse_index(args.first(), 0)?;
        // The acknowledgement is immediate; the interesting part is the
        // stop event that follows, printed by the update handler.
        self.client.send_expecting_stop(Request::new(RequestArgs::Step {
            thread_index,
            step_type,
        }))?;
        Ok(())
    }

    fn cmd_ack_command(&self, args: RequestArgs) -> anyhow::Result<()> {
        let update = self.roundtrip(Request::new(args))?;
        if update.is_error() {
            println!("target error: {}", update.err_code.user_str());
        }
        Ok(())
    }

    fn cmd_add_breakpoint(&mut self, args: &[&str]) -> anyhow::Result<()> {
        if !self.client.has_feature(ProtocolFeature::Breakpoints) {
            anyhow::bail!("target does not support breakpoints");
        }
        let file = args.first().context("usage: break <file> <line> [ignore_count] [condition]")?;
        let line: u32 = args.get(1).context("missing line number")?.parse()?;
        let ignore_count: u32 = args.get(2).map(|s| s.parse()).transpose()?.unwrap_or(0);
        let condition = args.get(3).map(|s| s.to_string());

        let uri = if file.contains(":/") { file.to_string() } else { format!("pkg:/{file}") };
        let mut breakpoint =
            Breakpoint::new(uri.clone(), line).with_ignore_count(ignore_count);
        if let Some(cond) = &condition {
            if !self.client.has_feature(ProtocolFeature::ConditionalBreakpoints) {
                anyhow::bail!("target does not support conditional breakpoints");
            }
            breakpoint = breakpoint.with_condition(cond.clone());
        }

        let spec = roku_protocol::BreakpointSpec {
            file_uri: uri,
            line_number: line,
            ignore_count,
            cond_expr: breakpoint.cond_expr.clone(),
        };
        let request_args = if breakpoint.cond_expr.is_some() {
            RequestArgs::AddConditionalBreakpoints { breakpoints: vec![spec] }
        } else {
            RequestArgs::AddBreakpoints { breakpoints: vec![spec] }
        };

        let update = self.roundtrip(Request::new(request_args))?;
        match &update.payload {
            UpdatePayload::Breakpoints(response) => {
                let info = response.breakpoints.first().context("empty breakpoint response")?;
                if info.err_code != ErrCode::Ok {
                    println!("target rejected breakpoint: {}", info.err_code.user_str());
                    return Ok(());
                }
                breakpoint.remote_id = Some(info.remote_id);
                breakpoint.verified = true;
                let managed = self.breakpoints.add_or_update(breakpoint);
                println!(
                    "breakpoint {} set at {}:{}",
                    managed.local_id.unwrap_or(0),
                    managed.file_uri,
                    managed.line_number
                );
            }
            payload => print_unexpected(&update, payload),
        }
        Ok(())
    }

    fn cmd_remove_breakpoint(&mut self, args: &[&str]) -> anyhow::Result<()> {
        let local_id: u32 = args.first().context("usage: delete <breakpoint-id>")?.parse()?;
        let breakpoint = self
            .breakpoints
            .find_by_local_id(local_id)
            .with_context(|| format!("no breakpoint {local_id}"))?;
        let remote_id = breakpoint.remote_id.filter(|id| *id != 0);

        if let Some(remote_id) = remote_id {
            let update = self.roundtrip(Request::new(RequestArgs::RemoveBreakpoints {
                remote_ids: vec![remote_id],
            }))?;
            if update.is_error() {
                println!("target error: {}", update.err_code.user_str());
                return Ok(());
            }
        }
        self.breakpoints.remove_by_local_id(local_id);
        println!("breakpoint {local_id} removed");
        Ok(())
    }

    fn cmd_list_breakpoints(&self) {
        if self.breakpoints.is_empty() {
            println!("no breakpoints");
            return;
        }
        for bp in self.breakpoints.iter() {
            let mut line = format!(
                "{}: {}:{}",
                bp.local_id.unwrap_or(0),
                bp.file_uri,
                bp.line_number
            );
            if let Some(cond) = &bp.cond_expr {
                line.push_str(&format!(" if {cond}"));
            }
            if bp.ignore_count > 0 {
                line.push_str(&format!(" ignore={}", bp.ignore_count));
            }
            if !bp.is_on_target() {
                line.push_str(" (not installed)");
            }
            println!("{line}");
        }
    }

    /// Send a request and wait for its response.
    fn roundtrip(&self, request: Request) -> anyhow::Result<Update> {
        let request_id = self.client.send(request)?;
        self.queue
            .wait_for(request_id)
            .context("no response from target (session may be over)")
    }
}

fn parse_index(arg: Option<&&str>, default: u32) -> anyhow::Result<u32> {
    match arg {
        Some(raw) => raw.parse::<u32>().with_context(|| format!("bad index: {raw}")),
        None => Ok(default),
    }
}

fn print_unexpected(update: &Update, payload: &UpdatePayload) {
    if update.is_error() {
        println!("target error: {}", update.err_code.user_str());
    } else {
        println!("unexpected response: {payload:?}");
    }
}

fn print_help() {
    println!(
        "\
commands:
  threads                 list stopped threads (primary marked with *)
  bt [thread]             stacktrace of a thread
  vars [thread] [frame]   local variables of a stack frame
  print <var[.path]>      value of a variable
  exec <source>           run a source snippet on the stopped target
  step | over | out       step the primary thread
  continue | c            resume all threads
  stop                    stop all threads
  break <file> <line> [ignore] [cond]   add a breakpoint
  delete <id>             remove a breakpoint
  breakpoints | lb        list breakpoints
  status                  session status
  quit                    end the session"
    );
}
