//! The agent turn engine.
//!
//! An [`AgentLoop`] owns one conversation with the model: `run()` drives a
//! turn (possibly many streamed requests deep, when the model keeps issuing
//! tool calls), `cancel()` invalidates the turn in flight, and `terminate()`
//! poisons the instance. The UI talks to the engine exclusively through the
//! [`SessionHooks`] capability bundle, which keeps the engine testable with a
//! deterministic recorder.
//!
//! Two pieces of bookkeeping carry the conversational contract across
//! interruptions:
//!
//! - the *pending-abort ledger*: every `function_call` id the model emitted
//!   but has not yet been answered. The next request must answer each id, so
//!   a fresh `run()` first drains the ledger into synthetic "aborted"
//!   outputs. `cancel()` must never clear it.
//! - *staged delivery with generation fencing*: items parsed from the stream
//!   are delivered to the UI only after a short delay, and only if the
//!   generation they were staged under is still current. A cancel that lands
//!   between parse and delivery therefore suppresses the item.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use quill_apply_patch::MaybeApplyPatch;
use quill_apply_patch::PatchInvocation;
use quill_apply_patch::apply_hunks;
use quill_apply_patch::maybe_parse_apply_patch;
use quill_apply_patch::resolve_hunks;
use quill_protocol::ApprovalPolicy;
use quill_protocol::CommandConfirmation;
use quill_protocol::ContentItem;
use quill_protocol::FunctionCallOutputPayload;
use quill_protocol::ResponseInputItem;
use quill_protocol::ResponseItem;
use quill_protocol::ReviewDecision;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::client::ModelClient;
use crate::client_common::Prompt;
use crate::client_common::ResponseEvent;
use crate::error::QuillErr;
use crate::error::Result;
use crate::exec::ExecParams;
use crate::exec::SandboxType;
use crate::exec::process_exec_tool_call;
use crate::safety::SafetyCheck;
use crate::safety::assess_command_safety;
use crate::safety::assess_patch_safety;
use crate::util::backoff;
use crate::util::resolve_path;
use crate::util::strip_bash_lc_and_escape;

/// Delay between parsing an item off the stream and handing it to the UI.
/// The window lets a near-simultaneous `cancel()` win the race.
const STAGE_DELAY: Duration = Duration::from_millis(10);

/// Delay before the end-of-turn flush of any still-undelivered items.
const FLUSH_DELAY: Duration = Duration::from_millis(30);

/// Retries of a streamed request that died mid-flight (the request-open
/// itself retries separately inside the client).
const MAX_STREAM_RETRIES: u64 = 5;

/// Tool names the exec handler accepts. `container.exec` is a compatibility
/// alias emitted by some models.
const SHELL_TOOL_NAMES: [&str; 2] = ["shell", "container.exec"];

/// The five ports the engine needs from its embedder.
#[async_trait]
pub trait SessionHooks: Send + Sync + 'static {
    /// A conversation item cleared the staging gate.
    fn on_item(&self, item: ResponseItem);

    /// The engine started or stopped doing work.
    fn on_loading(&self, loading: bool);

    /// A `response.completed` arrived; `response_id` chains the next turn.
    fn on_last_response_id(&self, response_id: &str);

    /// Ask the user to approve a command (or a patch, when `patch` is set).
    /// `explanation` carries the text produced by [`Self::get_explanation`]
    /// when the user asked for one on the previous round.
    async fn get_command_confirmation(
        &self,
        command: Vec<String>,
        patch: Option<String>,
        explanation: Option<String>,
    ) -> CommandConfirmation;

    /// Produce a human-readable explanation of `command` for the approval
    /// prompt (typically a side call to the model).
    async fn get_explanation(&self, command: Vec<String>) -> String;
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub approval_policy: ApprovalPolicy,
    /// Instructions appended to the fixed preamble on every request.
    pub instructions: Option<String>,
    /// Extra writable roots beyond the defaults (cwd and the system temp
    /// dir). Must be absolute.
    pub writable_roots: Vec<PathBuf>,
    pub cwd: PathBuf,
    /// Helper executable that applies Landlock rules before exec'ing the
    /// tool command; required for sandboxed execution on Linux.
    pub linux_sandbox_helper: Option<PathBuf>,
}

impl AgentConfig {
    pub fn new(model: impl Into<String>, approval_policy: ApprovalPolicy) -> Self {
        Self {
            model: model.into(),
            approval_policy,
            instructions: None,
            writable_roots: Vec::new(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            linux_sandbox_helper: None,
        }
    }
}

#[derive(Default)]
struct SessionState {
    /// Bumped on every `run()` and every `cancel()`; deferred callbacks
    /// no-op when their captured generation is stale.
    generation: u64,
    canceled: bool,
    /// Call ids the model emitted that have not been answered yet.
    pending_aborts: HashSet<String>,
    last_response_id: Option<String>,
    /// Argvs approved with "always" this session.
    approved_commands: HashSet<Vec<String>>,
    /// Items awaiting delivery; slots are nulled as they are delivered.
    staged: Vec<Option<ResponseItem>>,
}

pub struct AgentLoop {
    config: AgentConfig,
    client: ModelClient,
    hooks: Arc<dyn SessionHooks>,
    state: Arc<Mutex<SessionState>>,
    /// Cancellation delivered to child processes of the current turn.
    exec_cancel: Mutex<CancellationToken>,
    /// Aborts the streamed request of the current turn.
    turn_cancel: Mutex<CancellationToken>,
    /// Subsumes everything; fired once by `terminate()`.
    master_cancel: CancellationToken,
    terminated: AtomicBool,
    /// cwd + system temp dir + configured roots, absolutized once.
    effective_writable_roots: Vec<PathBuf>,
}

impl AgentLoop {
    pub fn new(config: AgentConfig, hooks: Arc<dyn SessionHooks>) -> Self {
        let client = ModelClient::new(config.model.clone());
        Self::with_client(config, hooks, client)
    }

    /// Engine with an explicitly constructed client. Used by tests and
    /// embedders that point at a proxy.
    pub fn with_client(
        config: AgentConfig,
        hooks: Arc<dyn SessionHooks>,
        client: ModelClient,
    ) -> Self {
        let mut roots = vec![config.cwd.clone(), std::env::temp_dir()];
        roots.extend(config.writable_roots.iter().cloned());
        let effective_writable_roots = roots
            .into_iter()
            .map(|root| resolve_path(&config.cwd, &root))
            .collect();

        Self {
            config,
            client,
            hooks,
            state: Arc::new(Mutex::new(SessionState::default())),
            exec_cancel: Mutex::new(CancellationToken::new()),
            turn_cancel: Mutex::new(CancellationToken::new()),
            master_cancel: CancellationToken::new(),
            terminated: AtomicBool::new(false),
            effective_writable_roots,
        }
    }

    /// Drive one turn: `input` plus any synthesized abort answers, streamed
    /// requests until the model stops calling tools.
    ///
    /// Returns `Ok(())` for every outcome that leaves the session usable --
    /// including cancellation and surfaced API errors. The only `Err` is
    /// calling into a terminated instance.
    pub async fn run(
        &self,
        input: Vec<ResponseItem>,
        previous_response_id: Option<String>,
    ) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(QuillErr::SessionTerminated);
        }

        let exec_token = CancellationToken::new();
        let turn_token = CancellationToken::new();
        {
            *self.exec_cancel.lock().unwrap() = exec_token.clone();
            *self.turn_cancel.lock().unwrap() = turn_token.clone();
        }

        let (generation, turn_input) = {
            let mut st = self.state.lock().unwrap();
            st.generation += 1;
            st.canceled = false;
            st.staged.clear();
            if previous_response_id.is_some() {
                st.last_response_id = previous_response_id;
            }

            // Settle the ledger: every dangling call id gets a synthetic
            // "aborted" output, prepended so the API sees the answers first.
            let mut dangling: Vec<String> = st.pending_aborts.iter().cloned().collect();
            dangling.sort();
            let mut turn_input: Vec<ResponseItem> = dangling
                .into_iter()
                .map(|call_id| ResponseItem::FunctionCallOutput {
                    call_id,
                    output: FunctionCallOutputPayload {
                        content: aborted_function_output(),
                        success: Some(false),
                    },
                })
                .collect();
            turn_input.extend(input);
            (st.generation, turn_input)
        };

        self.hooks.on_loading(true);
        let turn_start = Instant::now();

        let result = self
            .run_turn_loop(generation, turn_input, turn_start, &exec_token, &turn_token)
            .await;

        match result {
            Ok(()) => {
                self.flush_staged(generation).await;
                self.hooks.on_loading(false);
            }
            Err(QuillErr::Interrupted) => {
                // Silent abort. When the interruption came from cancel() the
                // loading transition was already emitted there; an Abort
                // approval decision ends up here without one.
                let canceled = { self.state.lock().unwrap().canceled };
                if !canceled {
                    self.hooks.on_loading(false);
                }
            }
            Err(QuillErr::SessionTerminated) => {}
            Err(err) => {
                warn!("turn failed: {err}");
                if let Some(message) = err.user_message() {
                    self.stage_item(
                        generation,
                        ResponseItem::Message {
                            role: "system".to_string(),
                            content: vec![ContentItem::OutputText { text: message }],
                        },
                    );
                }
                self.flush_staged(generation).await;
                self.hooks.on_loading(false);
            }
        }
        Ok(())
    }

    /// Invalidate the current turn. Idempotent and safe to call at any time.
    ///
    /// Pending aborts are deliberately retained: the model still remembers
    /// its unanswered calls, and the next `run()` must settle them.
    pub fn cancel(&self) {
        {
            self.turn_cancel.lock().unwrap().cancel();
            let fresh = CancellationToken::new();
            let old = std::mem::replace(&mut *self.exec_cancel.lock().unwrap(), fresh);
            old.cancel();

            let mut st = self.state.lock().unwrap();
            st.canceled = true;
            if st.pending_aborts.is_empty() {
                // A clean turn boundary; the next run starts a fresh chain.
                st.last_response_id = None;
            }
            st.generation += 1;
        }
        self.hooks.on_loading(false);
    }

    /// Permanently shut the instance down. Subsequent `run()` calls fail.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.master_cancel.cancel();
        self.cancel();
    }

    async fn run_turn_loop(
        &self,
        generation: u64,
        mut turn_input: Vec<ResponseItem>,
        turn_start: Instant,
        exec_token: &CancellationToken,
        turn_token: &CancellationToken,
    ) -> Result<()> {
        while !turn_input.is_empty() {
            // Everything the engine is about to send is also shown to the
            // user, through the same staging gate as streamed output.
            for item in &turn_input {
                self.stage_item(generation, item.clone());
            }

            let previous_response_id = {
                let st = self.state.lock().unwrap();
                st.last_response_id.clone()
            };
            let prompt = Prompt {
                input: std::mem::take(&mut turn_input),
                previous_response_id,
                user_instructions: self.config.instructions.clone(),
            };

            let mut retries: u64 = 0;
            let (response_id, calls) = loop {
                match self
                    .stream_one_request(&prompt, generation, turn_start, turn_token)
                    .await
                {
                    Ok(done) => break done,
                    Err(err @ (QuillErr::Interrupted | QuillErr::SessionTerminated)) => {
                        return Err(err);
                    }
                    Err(err) => {
                        if !err.is_retryable() || retries >= MAX_STREAM_RETRIES {
                            return Err(err);
                        }
                        retries += 1;
                        let delay = err.retry_hint().unwrap_or_else(|| backoff(retries));
                        info!(
                            "stream error: {err}; retrying {retries}/{MAX_STREAM_RETRIES} in {delay:?}"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = turn_token.cancelled() => return Err(QuillErr::Interrupted),
                            _ = self.master_cancel.cancelled() => {
                                return Err(QuillErr::SessionTerminated);
                            }
                        }
                    }
                }
            };

            {
                let mut st = self.state.lock().unwrap();
                st.last_response_id = Some(response_id.clone());
            }
            self.hooks.on_last_response_id(&response_id);

            // ApplyingTools: answer every call, in emission order. Each
            // answer leads the next request's input, followed by whatever
            // synthetic items the exec path produced.
            let mut next_input: Vec<ResponseItem> = Vec::new();
            for call in calls {
                if turn_token.is_cancelled() {
                    return Err(QuillErr::Interrupted);
                }
                let produced = self.handle_function_call(call, exec_token).await?;
                next_input.extend(produced.into_iter().map(ResponseItem::from));
            }
            turn_input = next_input;
        }
        Ok(())
    }

    /// Open one streamed request and drain it to `response.completed`.
    ///
    /// Non-call items are staged as they arrive; function calls are recorded
    /// in the pending-abort ledger and returned for the tool phase. On
    /// completion the fallback processor walks the response's final output
    /// array to pick up anything the incremental events missed.
    async fn stream_one_request(
        &self,
        prompt: &Prompt,
        generation: u64,
        turn_start: Instant,
        turn_token: &CancellationToken,
    ) -> Result<(String, Vec<FunctionCallRequest>)> {
        let mut stream = tokio::select! {
            stream = self.client.stream(prompt) => stream?,
            _ = turn_token.cancelled() => return Err(QuillErr::Interrupted),
            _ = self.master_cancel.cancelled() => return Err(QuillErr::SessionTerminated),
        };

        // The request is on the wire: every answered call id in it is now
        // settled from the API's point of view.
        {
            let mut st = self.state.lock().unwrap();
            for item in &prompt.input {
                if let ResponseItem::FunctionCallOutput { call_id, .. } = item {
                    st.pending_aborts.remove(call_id);
                }
            }
        }

        let mut calls: Vec<FunctionCallRequest> = Vec::new();
        let mut streamed: Vec<ResponseItem> = Vec::new();

        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                _ = turn_token.cancelled() => return Err(QuillErr::Interrupted),
                _ = self.master_cancel.cancelled() => return Err(QuillErr::SessionTerminated),
            };
            let Some(event) = event else {
                return Err(QuillErr::Stream(
                    "stream closed before response.completed".into(),
                    None,
                ));
            };

            match event? {
                ResponseEvent::Created => {}
                ResponseEvent::OutputItemDone(item) => {
                    streamed.push(item.clone());
                    self.absorb_output_item(item, &mut calls, generation, turn_start);
                }
                ResponseEvent::Completed {
                    response_id,
                    output,
                } => {
                    // Fallback processor: stage residual items and collect
                    // calls that never got an incremental event.
                    for item in output {
                        if streamed.contains(&item) {
                            continue;
                        }
                        debug!("fallback processor caught an unstreamed item");
                        self.absorb_output_item(item, &mut calls, generation, turn_start);
                    }
                    return Ok((response_id, calls));
                }
            }
        }
    }

    /// Route one output item: calls into the ledger, everything else into
    /// the staging gate. Reasoning summaries get their measured duration.
    fn absorb_output_item(
        &self,
        item: ResponseItem,
        calls: &mut Vec<FunctionCallRequest>,
        generation: u64,
        turn_start: Instant,
    ) {
        match item {
            ResponseItem::FunctionCall {
                name,
                arguments,
                call_id,
            } => {
                if calls.iter().any(|c| c.call_id == call_id) {
                    return;
                }
                {
                    let mut st = self.state.lock().unwrap();
                    st.pending_aborts.insert(call_id.clone());
                }
                calls.push(FunctionCallRequest {
                    name,
                    arguments,
                    call_id,
                });
            }
            ResponseItem::Reasoning { summary, .. } => {
                self.stage_item(
                    generation,
                    ResponseItem::Reasoning {
                        summary,
                        duration_ms: Some(turn_start.elapsed().as_millis() as u64),
                    },
                );
            }
            other => self.stage_item(generation, other),
        }
    }

    /// Append `item` to the staged array and schedule its delivery. The
    /// delivery callback re-checks the generation so a cancel that lands
    /// inside the window suppresses the item.
    fn stage_item(&self, generation: u64, item: ResponseItem) {
        let index = {
            let mut st = self.state.lock().unwrap();
            if st.canceled || st.generation != generation {
                return;
            }
            st.staged.push(Some(item));
            st.staged.len() - 1
        };

        let state = Arc::clone(&self.state);
        let hooks = Arc::clone(&self.hooks);
        tokio::spawn(async move {
            tokio::time::sleep(STAGE_DELAY).await;
            let deliverable: Vec<ResponseItem> = {
                let mut st = state.lock().unwrap();
                if st.generation != generation || st.canceled {
                    return;
                }
                // Drain in order up to this slot so near-simultaneous timers
                // cannot reorder delivery.
                st.staged[..=index]
                    .iter_mut()
                    .filter_map(Option::take)
                    .collect()
            };
            for item in deliverable {
                hooks.on_item(item);
            }
        });
    }

    /// Deliver whatever is still staged, after a grace window for a
    /// last-moment cancel.
    async fn flush_staged(&self, generation: u64) {
        tokio::time::sleep(FLUSH_DELAY).await;
        let remaining: Vec<ResponseItem> = {
            let mut st = self.state.lock().unwrap();
            if st.generation != generation || st.canceled {
                return;
            }
            st.staged.iter_mut().filter_map(Option::take).collect()
        };
        for item in remaining {
            self.hooks.on_item(item);
        }
    }

    /// Dispatch one tool call. Always produces the `function_call_output`
    /// answering `call.call_id` as the first returned item.
    async fn handle_function_call(
        &self,
        call: FunctionCallRequest,
        exec_token: &CancellationToken,
    ) -> Result<Vec<ResponseInputItem>> {
        let FunctionCallRequest {
            name,
            arguments,
            call_id,
        } = call;

        if !SHELL_TOOL_NAMES.contains(&name.as_str()) {
            return Ok(vec![function_output(
                call_id,
                format!("unsupported function: {name}"),
                1,
                Duration::ZERO,
            )]);
        }

        let params: ShellToolCallParams = match serde_json::from_str(&arguments) {
            Ok(params) => params,
            Err(_) => {
                return Ok(vec![function_output(
                    call_id,
                    format!("invalid arguments: {arguments}"),
                    1,
                    Duration::ZERO,
                )]);
            }
        };

        match maybe_parse_apply_patch(&params.command) {
            MaybeApplyPatch::Body(invocation) => {
                return self
                    .handle_apply_patch(invocation, &params, call_id)
                    .await;
            }
            MaybeApplyPatch::PatchParseError(err) => {
                return Ok(vec![function_output(
                    call_id,
                    format!("apply_patch: {err}"),
                    1,
                    Duration::ZERO,
                )]);
            }
            // An unparseable script or a non-patch command: let the command
            // path decide under the policy.
            MaybeApplyPatch::ShellParseError(_) | MaybeApplyPatch::NotApplyPatch => {}
        }

        self.handle_exec_command(params, call_id, exec_token).await
    }

    async fn handle_apply_patch(
        &self,
        invocation: PatchInvocation,
        params: &ShellToolCallParams,
        call_id: String,
    ) -> Result<Vec<ResponseInputItem>> {
        let effective_cwd = params
            .workdir
            .as_deref()
            .or(invocation.workdir.as_deref())
            .map(|dir| resolve_path(&self.config.cwd, std::path::Path::new(dir)))
            .unwrap_or_else(|| self.config.cwd.clone());
        let hunks = resolve_hunks(&invocation.hunks, &effective_cwd);

        let safety = assess_patch_safety(
            &hunks,
            self.config.approval_policy,
            &self.effective_writable_roots,
            &effective_cwd,
        );

        match safety {
            SafetyCheck::Reject { reason } => Ok(vec![function_output(
                call_id,
                format!("patch rejected: {reason}"),
                1,
                Duration::ZERO,
            )]),
            SafetyCheck::AutoApprove { .. } => {
                Ok(vec![self.apply_patch_hunks(&hunks, call_id)])
            }
            SafetyCheck::AskUser => {
                let command = vec!["apply_patch".to_string()];
                let mut explanation: Option<String> = None;
                loop {
                    let confirmation = self
                        .hooks
                        .get_command_confirmation(
                            command.clone(),
                            Some(invocation.patch.clone()),
                            explanation.take(),
                        )
                        .await;
                    match confirmation.decision {
                        ReviewDecision::Approved | ReviewDecision::ApprovedForSession => {
                            return Ok(vec![self.apply_patch_hunks(&hunks, call_id)]);
                        }
                        ReviewDecision::Explain => {
                            explanation = Some(self.hooks.get_explanation(command.clone()).await);
                        }
                        ReviewDecision::Denied => {
                            let message = confirmation
                                .custom_deny_message
                                .unwrap_or_else(|| "patch rejected by user".to_string());
                            return Ok(vec![function_output(
                                call_id,
                                message,
                                1,
                                Duration::ZERO,
                            )]);
                        }
                        ReviewDecision::Abort => return Err(QuillErr::Interrupted),
                    }
                }
            }
        }
    }

    fn apply_patch_hunks(
        &self,
        hunks: &[quill_apply_patch::Hunk],
        call_id: String,
    ) -> ResponseInputItem {
        let start = Instant::now();
        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        let exit_code = match apply_hunks(hunks, &mut stdout, &mut stderr) {
            Ok(_) => 0,
            Err(_) => 1,
        };
        let text = if exit_code == 0 {
            String::from_utf8_lossy(&stdout).into_owned()
        } else {
            String::from_utf8_lossy(&stderr).into_owned()
        };
        function_output(call_id, text, exit_code, start.elapsed())
    }

    async fn handle_exec_command(
        &self,
        params: ShellToolCallParams,
        call_id: String,
        exec_token: &CancellationToken,
    ) -> Result<Vec<ResponseInputItem>> {
        let safety = {
            let st = self.state.lock().unwrap();
            assess_command_safety(
                &params.command,
                self.config.approval_policy,
                &st.approved_commands,
            )
        };

        let sandbox_type = match safety {
            SafetyCheck::Reject { reason } => {
                return Ok(vec![function_output(
                    call_id,
                    format!("command rejected: {reason}"),
                    1,
                    Duration::ZERO,
                )]);
            }
            SafetyCheck::AutoApprove { sandbox_type, .. } => sandbox_type,
            SafetyCheck::AskUser => {
                let cmd_display = strip_bash_lc_and_escape(&params.command);
                debug!("asking user to approve: {}", cmd_display);
                let mut explanation: Option<String> = None;
                loop {
                    let confirmation = self
                        .hooks
                        .get_command_confirmation(params.command.clone(), None, explanation.take())
                        .await;
                    match confirmation.decision {
                        // Explicit approval runs without a sandbox: the
                        // common reason a command needs approval at all is
                        // that it will not work inside one.
                        ReviewDecision::Approved => break SandboxType::None,
                        ReviewDecision::ApprovedForSession => {
                            let mut st = self.state.lock().unwrap();
                            st.approved_commands.insert(params.command.clone());
                            break SandboxType::None;
                        }
                        ReviewDecision::Explain => {
                            explanation =
                                Some(self.hooks.get_explanation(params.command.clone()).await);
                        }
                        ReviewDecision::Denied => {
                            let message = confirmation
                                .custom_deny_message
                                .unwrap_or_else(|| "command rejected by user".to_string());
                            return Ok(vec![function_output(
                                call_id,
                                message,
                                1,
                                Duration::ZERO,
                            )]);
                        }
                        ReviewDecision::Abort => return Err(QuillErr::Interrupted),
                    }
                }
            }
        };

        let exec_params = ExecParams {
            command: params.command.clone(),
            cwd: params
                .workdir
                .as_deref()
                .map(|dir| resolve_path(&self.config.cwd, std::path::Path::new(dir)))
                .unwrap_or_else(|| self.config.cwd.clone()),
            timeout_ms: params.timeout_ms,
        };

        let output = process_exec_tool_call(
            exec_params,
            sandbox_type,
            &self.effective_writable_roots,
            self.config.linux_sandbox_helper.as_deref(),
            exec_token,
        )
        .await;

        if exec_token.is_cancelled() {
            // The turn is being torn down; the ledger entry stays and the
            // next run answers it with a synthetic abort.
            return Err(QuillErr::Interrupted);
        }

        Ok(vec![function_output(
            call_id,
            output.aggregated(),
            output.exit_code,
            output.duration,
        )])
    }

    #[cfg(test)]
    fn state_snapshot(&self) -> (u64, bool, usize, Option<String>) {
        let st = self.state.lock().unwrap();
        (
            st.generation,
            st.canceled,
            st.pending_aborts.len(),
            st.last_response_id.clone(),
        )
    }
}

#[derive(Debug, Clone)]
struct FunctionCallRequest {
    name: String,
    arguments: String,
    call_id: String,
}

#[derive(Debug, Deserialize)]
struct ShellToolCallParams {
    command: Vec<String>,
    #[serde(default)]
    workdir: Option<String>,
    /// Wire name is `timeout` (milliseconds); the older `timeout_ms` spelling
    /// is accepted for compatibility.
    #[serde(default, rename = "timeout", alias = "timeout_ms")]
    timeout_ms: Option<u64>,
}

/// The JSON string placed in a `function_call_output`'s `output` field.
fn format_exec_output(output: &str, exit_code: i32, duration: Duration) -> String {
    // round to one decimal so the payload stays terse
    let duration_seconds = (duration.as_secs_f32() * 10.0).round() / 10.0;
    json!({
        "output": output,
        "metadata": {
            "exit_code": exit_code,
            "duration_seconds": duration_seconds,
        }
    })
    .to_string()
}

/// The exact output synthesized for a call id settled by the abort ledger.
fn aborted_function_output() -> String {
    json!({
        "output": "aborted",
        "metadata": { "exit_code": 1, "duration_seconds": 0 }
    })
    .to_string()
}

fn function_output(
    call_id: String,
    output: String,
    exit_code: i32,
    duration: Duration,
) -> ResponseInputItem {
    ResponseInputItem::FunctionCallOutput {
        call_id,
        output: FunctionCallOutputPayload {
            content: format_exec_output(&output, exit_code, duration),
            success: Some(exit_code == 0),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;

    /// Deterministic recorder standing in for the UI.
    #[derive(Default)]
    struct RecorderHooks {
        items: StdMutex<Vec<ResponseItem>>,
        loading: StdMutex<Vec<bool>>,
        response_ids: StdMutex<Vec<String>>,
        confirmations: StdMutex<Vec<CommandConfirmation>>,
        prompts_seen: StdMutex<u32>,
    }

    impl RecorderHooks {
        fn with_confirmations(confirmations: Vec<CommandConfirmation>) -> Self {
            Self {
                confirmations: StdMutex::new(confirmations),
                ..Default::default()
            }
        }

        fn items(&self) -> Vec<ResponseItem> {
            self.items.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionHooks for RecorderHooks {
        fn on_item(&self, item: ResponseItem) {
            self.items.lock().unwrap().push(item);
        }

        fn on_loading(&self, loading: bool) {
            self.loading.lock().unwrap().push(loading);
        }

        fn on_last_response_id(&self, response_id: &str) {
            self.response_ids.lock().unwrap().push(response_id.to_string());
        }

        async fn get_command_confirmation(
            &self,
            _command: Vec<String>,
            _patch: Option<String>,
            _explanation: Option<String>,
        ) -> CommandConfirmation {
            *self.prompts_seen.lock().unwrap() += 1;
            let mut queue = self.confirmations.lock().unwrap();
            if queue.is_empty() {
                CommandConfirmation::default()
            } else {
                queue.remove(0)
            }
        }

        async fn get_explanation(&self, command: Vec<String>) -> String {
            format!("this runs {}", command.join(" "))
        }
    }

    fn test_loop(policy: ApprovalPolicy, hooks: Arc<RecorderHooks>) -> AgentLoop {
        let mut config = AgentConfig::new("test-model", policy);
        config.cwd = std::env::temp_dir();
        let client = ModelClient::with_provider("test-model", "http://127.0.0.1:9", None);
        AgentLoop::with_client(config, hooks, client)
    }

    fn call(name: &str, arguments: &str, call_id: &str) -> FunctionCallRequest {
        FunctionCallRequest {
            name: name.to_string(),
            arguments: arguments.to_string(),
            call_id: call_id.to_string(),
        }
    }

    fn output_json(items: &[ResponseInputItem]) -> serde_json::Value {
        let ResponseInputItem::FunctionCallOutput { output, .. } = &items[0] else {
            panic!("expected function call output");
        };
        serde_json::from_str(&output.content).unwrap()
    }

    #[test]
    fn aborted_output_matches_the_contract_literally() {
        assert_eq!(
            aborted_function_output(),
            r#"{"metadata":{"duration_seconds":0,"exit_code":1},"output":"aborted"}"#
        );
    }

    #[test]
    fn format_exec_output_carries_exit_code_and_duration() {
        let text = format_exec_output("hi", 0, Duration::from_millis(1500));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["output"], "hi");
        assert_eq!(value["metadata"]["exit_code"], 0);
        assert_eq!(value["metadata"]["duration_seconds"], 1.5);
    }

    #[tokio::test]
    async fn malformed_arguments_abort_the_call() {
        let hooks = Arc::new(RecorderHooks::default());
        let agent = test_loop(ApprovalPolicy::Suggest, hooks);
        let token = CancellationToken::new();
        let items = agent
            .handle_function_call(call("shell", "{not json", "call_1"), &token)
            .await
            .unwrap();
        let value = output_json(&items);
        assert_eq!(value["output"], "invalid arguments: {not json");
        assert_eq!(value["metadata"]["exit_code"], 1);
    }

    #[tokio::test]
    async fn unknown_tools_are_reported_to_the_model() {
        let hooks = Arc::new(RecorderHooks::default());
        let agent = test_loop(ApprovalPolicy::Suggest, hooks);
        let token = CancellationToken::new();
        let items = agent
            .handle_function_call(call("browser.open", "{}", "call_1"), &token)
            .await
            .unwrap();
        let value = output_json(&items);
        assert_eq!(value["output"], "unsupported function: browser.open");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn read_only_command_runs_without_prompting() {
        let hooks = Arc::new(RecorderHooks::default());
        let agent = test_loop(ApprovalPolicy::Suggest, Arc::clone(&hooks));
        let token = CancellationToken::new();
        let items = agent
            .handle_function_call(
                call("shell", r#"{"command":["echo","hello"]}"#, "call_1"),
                &token,
            )
            .await
            .unwrap();
        let value = output_json(&items);
        assert_eq!(value["metadata"]["exit_code"], 0);
        assert_eq!(value["output"], "hello\n");
        assert_eq!(*hooks.prompts_seen.lock().unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn container_exec_alias_is_accepted() {
        let hooks = Arc::new(RecorderHooks::default());
        let agent = test_loop(ApprovalPolicy::Suggest, hooks);
        let token = CancellationToken::new();
        let items = agent
            .handle_function_call(
                call("container.exec", r#"{"command":["echo","alias"]}"#, "call_1"),
                &token,
            )
            .await
            .unwrap();
        let value = output_json(&items);
        assert_eq!(value["output"], "alias\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn denial_carries_the_custom_message() {
        let hooks = Arc::new(RecorderHooks::with_confirmations(vec![CommandConfirmation {
            decision: ReviewDecision::Denied,
            custom_deny_message: Some("not on my machine".to_string()),
        }]));
        let agent = test_loop(ApprovalPolicy::Suggest, Arc::clone(&hooks));
        let token = CancellationToken::new();
        let items = agent
            .handle_function_call(
                call("shell", r#"{"command":["touch","/tmp/x"]}"#, "call_1"),
                &token,
            )
            .await
            .unwrap();
        let value = output_json(&items);
        assert_eq!(value["output"], "not on my machine");
        assert_eq!(value["metadata"]["exit_code"], 1);
        assert_eq!(*hooks.prompts_seen.lock().unwrap(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn explain_asks_again_before_running() {
        let hooks = Arc::new(RecorderHooks::with_confirmations(vec![
            CommandConfirmation {
                decision: ReviewDecision::Explain,
                custom_deny_message: None,
            },
            CommandConfirmation {
                decision: ReviewDecision::Approved,
                custom_deny_message: None,
            },
        ]));
        let agent = test_loop(ApprovalPolicy::Suggest, Arc::clone(&hooks));
        let token = CancellationToken::new();
        let items = agent
            .handle_function_call(
                call("shell", r#"{"command":["touch","/dev/null"]}"#, "call_1"),
                &token,
            )
            .await
            .unwrap();
        let value = output_json(&items);
        assert_eq!(value["metadata"]["exit_code"], 0);
        assert_eq!(*hooks.prompts_seen.lock().unwrap(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abort_decision_interrupts_the_run() {
        let hooks = Arc::new(RecorderHooks::with_confirmations(vec![CommandConfirmation {
            decision: ReviewDecision::Abort,
            custom_deny_message: None,
        }]));
        let agent = test_loop(ApprovalPolicy::Suggest, hooks);
        let token = CancellationToken::new();
        let err = agent
            .handle_function_call(
                call("shell", r#"{"command":["touch","/tmp/x"]}"#, "call_1"),
                &token,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QuillErr::Interrupted));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn session_approval_caches_the_argv() {
        let hooks = Arc::new(RecorderHooks::with_confirmations(vec![CommandConfirmation {
            decision: ReviewDecision::ApprovedForSession,
            custom_deny_message: None,
        }]));
        let agent = test_loop(ApprovalPolicy::Suggest, Arc::clone(&hooks));
        let token = CancellationToken::new();
        for _ in 0..2 {
            let items = agent
                .handle_function_call(
                    call("shell", r#"{"command":["touch","/dev/null"]}"#, "call_1"),
                    &token,
                )
                .await
                .unwrap();
            let value = output_json(&items);
            assert_eq!(value["metadata"]["exit_code"], 0);
        }
        // Only the first call prompted.
        assert_eq!(*hooks.prompts_seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn patch_confined_to_writable_roots_applies_under_auto_edit() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().canonicalize().unwrap();
        std::fs::write(cwd.join("b.txt"), "old\n").unwrap();

        let hooks = Arc::new(RecorderHooks::default());
        let mut config = AgentConfig::new("test-model", ApprovalPolicy::AutoEdit);
        config.cwd = cwd.clone();
        let client = ModelClient::with_provider("test-model", "http://127.0.0.1:9", None);
        let hooks_dyn: Arc<dyn SessionHooks> = hooks.clone();
        let agent = AgentLoop::with_client(config, hooks_dyn, client);

        let patch = "*** Begin Patch\n*** Add File: a.txt\n+hi\n*** Update File: b.txt\n@@\n-old\n+new\n*** End Patch";
        let arguments =
            serde_json::to_string(&json!({ "command": ["apply_patch", patch] })).unwrap();
        let token = CancellationToken::new();
        let items = agent
            .handle_function_call(call("shell", &arguments, "call_1"), &token)
            .await
            .unwrap();

        let value = output_json(&items);
        assert_eq!(value["metadata"]["exit_code"], 0);
        assert!(
            value["output"]
                .as_str()
                .unwrap()
                .starts_with("Success. Updated the following files:")
        );
        assert_eq!(std::fs::read_to_string(cwd.join("a.txt")).unwrap(), "hi\n");
        assert_eq!(std::fs::read_to_string(cwd.join("b.txt")).unwrap(), "new\n");
        assert_eq!(*hooks.prompts_seen.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn patch_outside_roots_asks_and_denial_reports() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().canonicalize().unwrap();
        let hooks = Arc::new(RecorderHooks::with_confirmations(vec![CommandConfirmation {
            decision: ReviewDecision::Denied,
            custom_deny_message: None,
        }]));
        let mut config = AgentConfig::new("test-model", ApprovalPolicy::AutoEdit);
        config.cwd = cwd.clone();
        let client = ModelClient::with_provider("test-model", "http://127.0.0.1:9", None);
        let hooks_dyn: Arc<dyn SessionHooks> = hooks.clone();
        let agent = AgentLoop::with_client(config, hooks_dyn, client);

        let patch = "*** Begin Patch\n*** Add File: /no-such-root/a.txt\n+hi\n*** End Patch";
        let arguments =
            serde_json::to_string(&json!({ "command": ["apply_patch", patch] })).unwrap();
        let token = CancellationToken::new();
        let items = agent
            .handle_function_call(call("shell", &arguments, "call_1"), &token)
            .await
            .unwrap();
        let value = output_json(&items);
        assert_eq!(value["output"], "patch rejected by user");
        assert_eq!(*hooks.prompts_seen.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn staged_items_deliver_in_order_after_the_delay() {
        let hooks = Arc::new(RecorderHooks::default());
        let agent = test_loop(ApprovalPolicy::Suggest, Arc::clone(&hooks));
        let generation = {
            let mut st = agent.state.lock().unwrap();
            st.generation += 1;
            st.generation
        };
        agent.stage_item(generation, ResponseItem::Other);
        agent.stage_item(
            generation,
            ResponseItem::Message {
                role: "assistant".to_string(),
                content: vec![],
            },
        );
        assert!(hooks.items().is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let items = hooks.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], ResponseItem::Other);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_between_stage_and_delivery_drops_the_item() {
        let hooks = Arc::new(RecorderHooks::default());
        let agent = test_loop(ApprovalPolicy::Suggest, Arc::clone(&hooks));
        let generation = {
            let mut st = agent.state.lock().unwrap();
            st.generation += 1;
            st.generation
        };
        agent.stage_item(generation, ResponseItem::Other);
        agent.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(hooks.items().is_empty());
        assert_eq!(*hooks.loading.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn cancel_keeps_pending_aborts_and_clears_response_id_only_when_empty() {
        let hooks = Arc::new(RecorderHooks::default());
        let agent = test_loop(ApprovalPolicy::Suggest, Arc::clone(&hooks));
        {
            let mut st = agent.state.lock().unwrap();
            st.pending_aborts.insert("call_7".to_string());
            st.last_response_id = Some("resp_1".to_string());
        }
        agent.cancel();
        let (_, canceled, pending, last_id) = agent.state_snapshot();
        assert!(canceled);
        assert_eq!(pending, 1);
        assert_eq!(last_id, Some("resp_1".to_string()));

        {
            let mut st = agent.state.lock().unwrap();
            st.pending_aborts.clear();
        }
        agent.cancel();
        let (_, _, _, last_id) = agent.state_snapshot();
        assert_eq!(last_id, None);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let hooks = Arc::new(RecorderHooks::default());
        let agent = test_loop(ApprovalPolicy::Suggest, Arc::clone(&hooks));
        agent.cancel();
        let (generation_once, ..) = agent.state_snapshot();
        agent.cancel();
        agent.cancel();
        let (generation_thrice, canceled, ..) = agent.state_snapshot();
        assert!(canceled);
        // Each call bumps the fence, but the observable state is identical.
        assert!(generation_thrice > generation_once);
    }

    #[tokio::test]
    async fn terminated_instance_refuses_to_run() {
        let hooks = Arc::new(RecorderHooks::default());
        let agent = test_loop(ApprovalPolicy::Suggest, hooks);
        agent.terminate();
        let err = agent.run(vec![], None).await.unwrap_err();
        assert!(matches!(err, QuillErr::SessionTerminated));
    }
}
