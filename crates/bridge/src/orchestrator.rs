//! The run orchestrator — the per-request dispatcher that turns one wire
//! request into a protocol-correct event stream.
//!
//! Entry point: [`Bridge::run`].  The request's unseen messages are
//! partitioned into tool-result submissions and new turns; each partition
//! becomes one sub-execution: a background producer task drives the
//! injected runner, pipes its runtime events through the translator onto a
//! bounded queue, and the orchestrator drains the queue to the caller
//! bracketed by RUN_STARTED / RUN_FINISHED.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use std::sync::Arc;

use async_stream::stream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use swb_domain::agent::AgentHandle;
use swb_domain::capability::{
    AgentRunner, ArtifactStore, CredentialStore, MemoryStore, RunnerContext, RunnerFactory,
    PENDING_TOOL_CALLS_KEY,
};
use swb_domain::config::BridgeConfig;
use swb_domain::message::InputMessage;
use swb_domain::runtime::{Content, FunctionResponse, Part, RunConfig, ToolPayload};
use swb_domain::stream::BoxStream;
use swb_domain::trace::TraceEvent;
use swb_domain::wire::{RunInput, WireEvent};
use swb_domain::{Error, Result};
use swb_sessions::SessionManager;

use crate::convert;
use crate::execution::ExecutionState;
use crate::identity::{Extractor, IdentityResolver};
use crate::proxy::ClientProxyToolset;
use crate::translator::EventTranslator;

/// Tool name the runtime reserves for internal agent handoff; never
/// proxied to the client.
const RESERVED_HANDOFF_TOOL: &str = "transfer_to_agent";

/// How long the drain loop waits per queue poll before re-checking
/// liveness.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

const CODE_NO_TOOL_RESULTS: &str = "NO_TOOL_RESULTS";
const CODE_TOOL_RESULT_PROCESSING_ERROR: &str = "TOOL_RESULT_PROCESSING_ERROR";
const CODE_EXECUTION_TIMEOUT: &str = "EXECUTION_TIMEOUT";
const CODE_EXECUTION_ERROR: &str = "EXECUTION_ERROR";
const CODE_BACKGROUND_EXECUTION_ERROR: &str = "BACKGROUND_EXECUTION_ERROR";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct BridgeBuilder {
    agent: AgentHandle,
    runner_factory: Arc<dyn RunnerFactory>,
    app_name: Option<String>,
    app_name_extractor: Option<Extractor>,
    user_id: Option<String>,
    user_id_extractor: Option<Extractor>,
    session_manager: Option<Arc<SessionManager>>,
    artifact_store: Option<Arc<dyn ArtifactStore>>,
    credential_store: Option<Arc<dyn CredentialStore>>,
    memory_store: Option<Arc<dyn MemoryStore>>,
    run_config_factory: Option<Arc<dyn Fn(&RunInput) -> RunConfig + Send + Sync>>,
    config: BridgeConfig,
}

impl BridgeBuilder {
    pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn app_name_extractor(mut self, extractor: Extractor) -> Self {
        self.app_name_extractor = Some(extractor);
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn user_id_extractor(mut self, extractor: Extractor) -> Self {
        self.user_id_extractor = Some(extractor);
        self
    }

    /// Required.  There is deliberately no silent in-memory fallback:
    /// use [`SessionManager::in_memory`] to opt into one for development.
    pub fn session_manager(mut self, manager: Arc<SessionManager>) -> Self {
        self.session_manager = Some(manager);
        self
    }

    pub fn artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifact_store = Some(store);
        self
    }

    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(store);
        self
    }

    pub fn memory_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.memory_store = Some(store);
        self
    }

    pub fn run_config_factory(
        mut self,
        factory: Arc<dyn Fn(&RunInput) -> RunConfig + Send + Sync>,
    ) -> Self {
        self.run_config_factory = Some(factory);
        self
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Bridge> {
        let identity = IdentityResolver::new(
            self.app_name,
            self.app_name_extractor,
            self.user_id,
            self.user_id_extractor,
            self.agent.name.clone(),
        )?;
        let sessions = self.session_manager.ok_or_else(|| {
            Error::Config(
                "a session manager is required (SessionManager::in_memory for development)".into(),
            )
        })?;
        Ok(Bridge {
            agent: self.agent,
            identity,
            sessions,
            artifact_store: self.artifact_store,
            credential_store: self.credential_store,
            memory_store: self.memory_store,
            runner_factory: self.runner_factory,
            run_config_factory: self.run_config_factory,
            config: self.config,
            active_executions: Mutex::new(HashMap::new()),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bridge
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Bridge {
    agent: AgentHandle,
    identity: IdentityResolver,
    sessions: Arc<SessionManager>,
    artifact_store: Option<Arc<dyn ArtifactStore>>,
    credential_store: Option<Arc<dyn CredentialStore>>,
    memory_store: Option<Arc<dyn MemoryStore>>,
    runner_factory: Arc<dyn RunnerFactory>,
    run_config_factory: Option<Arc<dyn Fn(&RunInput) -> RunConfig + Send + Sync>>,
    config: BridgeConfig,
    active_executions: Mutex<HashMap<String, Arc<ExecutionState>>>,
}

impl Bridge {
    pub fn builder(agent: AgentHandle, runner_factory: Arc<dyn RunnerFactory>) -> BridgeBuilder {
        BridgeBuilder {
            agent,
            runner_factory,
            app_name: None,
            app_name_extractor: None,
            user_id: None,
            user_id_extractor: None,
            session_manager: None,
            artifact_store: None,
            credential_store: None,
            memory_store: None,
            run_config_factory: None,
            config: BridgeConfig::default(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Number of thread executions currently tracked (live or preserved
    /// for a pending client tool call).
    pub fn active_execution_count(&self) -> usize {
        self.active_executions.lock().len()
    }

    pub fn has_active_execution(&self, thread_id: &str) -> bool {
        self.active_executions.lock().contains_key(thread_id)
    }

    /// Run one wire request, yielding the ordered event stream.
    pub fn run(&self, input: RunInput) -> BoxStream<'_, WireEvent> {
        Box::pin(stream! {
            if self.config.sessions.auto_cleanup {
                self.sessions.spawn_cleanup();
            }

            let app_name = self.identity.app_name(&input);
            let unseen = unseen_messages(&self.sessions, &app_name, &input);
            TraceEvent::RunDispatched {
                thread_id: input.thread_id.clone(),
                run_id: input.run_id.clone(),
                unseen_messages: unseen.len(),
            }
            .emit();

            if unseen.is_empty() {
                // Everything in this request was already processed: a
                // replay.  Acknowledge without executing anything.
                yield WireEvent::RunStarted {
                    thread_id: input.thread_id.clone(),
                    run_id: input.run_id.clone(),
                };
                yield WireEvent::RunFinished {
                    thread_id: input.thread_id.clone(),
                    run_id: input.run_id.clone(),
                };
                return;
            }

            let mut index = 0;
            let mut skip_tool_batch = false;
            while index < unseen.len() {
                if unseen[index].is_tool() {
                    let mut batch = Vec::new();
                    while index < unseen.len() && unseen[index].is_tool() {
                        batch.push(unseen[index].clone());
                        index += 1;
                    }
                    let include_message_batch = !skip_tool_batch;
                    let mut sub = self.handle_tool_result_submission(
                        input.clone(),
                        batch,
                        include_message_batch,
                    );
                    while let Some(event) = sub.next().await {
                        yield event;
                    }
                    skip_tool_batch = false;
                } else {
                    let mut batch = Vec::new();
                    let mut assistant_ids = Vec::new();
                    while index < unseen.len() && !unseen[index].is_tool() {
                        match &unseen[index] {
                            InputMessage::Assistant { id: Some(id), .. } => {
                                assistant_ids.push(id.clone());
                            }
                            other => batch.push(other.clone()),
                        }
                        index += 1;
                    }

                    if !assistant_ids.is_empty() {
                        self.sessions.mark_messages_processed(
                            &app_name,
                            &input.thread_id,
                            assistant_ids.clone(),
                        );
                    }

                    if batch.is_empty() {
                        // Assistant-history only: the tool batch that
                        // follows carries the whole story, so the history
                        // must not be re-sent to the runtime.
                        skip_tool_batch = !assistant_ids.is_empty();
                        continue;
                    }

                    skip_tool_batch = false;
                    let mut sub = self.start_new_execution(input.clone(), None, Some(batch));
                    while let Some(event) = sub.next().await {
                        yield event;
                    }
                }
            }
        })
    }

    /// Cancel all executions and stop the session cleanup task.
    pub async fn close(&self) {
        let executions: Vec<Arc<ExecutionState>> = {
            let mut active = self.active_executions.lock();
            active.drain().map(|(_, execution)| execution).collect()
        };
        for execution in &executions {
            execution.cancel();
        }
        self.sessions.stop_cleanup();
        tracing::debug!(cancelled = executions.len(), "bridge closed");
    }

    // ── Tool-result submissions ────────────────────────────────────

    fn handle_tool_result_submission(
        &self,
        input: RunInput,
        tool_messages: Vec<InputMessage>,
        include_message_batch: bool,
    ) -> BoxStream<'_, WireEvent> {
        Box::pin(stream! {
            let thread_id = input.thread_id.clone();
            let tool_results = extract_tool_results(&input, &tool_messages);

            if tool_results.is_empty() {
                tracing::error!(%thread_id, "tool result submission without tool results");
                yield WireEvent::RunError {
                    message: "No tool results found in submission".into(),
                    code: CODE_NO_TOOL_RESULTS.into(),
                };
                return;
            }

            if let Err(e) = self.settle_pending_tool_results(&thread_id, &tool_results).await {
                tracing::error!(%thread_id, error = %e, "error handling tool results");
                yield WireEvent::RunError {
                    message: format!("Failed to process tool results: {e}"),
                    code: CODE_TOOL_RESULT_PROCESSING_ERROR.into(),
                };
                return;
            }

            tracing::info!(
                %thread_id,
                results = tool_results.len(),
                "starting execution for tool result submission"
            );
            let message_batch = include_message_batch.then_some(tool_messages);
            let mut sub = self.start_new_execution(input, Some(tool_results), message_batch);
            while let Some(event) = sub.next().await {
                yield event;
            }
        })
    }

    /// Clear each submitted result from the session's pending list.
    async fn settle_pending_tool_results(
        &self,
        thread_id: &str,
        tool_results: &[ToolResultMessage],
    ) -> Result<()> {
        for result in tool_results {
            if self.has_pending_tool_calls(thread_id).await {
                self.remove_pending_tool_call(thread_id, &result.tool_call_id)
                    .await?;
            } else {
                // Could be a stale result or one from a different session.
                tracing::warn!(
                    thread_id,
                    tool_call_id = %result.tool_call_id,
                    "tool result arrived with no pending tool calls"
                );
            }
        }
        Ok(())
    }

    // ── Sub-executions ─────────────────────────────────────────────

    fn start_new_execution(
        &self,
        input: RunInput,
        tool_results: Option<Vec<ToolResultMessage>>,
        message_batch: Option<Vec<InputMessage>>,
    ) -> BoxStream<'_, WireEvent> {
        Box::pin(stream! {
            let thread_id = input.thread_id.clone();
            let run_id = input.run_id.clone();

            yield WireEvent::RunStarted {
                thread_id: thread_id.clone(),
                run_id: run_id.clone(),
            };

            // Concurrency gate: reclaim stale slots, then fail hard if
            // still saturated.
            let gate = {
                let mut active = self.active_executions.lock();
                let max = self.config.execution.max_concurrent_executions;
                if active.len() >= max {
                    cleanup_stale_executions(
                        &mut active,
                        self.config.execution.execution_timeout(),
                    );
                }
                if active.len() >= max {
                    Err(Error::Execution(format!(
                        "maximum concurrent executions ({max}) reached"
                    )))
                } else {
                    Ok(active.get(&thread_id).cloned())
                }
            };
            let existing = match gate {
                Ok(existing) => existing,
                Err(e) => {
                    tracing::error!(%thread_id, error = %e, "cannot start execution");
                    yield WireEvent::RunError {
                        message: e.to_string(),
                        code: CODE_EXECUTION_ERROR.into(),
                    };
                    self.finish_execution(&thread_id).await;
                    return;
                }
            };

            // At most one live execution per thread: a new run waits for
            // the prior one to finish.
            if let Some(prior) = existing {
                if !prior.is_complete() {
                    tracing::debug!(%thread_id, "waiting for prior execution");
                    prior.wait().await;
                }
            }

            let execution =
                self.spawn_background_execution(&input, tool_results, message_batch);
            self.active_executions
                .lock()
                .insert(thread_id.clone(), execution.clone());

            // Drain the queue.  Tool calls that never see a backend
            // TOOL_CALL_RESULT are awaiting the client.
            let mut pending_candidates: Vec<String> = Vec::new();
            let mut timed_out = false;
            {
                let mut events = execution.events.lock().await;
                loop {
                    match timeout(QUEUE_POLL_INTERVAL, events.recv()).await {
                        Ok(Some(event)) => {
                            match &event {
                                WireEvent::ToolCallEnd { tool_call_id } => {
                                    pending_candidates.push(tool_call_id.clone());
                                }
                                WireEvent::ToolCallResult { tool_call_id, .. } => {
                                    pending_candidates.retain(|id| id != tool_call_id);
                                }
                                _ => {}
                            }
                            yield event;
                        }
                        Ok(None) => {
                            // Channel closed: the producer is done.
                            execution.mark_complete();
                            break;
                        }
                        Err(_) => {
                            if execution.is_stale(self.config.execution.execution_timeout()) {
                                tracing::error!(%thread_id, "execution timed out");
                                timed_out = true;
                                break;
                            }
                            // A finished producer has closed the channel;
                            // the next recv drains residue then reports
                            // closure.
                            if execution.is_finished() {
                                continue;
                            }
                        }
                    }
                }
            }

            if timed_out {
                execution.cancel();
                yield WireEvent::RunError {
                    message: "Execution timed out".into(),
                    code: CODE_EXECUTION_TIMEOUT.into(),
                };
                self.finish_execution(&thread_id).await;
                return;
            }

            // Survivors are client-side: persist them for the HITL
            // round-trip.
            if !pending_candidates.is_empty() {
                let app_name = self.identity.app_name(&input);
                let user_id = self.identity.user_id(&input);
                for tool_call_id in &pending_candidates {
                    self.add_pending_tool_call(&thread_id, tool_call_id, &app_name, &user_id)
                        .await;
                }
            }

            yield WireEvent::RunFinished {
                thread_id: thread_id.clone(),
                run_id,
            };
            self.finish_execution(&thread_id).await;
        })
    }

    /// Mark this thread's execution complete and drop the entry unless
    /// pending client tool calls require it to survive.
    async fn finish_execution(&self, thread_id: &str) {
        let execution = self.active_executions.lock().get(thread_id).cloned();
        let Some(execution) = execution else {
            return;
        };
        execution.mark_complete();

        if self.has_pending_tool_calls(thread_id).await {
            tracing::info!(thread_id, "preserving execution entry: pending client tool calls");
        } else {
            self.active_executions.lock().remove(thread_id);
            tracing::debug!(thread_id, "execution entry cleaned up");
        }
    }

    fn spawn_background_execution(
        &self,
        input: &RunInput,
        tool_results: Option<Vec<ToolResultMessage>>,
        message_batch: Option<Vec<InputMessage>>,
    ) -> Arc<ExecutionState> {
        let (queue, receiver) = mpsc::channel(self.config.execution.event_queue_capacity);
        let app_name = self.identity.app_name(input);
        let user_id = self.identity.user_id(input);

        // A leading system message from the client extends the agent's
        // base instruction.
        let mut agent = self.agent.clone();
        if let Some(InputMessage::System {
            content: Some(content),
            ..
        }) = input.messages.first()
        {
            let suffix = content.flatten_text();
            if !suffix.is_empty() {
                tracing::debug!(
                    thread_id = %input.thread_id,
                    "appending client system message to agent instruction"
                );
                agent = agent.with_instruction_suffix(suffix);
            }
        }

        // Client-declared tools become long-running proxies.  Backend
        // tools win name collisions; the runtime's handoff tool is never
        // proxied.
        if !input.tools.is_empty() {
            let backend_names: HashSet<String> = agent
                .tool_names()
                .into_iter()
                .map(str::to_owned)
                .collect();
            let client_tools: Vec<_> = input
                .tools
                .iter()
                .filter(|tool| {
                    !backend_names.contains(&tool.name) && tool.name != RESERVED_HANDOFF_TOOL
                })
                .cloned()
                .collect();
            if !client_tools.is_empty() {
                let proxies = ClientProxyToolset::build(
                    &client_tools,
                    queue.clone(),
                    self.config.execution.tool_timeout(),
                );
                agent.tools.extend(proxies);
            }
        }

        let run_config = match &self.run_config_factory {
            Some(factory) => factory(input),
            None => RunConfig::default(),
        };

        let job = BackgroundJob {
            input: input.clone(),
            tool_results,
            message_batch,
            app_name: app_name.clone(),
            user_id,
            sessions: self.sessions.clone(),
            runner_factory: self.runner_factory.clone(),
            runner_ctx: RunnerContext {
                agent,
                app_name,
                session_store: self.sessions.store(),
                artifact_store: self.artifact_store.clone(),
                memory_store: self.memory_store.clone(),
                credential_store: self.credential_store.clone(),
            },
            run_config,
            queue,
        };

        TraceEvent::ExecutionSpawned {
            thread_id: input.thread_id.clone(),
        }
        .emit();
        Arc::new(ExecutionState::spawn(
            input.thread_id.clone(),
            receiver,
            job.run(),
        ))
    }

    // ── Pending tool-call bookkeeping ──────────────────────────────

    async fn has_pending_tool_calls(&self, thread_id: &str) -> bool {
        let Some(meta) = self.sessions.session_metadata(thread_id) else {
            return false;
        };
        let pending = self
            .sessions
            .get_state_value(
                thread_id,
                &meta.app_name,
                &meta.user_id,
                PENDING_TOOL_CALLS_KEY,
                json!([]),
            )
            .await;
        pending.as_array().is_some_and(|list| !list.is_empty())
    }

    async fn add_pending_tool_call(
        &self,
        thread_id: &str,
        tool_call_id: &str,
        app_name: &str,
        user_id: &str,
    ) {
        let pending = self
            .sessions
            .get_state_value(thread_id, app_name, user_id, PENDING_TOOL_CALLS_KEY, json!([]))
            .await;
        let mut list = pending.as_array().cloned().unwrap_or_default();
        if list.iter().any(|v| v.as_str() == Some(tool_call_id)) {
            return;
        }
        list.push(Value::String(tool_call_id.to_owned()));

        let updated = self
            .sessions
            .set_state_value(
                thread_id,
                app_name,
                user_id,
                PENDING_TOOL_CALLS_KEY,
                Value::Array(list),
            )
            .await;
        if updated {
            TraceEvent::ToolCallPending {
                thread_id: thread_id.to_owned(),
                tool_call_id: tool_call_id.to_owned(),
            }
            .emit();
        } else {
            tracing::error!(thread_id, tool_call_id, "failed to record pending tool call");
        }
    }

    async fn remove_pending_tool_call(&self, thread_id: &str, tool_call_id: &str) -> Result<()> {
        let Some(meta) = self.sessions.session_metadata(thread_id) else {
            return Ok(());
        };
        let pending = self
            .sessions
            .get_state_value(
                thread_id,
                &meta.app_name,
                &meta.user_id,
                PENDING_TOOL_CALLS_KEY,
                json!([]),
            )
            .await;
        let Some(list) = pending.as_array() else {
            return Ok(());
        };
        let remaining: Vec<Value> = list
            .iter()
            .filter(|v| v.as_str() != Some(tool_call_id))
            .cloned()
            .collect();
        if remaining.len() == list.len() {
            return Ok(());
        }

        let updated = self
            .sessions
            .set_state_value(
                thread_id,
                &meta.app_name,
                &meta.user_id,
                PENDING_TOOL_CALLS_KEY,
                Value::Array(remaining),
            )
            .await;
        if !updated {
            return Err(Error::Store(format!(
                "failed to clear pending tool call {tool_call_id} for thread {thread_id}"
            )));
        }
        TraceEvent::ToolResultSubmitted {
            thread_id: thread_id.to_owned(),
            tool_call_id: tool_call_id.to_owned(),
        }
        .emit();
        Ok(())
    }
}

/// Abort and drop executions past the execution timeout.
fn cleanup_stale_executions(
    active: &mut HashMap<String, Arc<ExecutionState>>,
    timeout: Duration,
) {
    let stale: Vec<String> = active
        .iter()
        .filter(|(_, execution)| execution.is_stale(timeout))
        .map(|(thread_id, _)| thread_id.clone())
        .collect();
    for thread_id in stale {
        if let Some(execution) = active.remove(&thread_id) {
            execution.cancel();
            TraceEvent::ExecutionStale {
                thread_id: execution.thread_id().to_owned(),
            }
            .emit();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Background producer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct BackgroundJob {
    input: RunInput,
    tool_results: Option<Vec<ToolResultMessage>>,
    message_batch: Option<Vec<InputMessage>>,
    app_name: String,
    user_id: String,
    sessions: Arc<SessionManager>,
    runner_factory: Arc<dyn RunnerFactory>,
    runner_ctx: RunnerContext,
    run_config: RunConfig,
    queue: mpsc::Sender<WireEvent>,
}

impl BackgroundJob {
    async fn run(self) {
        if let Err(e) = self.execute().await {
            tracing::error!(
                thread_id = %self.input.thread_id,
                error = %e,
                "background execution failed"
            );
            let _ = self
                .queue
                .send(WireEvent::RunError {
                    message: e.to_string(),
                    code: CODE_BACKGROUND_EXECUTION_ERROR.into(),
                })
                .await;
        }
        // Dropping the job drops every queue sender — the end-of-stream
        // sentinel the consumer is waiting for.
    }

    async fn execute(&self) -> Result<()> {
        let runner = self.runner_factory.create(self.runner_ctx.clone())?;
        let result = self.drive(runner.as_ref()).await;
        if let Err(e) = runner.close().await {
            tracing::warn!(
                thread_id = %self.input.thread_id,
                error = %e,
                "error closing runner"
            );
        }
        result
    }

    async fn drive(&self, runner: &dyn AgentRunner) -> Result<()> {
        let input = &self.input;
        let thread_id = input.thread_id.as_str();

        let declared_state = state_object(&input.state);
        self.sessions
            .get_or_create(&self.app_name, thread_id, &self.user_id, declared_state.clone())
            .await?;

        // The client is the source of truth for the state it declares:
        // sync it in unconditionally.
        if !declared_state.is_empty() {
            self.sessions
                .update_state(thread_id, &self.app_name, &self.user_id, declared_state, true)
                .await;
        }

        let unseen = match &self.message_batch {
            Some(batch) => batch.clone(),
            None => unseen_messages(&self.sessions, &self.app_name, input),
        };

        let mut active_tool_results = self.tool_results.clone();
        if active_tool_results.is_none() && unseen.last().is_some_and(InputMessage::is_tool) {
            active_tool_results = Some(extract_tool_results(input, &unseen));
        }
        let active_tool_results = active_tool_results.filter(|results| !results.is_empty());

        // Ledger: everything forwarded in this sub-execution is processed.
        if let Some(results) = &active_tool_results {
            let ids: Vec<String> = results
                .iter()
                .filter_map(|result| result.message_id.clone())
                .collect();
            if !ids.is_empty() {
                self.sessions
                    .mark_messages_processed(&self.app_name, thread_id, ids);
            }
        } else if !unseen.is_empty() {
            let ids: Vec<String> = unseen
                .iter()
                .filter_map(|message| message.id().map(str::to_owned))
                .collect();
            if !ids.is_empty() {
                self.sessions
                    .mark_messages_processed(&self.app_name, thread_id, ids);
            }
        }

        // Tool results go to the runtime alone; otherwise the latest user
        // message carries the turn.
        let new_message = match &active_tool_results {
            Some(results) => Some(tool_results_to_content(results)),
            None => {
                let source = if self.message_batch.is_some() {
                    &unseen
                } else {
                    &input.messages
                };
                convert::latest_user_message(source)
            }
        };

        let mut translator = EventTranslator::new();
        let mut events = runner
            .run_stream(&self.user_id, thread_id, new_message, &self.run_config)
            .await?;

        while let Some(next) = events.next().await {
            let event = next?;

            let final_response = event.is_final_response();
            let has_content = event.content.as_ref().is_some_and(|c| !c.parts.is_empty());
            let is_streaming_chunk = event.partial || !event.turn_complete || !final_response;
            let has_lro_call = !event.long_running_tool_ids.is_empty()
                && event
                    .function_calls()
                    .iter()
                    .any(|call| event.long_running_tool_ids.contains(&call.id));

            if !has_lro_call
                && (is_streaming_chunk || (has_content && event.finish_reason.is_none()))
            {
                for wire in translator.translate(&event, &input.run_id) {
                    self.send(wire).await?;
                }
            } else {
                // Any open text message must close before tool-call
                // events go out.
                for wire in translator.force_close_streaming_message() {
                    self.send(wire).await?;
                }

                let mut lro_announced = false;
                for wire in translator.translate_lro_function_calls(&event) {
                    if matches!(wire, WireEvent::ToolCallEnd { .. }) {
                        lro_announced = true;
                    }
                    self.send(wire).await?;
                }
                if lro_announced {
                    // The client owns the tool execution now; the turn
                    // resumes with its next request.
                    return Ok(());
                }
            }
        }

        for wire in translator.force_close_streaming_message() {
            self.send(wire).await?;
        }

        // Terminal snapshot, after every text stream is closed.
        if let Some(final_state) = self
            .sessions
            .get_state(thread_id, &self.app_name, &self.user_id)
            .await
        {
            self.send(WireEvent::StateSnapshot {
                snapshot: Value::Object(final_state),
            })
            .await?;
        }

        Ok(())
    }

    async fn send(&self, event: WireEvent) -> Result<()> {
        self.queue
            .send(event)
            .await
            .map_err(|_| Error::Execution("event queue closed".into()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool message paired with the tool name recorded in the assistant
/// history.
#[derive(Debug, Clone)]
struct ToolResultMessage {
    tool_name: String,
    message_id: Option<String>,
    tool_call_id: String,
    content: String,
}

/// The suffix of `input.messages` not yet in the ledger: walk backwards
/// and stop at the first id already processed.  Messages without ids are
/// always unseen.
fn unseen_messages(
    sessions: &SessionManager,
    app_name: &str,
    input: &RunInput,
) -> Vec<InputMessage> {
    if input.messages.is_empty() {
        return Vec::new();
    }
    let processed = sessions.get_processed_message_ids(app_name, &input.thread_id);

    let mut unseen: Vec<InputMessage> = Vec::new();
    for message in input.messages.iter().rev() {
        if let Some(id) = message.id() {
            if processed.contains(id) {
                break;
            }
        }
        unseen.push(message.clone());
    }
    unseen.reverse();
    unseen
}

/// Pair each tool message in `candidates` with the tool name declared by
/// the assistant call it answers.
fn extract_tool_results(input: &RunInput, candidates: &[InputMessage]) -> Vec<ToolResultMessage> {
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    for message in &input.messages {
        if let InputMessage::Assistant { tool_calls, .. } = message {
            for call in tool_calls {
                call_names.insert(call.id.as_str(), call.function.name.as_str());
            }
        }
    }

    candidates
        .iter()
        .filter_map(|message| match message {
            InputMessage::Tool {
                id,
                tool_call_id,
                content,
            } => Some(ToolResultMessage {
                tool_name: call_names
                    .get(tool_call_id.as_str())
                    .map(|name| (*name).to_owned())
                    .unwrap_or_else(|| "unknown".to_owned()),
                message_id: id.clone(),
                tool_call_id: tool_call_id.clone(),
                content: content.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// One `function` content with a response part per tool result.
fn tool_results_to_content(results: &[ToolResultMessage]) -> Content {
    let parts = results
        .iter()
        .map(|result| {
            Part::FunctionResponse(FunctionResponse {
                id: result.tool_call_id.clone(),
                name: result.tool_name.clone(),
                response: ToolPayload::Json(parse_tool_result_content(
                    &result.content,
                    &result.tool_call_id,
                )),
            })
        })
        .collect();
    Content {
        role: "function".to_owned(),
        parts,
    }
}

/// Parse a tool result's serialized content.  Empty content is an implicit
/// success; invalid JSON is forwarded as a structured error record so the
/// runtime can observe it — never an error here.
fn parse_tool_result_content(content: &str, tool_call_id: &str) -> Value {
    if content.trim().is_empty() {
        tracing::warn!(tool_call_id, "empty tool result content, substituting success");
        return json!({ "success": true, "result": null });
    }
    match serde_json::from_str::<Value>(content) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(
                tool_call_id,
                error = %e,
                line = e.line(),
                column = e.column(),
                "invalid JSON in tool result"
            );
            json!({
                "error": format!("Invalid JSON in tool result: {e}"),
                "raw_content": content,
                "error_type": "JSON_DECODE_ERROR",
                "line": e.line(),
                "column": e.column(),
            })
        }
    }
}

fn state_object(state: &Value) -> Map<String, Value> {
    match state {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    }
}
