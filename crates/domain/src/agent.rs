//! The agent handle passed to the runner factory: a name, an instruction
//! source, and the runtime-callable tools.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::message::ToolDefinition;
use crate::runtime::ToolPayload;

/// Context available when resolving an agent instruction.
#[derive(Debug, Clone)]
pub struct InstructionContext {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

/// Source of an agent's system instruction.
pub trait InstructionProvider: Send + Sync {
    fn resolve(&self, ctx: &InstructionContext) -> String;
}

/// A fixed instruction string.
pub struct StaticInstruction(pub String);

impl InstructionProvider for StaticInstruction {
    fn resolve(&self, _ctx: &InstructionContext) -> String {
        self.0.clone()
    }
}

/// Decorator appending a suffix to an inner instruction source.
///
/// Used to splice a client-supplied system message onto the agent's base
/// instruction without rebuilding the agent.
pub struct SuffixedInstruction {
    inner: Arc<dyn InstructionProvider>,
    suffix: String,
}

impl SuffixedInstruction {
    pub fn new(inner: Arc<dyn InstructionProvider>, suffix: impl Into<String>) -> Self {
        Self {
            inner,
            suffix: suffix.into(),
        }
    }
}

impl InstructionProvider for SuffixedInstruction {
    fn resolve(&self, ctx: &InstructionContext) -> String {
        let base = self.inner.resolve(ctx);
        if base.is_empty() {
            self.suffix.clone()
        } else {
            format!("{base}\n\n{}", self.suffix)
        }
    }
}

/// A tool the runtime can invoke while executing a turn.
#[async_trait::async_trait]
pub trait RuntimeTool: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    /// Long-running tools are executed by the client; their call never
    /// produces a value inside the runtime.
    fn is_long_running(&self) -> bool {
        false
    }

    async fn call(&self, call_id: &str, args: Value) -> Result<ToolPayload>;
}

/// The agent definition handed to the runner factory.
#[derive(Clone)]
pub struct AgentHandle {
    pub name: String,
    pub instruction: Arc<dyn InstructionProvider>,
    pub tools: Vec<Arc<dyn RuntimeTool>>,
}

impl AgentHandle {
    pub fn new(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instruction: Arc::new(StaticInstruction(instruction.into())),
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn RuntimeTool>>) -> Self {
        self.tools = tools;
        self
    }

    /// Clone of this handle with `suffix` appended to the instruction.
    pub fn with_instruction_suffix(&self, suffix: impl Into<String>) -> Self {
        Self {
            name: self.name.clone(),
            instruction: Arc::new(SuffixedInstruction::new(self.instruction.clone(), suffix)),
            tools: self.tools.clone(),
        }
    }

    pub fn tool_names(&self) -> HashSet<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("name", &self.name)
            .field("tools", &self.tools.len())
            .finish()
    }
}
