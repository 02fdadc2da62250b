//! Client-side tools wrapped as runtime-callable stubs.
//!
//! When the runtime invokes one of these, the stub emits the wire tool-call
//! events onto the execution's queue and suspends: the actual execution
//! happens on the client, and the result arrives later as a separate wire
//! request carrying a tool message.  The stub never hands a synthetic value
//! back to the runtime.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use swb_domain::agent::RuntimeTool;
use swb_domain::message::ToolDefinition;
use swb_domain::runtime::ToolPayload;
use swb_domain::wire::WireEvent;
use swb_domain::{Error, Result};

pub struct ClientProxyToolset;

impl ClientProxyToolset {
    /// Wrap each client-declared tool as a long-running runtime stub bound
    /// to the execution's event queue.
    pub fn build(
        tools: &[ToolDefinition],
        queue: mpsc::Sender<WireEvent>,
        tool_timeout: Duration,
    ) -> Vec<Arc<dyn RuntimeTool>> {
        tools
            .iter()
            .map(|definition| {
                Arc::new(ClientProxyTool {
                    definition: definition.clone(),
                    queue: queue.clone(),
                    tool_timeout,
                }) as Arc<dyn RuntimeTool>
            })
            .collect()
    }
}

struct ClientProxyTool {
    definition: ToolDefinition,
    queue: mpsc::Sender<WireEvent>,
    tool_timeout: Duration,
}

#[async_trait::async_trait]
impl RuntimeTool for ClientProxyTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    fn is_long_running(&self) -> bool {
        true
    }

    async fn call(&self, call_id: &str, args: Value) -> Result<ToolPayload> {
        let send = |event: WireEvent| {
            let queue = self.queue.clone();
            async move {
                queue
                    .send(event)
                    .await
                    .map_err(|_| Error::Execution("event queue closed".into()))
            }
        };

        send(WireEvent::ToolCallStart {
            tool_call_id: call_id.to_owned(),
            tool_call_name: self.definition.name.clone(),
            parent_message_id: None,
        })
        .await?;
        send(WireEvent::ToolCallArgs {
            tool_call_id: call_id.to_owned(),
            delta: serde_json::to_string(&args).unwrap_or_else(|_| "{}".to_owned()),
        })
        .await?;
        send(WireEvent::ToolCallEnd {
            tool_call_id: call_id.to_owned(),
        })
        .await?;

        // Completion arrives as a separate wire request; this call only
        // marks time.  Past the budget we warn and keep suspending.
        tokio::time::sleep(self.tool_timeout).await;
        tracing::warn!(
            tool = %self.definition.name,
            call_id,
            timeout_secs = self.tool_timeout.as_secs(),
            "client tool still pending past its budget"
        );
        std::future::pending().await
    }
}
