use crate::traits::{Tool, ToolContext, ToolExecutor};
use crate::types::{ToolCall, ToolDispatch, ToolOutput};
use anyhow::Result;
use async_trait::async_trait;
use tracing::{Instrument, debug, info_span};

/// Executor backed by a list of tools, routed by name.
#[allow(missing_debug_implementations)]
pub struct ToolSet {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolSet {
    pub fn new(tools: Vec<Box<dyn Tool>>) -> Self {
        Self { tools }
    }
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl ToolExecutor for ToolSet {
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolDispatch> {
        let span = info_span!("tool_execute", tool = %call.name, call_id = %call.id);
        async {
            debug!(arguments = %call.arguments, "tool arguments");
            for tool in &self.tools {
                if tool.name() == call.name {
                    return tool.execute(call, ctx).await;
                }
            }
            Ok(ToolDispatch::Ready(ToolOutput::error(format!(
                "unknown tool: {}",
                call.name
            ))))
        }
        .instrument(span)
        .await
    }

    fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_owned()).collect()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeTool, PendingTool};
    use serde_json::json;

    fn ctx() -> ToolContext {
        ToolContext {
            conversation_id: "conv".to_owned(),
            turn_id: "turn".to_owned(),
        }
    }

    #[tokio::test]
    async fn routes_by_name() {
        let set = ToolSet::new(vec![
            Box::new(FakeTool::new("echo", "hi")),
            Box::new(PendingTool::new("mail_wait")),
        ]);

        let ready = set
            .execute(&ToolCall::new("c1", "echo", json!({})), &ctx())
            .await
            .unwrap();
        assert_eq!(ready, ToolDispatch::Ready(ToolOutput::success("hi")));

        let pending = set
            .execute(&ToolCall::new("c2", "mail_wait", json!({})), &ctx())
            .await
            .unwrap();
        assert!(matches!(pending, ToolDispatch::Pending(signal) if signal.call_id == "c2"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_output() {
        let set = ToolSet::default();
        let output = set
            .execute(&ToolCall::new("c1", "nope", json!({})), &ctx())
            .await
            .unwrap();
        assert_eq!(
            output,
            ToolDispatch::Ready(ToolOutput::error("unknown tool: nope"))
        );
    }
}
