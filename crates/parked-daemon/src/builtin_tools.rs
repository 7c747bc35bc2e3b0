//! Tools the daemon serves to `run_turn` requests.

use anyhow::Result;
use async_trait::async_trait;
use parked_core::tools::ToolSet;
use parked_core::{PendingSignal, Tool, ToolCall, ToolContext, ToolDispatch, ToolOutput};
use serde_json::Value;

pub(crate) fn builtin_tools() -> ToolSet {
    ToolSet::new(vec![
        Box::new(EchoTool),
        Box::new(MailWaitTool),
        Box::new(ExternalWaitTool),
    ])
}

/// Answers immediately with its `text` argument, or the arguments as JSON.
#[derive(Debug)]
pub(crate) struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> Result<ToolDispatch> {
        let text = match call.arguments.get("text") {
            Some(Value::String(text)) => text.clone(),
            _ => call.arguments.to_string(),
        };
        Ok(ToolDispatch::Ready(ToolOutput::success(text)))
    }
}

/// Parks until a reply to one or more sent messages is delivered.
#[derive(Debug)]
pub(crate) struct MailWaitTool;

#[async_trait]
impl Tool for MailWaitTool {
    fn name(&self) -> &str {
        "mail_wait"
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> Result<ToolDispatch> {
        let ids = message_ids(&call.arguments);
        if ids.is_empty() {
            return Ok(ToolDispatch::Ready(ToolOutput::error(
                "mail_wait needs message_id or message_ids",
            )));
        }
        Ok(ToolDispatch::Pending(PendingSignal {
            call_id: call.id.clone(),
            tool_name: self.name().to_owned(),
            note: Some(format!("waiting for a reply to {}", ids.join(", "))),
        }))
    }
}

fn message_ids(arguments: &Value) -> Vec<String> {
    let single = arguments.get("message_id").into_iter();
    let many = arguments
        .get("message_ids")
        .and_then(Value::as_array)
        .into_iter()
        .flatten();
    single
        .chain(many)
        .filter_map(|value| match value {
            Value::String(id) => Some(id.trim().to_owned()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        })
        .filter(|id| !id.is_empty())
        .collect()
}

/// Parks until anything at all is delivered. `note` is passed through.
#[derive(Debug)]
pub(crate) struct ExternalWaitTool;

#[async_trait]
impl Tool for ExternalWaitTool {
    fn name(&self) -> &str {
        "wait_external"
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> Result<ToolDispatch> {
        let note = call
            .arguments
            .get("note")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Ok(ToolDispatch::Pending(PendingSignal {
            call_id: call.id.clone(),
            tool_name: self.name().to_owned(),
            note,
        }))
    }
}
