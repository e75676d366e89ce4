use crate::dispatcher::Dispatcher;
use crate::types::ExecuteOptions;
use conductor_core::ConductorResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// A request from one agent to another, with an optional reply task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub from: String,
    pub to: String,
    pub task: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Task run on `from` with the recipient's result as input.
    #[serde(default)]
    pub callback: Option<String>,
}

impl AgentMessage {
    pub fn new(from: impl Into<String>, to: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            task: task.into(),
            data: serde_json::Value::Null,
            callback: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = Some(callback.into());
        self
    }
}

/// Relays messages as plain dispatcher calls.
pub struct MessageRelay {
    dispatcher: Arc<Dispatcher>,
}

impl MessageRelay {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Run `to.task(data)`, then `from.callback(result)` when a callback is set.
    ///
    /// Returns the recipient's result; the callback's own output is discarded.
    /// A failure at either hop propagates.
    pub async fn send(&self, message: AgentMessage) -> ConductorResult<serde_json::Value> {
        info!(
            from = %message.from,
            to = %message.to,
            task = %message.task,
            callback = message.callback.as_deref().unwrap_or("-"),
            "Relaying message"
        );

        let result = self
            .dispatcher
            .execute(
                &message.to,
                Some(message.task.as_str()),
                message.data,
                ExecuteOptions::default(),
            )
            .await?;

        if let Some(callback) = message.callback.as_deref() {
            self.dispatcher
                .execute(
                    &message.from,
                    Some(callback),
                    result.clone(),
                    ExecuteOptions::default(),
                )
                .await?;
        }

        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_message_deserializes_without_callback() {
        let msg: AgentMessage = serde_json::from_value(serde_json::json!({
            "from": "planner", "to": "coder", "task": "implement", "data": {"ticket": 7}
        }))
        .unwrap();
        assert_eq!(msg.callback, None);
        assert_eq!(msg.data["ticket"], 7);
    }

    #[test]
    fn test_builder() {
        let msg = AgentMessage::new("a", "b", "review")
            .with_data(serde_json::json!([1, 2]))
            .with_callback("ack");
        assert_eq!(msg.callback.as_deref(), Some("ack"));
        assert_eq!(msg.data, serde_json::json!([1, 2]));
    }
}
