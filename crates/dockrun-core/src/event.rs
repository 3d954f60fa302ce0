//! Events published while a build job runs.
//!
//! Every stage outcome produces exactly one event. Events are append-only:
//! once published they are never revised.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{BuildJob, Result};

/// What an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Subject {
    Build,
    Command,
}

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Info,
    Success,
    Error,
}

/// Outcome of one command run inside the build container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// The argument vector joined with spaces.
    pub command: String,
    pub exit_code: i64,
    /// Combined stdout and stderr.
    pub stdout: String,
}

/// Stage-specific event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventContent {
    Text(String),
    Command(CommandResult),
}

impl From<String> for EventContent {
    fn from(text: String) -> Self {
        EventContent::Text(text)
    }
}

impl From<&str> for EventContent {
    fn from(text: &str) -> Self {
        EventContent::Text(text.to_string())
    }
}

impl From<CommandResult> for EventContent {
    fn from(result: CommandResult) -> Self {
        EventContent::Command(result)
    }
}

/// A status message describing a stage or command outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub subject: Subject,
    pub project_id: String,
    pub build_id: String,
    /// Unix seconds.
    pub date: i64,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub content: EventContent,
}

impl Event {
    /// Create an event for `job`, stamped with the current time.
    pub fn new(
        job: &BuildJob,
        subject: Subject,
        kind: EventType,
        content: impl Into<EventContent>,
    ) -> Self {
        Self {
            subject,
            project_id: job.project_id.clone(),
            build_id: job.build_id.clone(),
            date: Utc::now().timestamp(),
            kind,
            content: content.into(),
        }
    }
}

/// Destination for build events (an outbound queue, stdout, a test buffer).
///
/// Implementations must be safe to share between every stage of a run.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> BuildJob {
        BuildJob {
            project_id: "proj".to_string(),
            build_id: "42".to_string(),
            folder: "src".to_string(),
            commands: vec![],
        }
    }

    #[test]
    fn test_text_event_wire_format() {
        let mut event = Event::new(&job(), Subject::Build, EventType::Info, "Container created");
        event.date = 1_700_000_000;

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "subject": "Build",
                "projectId": "proj",
                "buildId": "42",
                "date": 1_700_000_000,
                "type": "info",
                "content": "Container created"
            })
        );
    }

    #[test]
    fn test_command_event_wire_format() {
        let result = CommandResult {
            command: "make test".to_string(),
            exit_code: 2,
            stdout: "boom\n".to_string(),
        };
        let event = Event::new(&job(), Subject::Command, EventType::Error, result);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["subject"], "Command");
        assert_eq!(value["type"], "error");
        assert_eq!(
            value["content"],
            json!({"command": "make test", "exitCode": 2, "stdout": "boom\n"})
        );
    }

    #[test]
    fn test_event_decodes_both_content_shapes() {
        let text: Event = serde_json::from_value(json!({
            "subject": "Build", "projectId": "p", "buildId": "b",
            "date": 1, "type": "success", "content": "Build successful"
        }))
        .unwrap();
        assert_eq!(text.content, EventContent::Text("Build successful".to_string()));

        let cmd: Event = serde_json::from_value(json!({
            "subject": "Command", "projectId": "p", "buildId": "b", "date": 1,
            "type": "success", "content": {"command": "ls", "exitCode": 0, "stdout": ""}
        }))
        .unwrap();
        assert!(matches!(cmd.content, EventContent::Command(ref r) if r.exit_code == 0));
    }
}
