use serde::{Deserialize, Serialize};

/// Lifecycle of a task run. Terminal states have no outgoing edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Pending,
    Analyzing,
    Running,
    AwaitingConfirmation,
    Completed,
    Failed,
    Cancelled,
}

impl TaskRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRunStatus::Pending => "pending",
            TaskRunStatus::Analyzing => "analyzing",
            TaskRunStatus::Running => "running",
            TaskRunStatus::AwaitingConfirmation => "awaiting_confirmation",
            TaskRunStatus::Completed => "completed",
            TaskRunStatus::Failed => "failed",
            TaskRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskRunStatus::Pending),
            "analyzing" => Some(TaskRunStatus::Analyzing),
            "running" => Some(TaskRunStatus::Running),
            "awaiting_confirmation" => Some(TaskRunStatus::AwaitingConfirmation),
            "completed" => Some(TaskRunStatus::Completed),
            "failed" => Some(TaskRunStatus::Failed),
            "cancelled" => Some(TaskRunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskRunStatus::Completed | TaskRunStatus::Failed | TaskRunStatus::Cancelled
        )
    }

    /// Whether `next` is a legal edge out of `self`.
    pub fn can_transition_to(&self, next: TaskRunStatus) -> bool {
        use TaskRunStatus::*;
        match self {
            Pending => matches!(next, Analyzing | Failed | Cancelled),
            Analyzing => matches!(next, Running | Failed | Cancelled),
            Running => matches!(next, AwaitingConfirmation | Completed | Failed | Cancelled),
            AwaitingConfirmation => matches!(next, Running | Completed | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Pending => "pending",
            AssignmentStatus::Running => "running",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Failed => "failed",
            AssignmentStatus::Skipped => "skipped",
            AssignmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AssignmentStatus::Pending),
            "running" => Some(AssignmentStatus::Running),
            "completed" => Some(AssignmentStatus::Completed),
            "failed" => Some(AssignmentStatus::Failed),
            "skipped" => Some(AssignmentStatus::Skipped),
            "cancelled" => Some(AssignmentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AssignmentStatus::Pending | AssignmentStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    None,
    Once,
    Recurring,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::None => "none",
            ScheduleType::Once => "once",
            ScheduleType::Recurring => "recurring",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(ScheduleType::None),
            "once" => Some(ScheduleType::Once),
            "recurring" => Some(ScheduleType::Recurring),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceFrequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

/// Structured recurrence rule. `time` is "HH:MM" in UTC; `days_of_week`
/// uses 0 = Sunday.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrencePattern {
    pub frequency: RecurrenceFrequency,
    pub time: String,
    #[serde(default = "default_interval")]
    pub interval: i64,
    #[serde(default)]
    pub days_of_week: Option<Vec<u8>>,
    #[serde(default)]
    pub day_of_month: Option<u32>,
    #[serde(default)]
    pub month: Option<u32>,
}

fn default_interval() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: String,
    pub title: String,
    pub user_prompt: String,
    pub control_hub_agent_id: String,
    pub status: TaskRunStatus,
    pub task_plan_json: Option<String>,
    pub result_summary: Option<String>,
    pub total_tokens_in: i64,
    pub total_tokens_out: i64,
    pub total_cache_creation_tokens: i64,
    pub total_cache_read_tokens: i64,
    pub total_duration_ms: i64,
    pub rating: Option<i64>,
    pub schedule_type: ScheduleType,
    pub scheduled_time: Option<String>,
    pub recurrence_pattern_json: Option<String>,
    pub next_run_at: Option<String>,
    pub is_paused: bool,
    pub workspace_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRun {
    pub fn recurrence_pattern(&self) -> Option<RecurrencePattern> {
        self.recurrence_pattern_json
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub id: String,
    pub task_run_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub sequence_order: i64,
    pub input_text: String,
    pub output_text: Option<String>,
    pub status: AssignmentStatus,
    pub model_used: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub analysis: String,
    pub assignments: Vec<PlannedAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedAssignment {
    pub agent_id: String,
    pub task_description: String,
    pub sequence_order: i64,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub matched_skills: Vec<String>,
    #[serde(default)]
    pub selection_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRunRequest {
    pub user_prompt: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default = "default_require_confirmation")]
    pub require_confirmation: bool,
}

fn default_require_confirmation() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTaskRequest {
    pub task_run_id: String,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub scheduled_time: Option<String>,
    #[serde(default)]
    pub recurrence_pattern: Option<RecurrencePattern>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        use TaskRunStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            for next in [
                Pending,
                Analyzing,
                Running,
                AwaitingConfirmation,
                Completed,
                Failed,
                Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn pending_cannot_jump_to_completed() {
        assert!(!TaskRunStatus::Pending.can_transition_to(TaskRunStatus::Completed));
        assert!(TaskRunStatus::Pending.can_transition_to(TaskRunStatus::Analyzing));
    }

    #[test]
    fn status_round_trips_through_strings() {
        use TaskRunStatus::*;
        for status in [
            Pending,
            Analyzing,
            Running,
            AwaitingConfirmation,
            Completed,
            Failed,
            Cancelled,
        ] {
            assert_eq!(TaskRunStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn recurrence_pattern_deserializes_with_defaults() {
        let pattern: RecurrencePattern =
            serde_json::from_str(r#"{"frequency":"weekly","time":"09:00","days_of_week":[1,3,5]}"#)
                .unwrap();
        assert_eq!(pattern.interval, 1);
        assert_eq!(pattern.days_of_week, Some(vec![1, 3, 5]));
        assert!(pattern.day_of_month.is_none());
    }
}
