use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub description: String,
    pub model: String,
    pub system_prompt: String,
    pub skills_json: String,
    pub is_control_hub: bool,
    pub is_enabled: bool,
    pub max_concurrency: i64,
    pub workspace_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl AgentConfig {
    /// Declared skills from `skills_json`; malformed JSON yields none.
    pub fn skills(&self) -> Vec<AgentSkill> {
        if self.skills_json.is_empty() {
            return Vec::new();
        }
        serde_json::from_str(&self.skills_json).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub task_keywords: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default = "default_skills")]
    pub skills_json: String,
    #[serde(default)]
    pub is_control_hub: bool,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: i64,
    #[serde(default)]
    pub workspace_id: Option<String>,
}

fn default_model() -> String {
    "gpt-4-turbo".into()
}
fn default_skills() -> String {
    "[]".into()
}
fn default_max_concurrency() -> i64 {
    1
}
