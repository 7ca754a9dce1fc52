//! Plan acquisition helpers: the control-hub prompt, response parsing
//! and the plan clean-up passes that run before validation.

use crate::error::{AppError, AppResult};
use crate::models::agent::AgentConfig;
use crate::models::task_run::TaskPlan;

/// Build a structured agent catalog in XML form for the control hub
/// prompt.
pub fn build_agent_catalog(agents: &[&AgentConfig]) -> String {
    let mut xml = String::from("<available_agents>\n");
    for a in agents {
        xml.push_str("  <agent>\n");
        xml.push_str(&format!("    <id>{}</id>\n", xml_escape(&a.id)));
        xml.push_str(&format!("    <name>{}</name>\n", xml_escape(&a.name)));
        xml.push_str(&format!(
            "    <description>{}</description>\n",
            xml_escape(if a.description.is_empty() { "N/A" } else { &a.description })
        ));
        xml.push_str(&format!("    <model>{}</model>\n", xml_escape(&a.model)));
        xml.push_str(&format!(
            "    <max_concurrency>{}</max_concurrency>\n",
            a.max_concurrency
        ));

        let skills = a.skills();
        if !skills.is_empty() {
            xml.push_str("    <skills>\n");
            for skill in &skills {
                xml.push_str("      <skill>\n");
                xml.push_str(&format!("        <id>{}</id>\n", xml_escape(&skill.id)));
                xml.push_str(&format!("        <name>{}</name>\n", xml_escape(&skill.name)));
                xml.push_str(&format!(
                    "        <description>{}</description>\n",
                    xml_escape(&skill.description)
                ));
                if !skill.constraints.is_empty() {
                    xml.push_str(&format!(
                        "        <constraints>{}</constraints>\n",
                        xml_escape(&skill.constraints.join(" "))
                    ));
                }
                xml.push_str("      </skill>\n");
            }
            xml.push_str("    </skills>\n");
        }

        xml.push_str("  </agent>\n");
    }
    xml.push_str("</available_agents>");
    xml
}

/// Escape special XML characters in text content and attribute values.
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn build_plan_prompt(catalog: &str, user_prompt: &str) -> String {
    format!(
        r#"You are the orchestration control hub. Decompose the user request into subtasks and assign each to the best-matching agent.

## Available Agents

{catalog}

## User Request

{user_prompt}

## Instructions

1. Analyze the request and identify subtasks based ONLY on the information above.
2. Match each subtask to the agent whose skills best fit.
3. Respect each agent's constraints.
4. If no agent has a matching skill, choose the most general-purpose agent.

CRITICAL: You MUST respond with ONLY a valid JSON object. No explanations, no preamble, no markdown, no thinking — ONLY the JSON object below. Do NOT attempt to explore, research, or use tools. Make your plan based solely on the agent catalog and user request provided above.

{{"analysis": "Brief reasoning about task decomposition and agent matching", "assignments": [{{"agent_id": "uuid-from-catalog", "task_description": "Detailed instruction for the agent", "sequence_order": 0, "depends_on": [], "matched_skills": ["skill_id"], "selection_reason": "Why this agent"}}]}}

Rules:
- Output ONLY the JSON object, nothing else
- agent_id must come from the catalog above
- matched_skills must reference skill IDs from the assigned agent
- sequence_order: 0 for parallel, increment for sequential
- depends_on: agent_ids whose output is needed first
- Always return at least one assignment"#,
    )
}

pub fn build_plan_retry_prompt() -> String {
    "Your previous response was not valid JSON. I need ONLY a raw JSON object, no text before or after it.\n\n\
     The expected format is:\n\
     {\"analysis\": \"...\", \"assignments\": [{\"agent_id\": \"...\", \"task_description\": \"...\", \"sequence_order\": 0, \"depends_on\": [], \"matched_skills\": [\"...\"], \"selection_reason\": \"...\"}]}\n\n\
     Respond with ONLY the JSON object. No markdown code fences, no explanation."
        .to_string()
}

pub fn build_summary_prompt(user_prompt: &str, outputs: &[(String, String)]) -> String {
    format!(
        "Summarize the results of the orchestration.\n\nOriginal request: {}\n\nAgent outputs:\n{}",
        user_prompt,
        outputs
            .iter()
            .map(|(name, out)| format!("--- {} ---\n{}\n", name, out))
            .collect::<String>()
    )
}

pub fn parse_task_plan(response: &str) -> AppResult<TaskPlan> {
    let json_str = extract_json_from_response(response);
    let sanitized = sanitize_llm_json(&json_str);

    serde_json::from_str::<TaskPlan>(&sanitized).map_err(|e| {
        // Truncate response preview — char-aware slicing avoids panics on
        // multi-byte content.
        let preview = if response.chars().count() > 500 {
            let truncated: String = response.chars().take(500).collect();
            format!(
                "{}...(truncated, {} chars total)",
                truncated,
                response.chars().count()
            )
        } else {
            response.to_string()
        };
        AppError::Internal(format!(
            "Failed to parse task plan from control hub response: {e}\nResponse preview: {preview}"
        ))
    })
}

/// Sanitize JSON produced by LLMs — fix common issues that cause parse
/// failures:
/// 1. Unescaped control characters (literal newlines, tabs, etc.) inside string values
/// 2. Unescaped double quotes inside string values
/// 3. Trailing commas before `}` or `]`
///
/// For unescaped quotes we use a look-ahead heuristic: a `"` inside a
/// string is the *real* closing quote only if the next non-whitespace
/// byte is a JSON structural character (`:`, `,`, `}`, `]`) or
/// end-of-input. Otherwise it is content and gets escaped as `\"`.
pub fn sanitize_llm_json(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + 64);
    let mut in_string = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if in_string {
            if b == b'\\' {
                // Escaped sequence — copy the backslash and the next byte verbatim
                out.push(b);
                if i + 1 < bytes.len() {
                    i += 1;
                    out.push(bytes[i]);
                }
            } else if b == b'"' {
                let mut k = i + 1;
                while k < bytes.len() && matches!(bytes[k], b' ' | b'\t' | b'\n' | b'\r') {
                    k += 1;
                }
                if k >= bytes.len() || matches!(bytes[k], b':' | b',' | b'}' | b']') {
                    // Real closing quote
                    in_string = false;
                    out.push(b);
                } else {
                    // Content quote — escape it
                    out.extend_from_slice(b"\\\"");
                }
            } else if b < 0x20 {
                match b {
                    b'\n' => out.extend_from_slice(b"\\n"),
                    b'\r' => out.extend_from_slice(b"\\r"),
                    b'\t' => out.extend_from_slice(b"\\t"),
                    _ => {
                        out.extend_from_slice(format!("\\u{:04x}", b).as_bytes());
                    }
                }
            } else {
                out.push(b);
            }
        } else {
            if b == b'"' {
                in_string = true;
            }
            out.push(b);
        }
        i += 1;
    }

    let s = String::from_utf8(out).unwrap_or_else(|_| input.to_string());

    // Pass 2: remove trailing commas before } or ]
    let bytes2 = s.as_bytes();
    let mut result = Vec::with_capacity(bytes2.len());
    let mut in_str = false;
    let mut esc = false;
    let mut j = 0;
    while j < bytes2.len() {
        let b = bytes2[j];
        if esc {
            esc = false;
            result.push(b);
            j += 1;
            continue;
        }
        if in_str {
            if b == b'\\' {
                esc = true;
            } else if b == b'"' {
                in_str = false;
            }
            result.push(b);
            j += 1;
            continue;
        }
        if b == b'"' {
            in_str = true;
            result.push(b);
            j += 1;
            continue;
        }
        if b == b',' {
            let mut k = j + 1;
            while k < bytes2.len() && matches!(bytes2[k], b' ' | b'\t' | b'\n' | b'\r') {
                k += 1;
            }
            if k < bytes2.len() && (bytes2[k] == b'}' || bytes2[k] == b']') {
                j += 1;
                continue;
            }
        }
        result.push(b);
        j += 1;
    }

    String::from_utf8(result).unwrap_or(s)
}

/// Find the first `{` and brace-depth match to its closing `}`. Handles
/// prose and code fences around the object, and fences embedded inside
/// JSON strings.
pub fn extract_json_from_response(response: &str) -> String {
    if let Some(start) = response.find('{') {
        let bytes = response.as_bytes();
        let mut depth = 0i32;
        let mut in_string = false;
        let mut escape_next = false;
        let mut end = start;

        for (i, &byte) in bytes.iter().enumerate().skip(start) {
            let ch = byte as char;
            if escape_next {
                escape_next = false;
                continue;
            }
            if ch == '\\' && in_string {
                escape_next = true;
                continue;
            }
            if ch == '"' {
                in_string = !in_string;
                continue;
            }
            if in_string {
                continue;
            }
            if ch == '{' {
                depth += 1;
            } else if ch == '}' {
                depth -= 1;
                if depth == 0 {
                    end = i;
                    break;
                }
            }
        }

        if depth == 0 && end > start {
            return response[start..=end].to_string();
        }
    }

    response.to_string()
}

/// Auto-correct `matched_skills` in a parsed plan to reference valid
/// skill IDs.
///
/// Non-existent skill IDs are replaced with the closest declared skill
/// (normalized comparison); empty `matched_skills` are inferred from the
/// task description via keyword overlap.
pub fn auto_correct_plan_skills(mut plan: TaskPlan, agents: &[AgentConfig]) -> TaskPlan {
    for assignment in &mut plan.assignments {
        let agent = match agents.iter().find(|a| a.id == assignment.agent_id) {
            Some(a) => a,
            None => continue,
        };

        let skills = agent.skills();
        if skills.is_empty() {
            continue;
        }
        let skill_ids: Vec<&str> = skills.iter().map(|s| s.id.as_str()).collect();

        if assignment.matched_skills.is_empty() {
            assignment.matched_skills = infer_skills(&assignment.task_description, agent);
        } else {
            let mut corrected = Vec::new();
            for skill_id in &assignment.matched_skills {
                if skill_ids.contains(&skill_id.as_str()) {
                    corrected.push(skill_id.clone());
                } else if let Some(best) = find_closest_skill_id(skill_id, &skill_ids) {
                    log::info!(
                        "Auto-corrected skill '{}' -> '{}' for agent '{}'",
                        skill_id,
                        best,
                        agent.name,
                    );
                    corrected.push(best);
                }
                // else: no close match found, drop it silently
            }

            if corrected.is_empty() {
                // All IDs were invalid and dropped — fall back to inference
                corrected = infer_skills(&assignment.task_description, agent);
            }
            assignment.matched_skills = corrected;
        }
    }

    plan
}

fn infer_skills(task_description: &str, agent: &AgentConfig) -> Vec<String> {
    let desc_lower = task_description.to_lowercase();
    let mut matched = Vec::new();

    for skill in agent.skills() {
        let hit = skill
            .task_keywords
            .iter()
            .any(|kw| kw.len() > 2 && desc_lower.contains(&kw.to_lowercase()))
            || desc_lower.contains(&skill.name.to_lowercase())
            || desc_lower.contains(&skill.id.to_lowercase());

        if hit {
            matched.push(skill.id.clone());
        }
    }

    matched
}

/// Normalize for fuzzy skill-ID comparison: lowercase, hyphens/spaces to
/// underscores.
fn normalize_skill_id(s: &str) -> String {
    s.to_lowercase().replace(['-', ' '], "_")
}

fn find_closest_skill_id(target: &str, candidates: &[&str]) -> Option<String> {
    let norm_target = normalize_skill_id(target);

    for &cand in candidates {
        if normalize_skill_id(cand) == norm_target {
            return Some(cand.to_string());
        }
    }

    // Substring containment (either direction)
    for &cand in candidates {
        let norm_cand = normalize_skill_id(cand);
        if norm_cand.contains(&norm_target) || norm_target.contains(&norm_cand) {
            return Some(cand.to_string());
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Agent-to-Agent (A2A) delegation markers
// ---------------------------------------------------------------------------

pub const MAX_A2A_ITERATIONS: usize = 5;

pub struct A2aCall {
    pub target_agent_id: String,
    pub prompt: String,
}

/// Parse `<a2a_call agent_id="...">prompt</a2a_call>` from agent output.
/// Uses the last occurrence if multiple are present.
pub fn parse_a2a_call(text: &str) -> Option<A2aCall> {
    let start_tag_prefix = "<a2a_call agent_id=\"";
    let end_tag = "</a2a_call>";

    let start_idx = text.rfind(start_tag_prefix)?;
    let after_prefix = &text[start_idx + start_tag_prefix.len()..];
    let quote_end = after_prefix.find('"')?;
    let agent_id = after_prefix[..quote_end].to_string();
    let close_bracket = after_prefix.find('>')?;
    let content_start = start_idx + start_tag_prefix.len() + close_bracket + 1;
    if content_start >= text.len() {
        return None;
    }
    let end_idx = text[content_start..].find(end_tag)?;
    let prompt = text[content_start..content_start + end_idx].trim().to_string();
    if agent_id.is_empty() || prompt.is_empty() {
        return None;
    }
    Some(A2aCall {
        target_agent_id: agent_id,
        prompt,
    })
}

/// Follow-up prompt sent to the calling agent after an A2A delegation
/// resolves.
pub fn build_a2a_followup(target_name: &str, response: &str) -> String {
    format!(
        "## A2A Call Result\n\nAgent **{}** responded:\n\n{}\n\n---\n\nPlease continue your work with this result.",
        target_name, response
    )
}

/// "Peer Agents" section appended to assignment inputs so an executing
/// agent can discover and delegate to its siblings at runtime.
pub fn build_peer_agent_section(all_agents: &[AgentConfig], current_agent_id: &str) -> String {
    let peers: Vec<&AgentConfig> = all_agents
        .iter()
        .filter(|a| a.id != current_agent_id && a.is_enabled)
        .collect();

    if peers.is_empty() {
        return String::new();
    }

    let mut section = String::from("\n\n---\n## Available Peer Agents\n");
    section.push_str("You can delegate subtasks to these agents. To call a peer agent, ");
    section.push_str("output an A2A call block at the end of your response:\n\n");
    section.push_str(
        "```\n<a2a_call agent_id=\"AGENT_UUID\">\nDetailed task description for the agent\n</a2a_call>\n```\n\n",
    );
    section.push_str(
        "The orchestrator will execute the target agent and return the result in a follow-up prompt.\n\n",
    );

    for peer in &peers {
        section.push_str(&format!(
            "- **{}** (`{}`): {}\n",
            peer.name, peer.id, peer.description
        ));
    }
    section
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_from_fenced_response() {
        let response = "Here is the plan:\n```json\n{\"analysis\": \"x\", \"assignments\": []}\n```\nDone.";
        let plan = parse_task_plan(response).unwrap();
        assert_eq!(plan.analysis, "x");
        assert!(plan.assignments.is_empty());
    }

    #[test]
    fn sanitizer_escapes_literal_newlines_in_strings() {
        let raw = "{\"analysis\": \"line one\nline two\", \"assignments\": []}";
        let plan = parse_task_plan(raw).unwrap();
        assert_eq!(plan.analysis, "line one\nline two");
    }

    #[test]
    fn sanitizer_removes_trailing_commas() {
        let raw = r#"{"analysis": "x", "assignments": [],}"#;
        let plan = parse_task_plan(raw).unwrap();
        assert_eq!(plan.analysis, "x");
    }

    #[test]
    fn sanitizer_escapes_content_quotes() {
        let raw = r#"{"analysis": "he said "done" already", "assignments": []}"#;
        let plan = parse_task_plan(raw).unwrap();
        assert_eq!(plan.analysis, "he said \"done\" already");
    }

    #[test]
    fn garbage_response_is_an_error_with_preview() {
        let err = parse_task_plan("I cannot help with that").unwrap_err();
        assert!(err.to_string().contains("Response preview"));
    }

    #[test]
    fn parses_full_plan_shape() {
        let raw = r#"{"analysis": "two steps", "assignments": [
            {"agent_id": "a", "task_description": "research", "sequence_order": 0, "depends_on": [], "matched_skills": ["web_search"], "selection_reason": "best fit"},
            {"agent_id": "b", "task_description": "write", "sequence_order": 1, "depends_on": ["a"]}
        ]}"#;
        let plan = parse_task_plan(raw).unwrap();
        assert_eq!(plan.assignments.len(), 2);
        assert_eq!(plan.assignments[1].depends_on, vec!["a"]);
        assert!(plan.assignments[1].matched_skills.is_empty());
    }

    #[test]
    fn a2a_marker_round_trip() {
        let text = "Working on it.\n<a2a_call agent_id=\"ag-2\">\nsummarize the findings\n</a2a_call>";
        let call = parse_a2a_call(text).unwrap();
        assert_eq!(call.target_agent_id, "ag-2");
        assert_eq!(call.prompt, "summarize the findings");
    }

    #[test]
    fn a2a_marker_absent() {
        assert!(parse_a2a_call("plain output").is_none());
    }

    #[test]
    fn closest_skill_id_normalizes() {
        assert_eq!(
            find_closest_skill_id("Web-Search", &["web_search", "summarize"]),
            Some("web_search".into())
        );
        assert_eq!(find_closest_skill_id("deploy", &["web_search"]), None);
    }

    #[test]
    fn catalog_escapes_xml() {
        let mut agent = crate::models::agent::AgentConfig {
            id: "a".into(),
            name: "R&D <bot>".into(),
            description: String::new(),
            model: "m".into(),
            system_prompt: String::new(),
            skills_json: "[]".into(),
            is_control_hub: false,
            is_enabled: true,
            max_concurrency: 1,
            workspace_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        agent.description = "does \"things\"".into();
        let xml = build_agent_catalog(&[&agent]);
        assert!(xml.contains("R&amp;D &lt;bot&gt;"));
        assert!(xml.contains("&quot;things&quot;"));
    }
}
