//! Advisory plan validation against the agent registry.
//!
//! Everything here produces warnings rather than errors, with one
//! exception: a dependency cycle makes the plan unexecutable (the
//! eligibility scan would never terminate), so the engine refuses to run
//! a plan whose validation reports one.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::models::agent::AgentConfig;
use crate::models::task_run::TaskPlan;

#[derive(Debug, Clone, Serialize)]
pub struct AssignmentValidation {
    pub agent_id: String,
    pub agent_name: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanValidation {
    pub is_valid: bool,
    pub assignment_validations: Vec<AssignmentValidation>,
    pub total_warnings: usize,
    /// Agent ids forming a dependency cycle, when one exists.
    pub cycle: Option<Vec<String>>,
}

impl PlanValidation {
    pub fn has_cycle(&self) -> bool {
        self.cycle.is_some()
    }
}

pub fn validate_plan(plan: &TaskPlan, agents: &[AgentConfig]) -> PlanValidation {
    let plan_agent_ids: HashSet<&str> =
        plan.assignments.iter().map(|a| a.agent_id.as_str()).collect();
    let cycle = find_dependency_cycle(plan);
    let cycle_members: HashSet<&str> = cycle
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(String::as_str)
        .collect();

    let mut assignment_validations = Vec::new();

    for assignment in &plan.assignments {
        let mut warnings = Vec::new();
        let agent_name;

        if let Some(agent) = agents.iter().find(|a| a.id == assignment.agent_id) {
            agent_name = agent.name.clone();
            if !agent.is_enabled {
                warnings.push(format!("Agent '{}' is disabled", agent.name));
            }

            // Check: task description keywords hit a skill's constraints
            let desc_lower = assignment.task_description.to_lowercase();
            for skill in agent.skills() {
                for constraint in &skill.constraints {
                    if constraint_overlaps(&desc_lower, constraint) {
                        warnings.push(format!(
                            "Task may violate constraint on skill '{}': {}",
                            skill.id, constraint
                        ));
                    }
                }
            }
        } else {
            agent_name = "Unknown".into();
            warnings.push(format!(
                "Agent ID '{}' not found in registered agents",
                assignment.agent_id
            ));
        }

        for dep in &assignment.depends_on {
            if !plan_agent_ids.contains(dep.as_str()) {
                warnings.push(format!(
                    "Dependency '{}' does not reference an assignment in this plan",
                    dep
                ));
            }
        }

        if cycle_members.contains(assignment.agent_id.as_str()) {
            warnings.push("Assignment is part of a dependency cycle".into());
        }

        if !warnings.is_empty() {
            assignment_validations.push(AssignmentValidation {
                agent_id: assignment.agent_id.clone(),
                agent_name,
                warnings,
            });
        }
    }

    let total_warnings: usize = assignment_validations.iter().map(|v| v.warnings.len()).sum();

    PlanValidation {
        is_valid: total_warnings == 0 && cycle.is_none(),
        assignment_validations,
        total_warnings,
        cycle,
    }
}

/// Depth-first search over `depends_on` edges (restricted to ids present
/// in the plan). Returns the members of the first cycle found.
fn find_dependency_cycle(plan: &TaskPlan) -> Option<Vec<String>> {
    let edges: HashMap<&str, Vec<&str>> = plan
        .assignments
        .iter()
        .map(|a| {
            (
                a.agent_id.as_str(),
                a.depends_on.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|&n| n == node).unwrap_or(0);
                return Some(stack[start..].iter().map(|s| s.to_string()).collect());
            }
            None => {}
        }

        marks.insert(node, Mark::Visiting);
        stack.push(node);

        if let Some(deps) = edges.get(node) {
            for dep in deps {
                if edges.contains_key(dep) {
                    if let Some(cycle) = visit(dep, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    for node in edges.keys() {
        let mut stack = Vec::new();
        if let Some(cycle) = visit(node, &edges, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

/// At least 2 words of length >3 from the constraint appearing in the
/// task description counts as a likely violation.
fn constraint_overlaps(task_lower: &str, constraint: &str) -> bool {
    let constraint_lower = constraint.to_lowercase();
    let hits = constraint_lower
        .split_whitespace()
        .filter(|w| w.len() > 3 && task_lower.contains(*w))
        .count();
    hits >= 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task_run::PlannedAssignment;

    fn agent(id: &str, enabled: bool) -> AgentConfig {
        AgentConfig {
            id: id.into(),
            name: format!("Agent {id}"),
            description: String::new(),
            model: "gpt-4-turbo".into(),
            system_prompt: String::new(),
            skills_json: "[]".into(),
            is_control_hub: false,
            is_enabled: enabled,
            max_concurrency: 1,
            workspace_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn planned(agent_id: &str, order: i64, depends_on: &[&str]) -> PlannedAssignment {
        PlannedAssignment {
            agent_id: agent_id.into(),
            task_description: "do the thing".into(),
            sequence_order: order,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            matched_skills: Vec::new(),
            selection_reason: None,
        }
    }

    #[test]
    fn clean_plan_is_valid() {
        let plan = TaskPlan {
            analysis: String::new(),
            assignments: vec![planned("a", 0, &[]), planned("b", 1, &["a"])],
        };
        let validation = validate_plan(&plan, &[agent("a", true), agent("b", true)]);
        assert!(validation.is_valid);
        assert_eq!(validation.total_warnings, 0);
        assert!(validation.cycle.is_none());
    }

    #[test]
    fn unknown_agent_warns_but_does_not_invalidate_structure() {
        let plan = TaskPlan {
            analysis: String::new(),
            assignments: vec![planned("ghost", 0, &[])],
        };
        let validation = validate_plan(&plan, &[agent("a", true)]);
        assert!(!validation.is_valid);
        assert!(validation.cycle.is_none());
        assert!(validation.assignment_validations[0].warnings[0].contains("not found"));
    }

    #[test]
    fn disabled_agent_warns() {
        let plan = TaskPlan {
            analysis: String::new(),
            assignments: vec![planned("a", 0, &[])],
        };
        let validation = validate_plan(&plan, &[agent("a", false)]);
        assert!(validation.assignment_validations[0].warnings[0].contains("disabled"));
    }

    #[test]
    fn dangling_dependency_warns() {
        let plan = TaskPlan {
            analysis: String::new(),
            assignments: vec![planned("a", 0, &["nope"])],
        };
        let validation = validate_plan(&plan, &[agent("a", true)]);
        assert!(validation.assignment_validations[0]
            .warnings
            .iter()
            .any(|w| w.contains("does not reference an assignment")));
    }

    #[test]
    fn cycle_invalidates_and_warns_every_member() {
        let plan = TaskPlan {
            analysis: String::new(),
            assignments: vec![
                planned("a", 0, &["c"]),
                planned("b", 1, &["a"]),
                planned("c", 2, &["b"]),
            ],
        };
        let validation = validate_plan(
            &plan,
            &[agent("a", true), agent("b", true), agent("c", true)],
        );
        assert!(!validation.is_valid);
        let cycle = validation.cycle.as_ref().unwrap();
        assert_eq!(cycle.len(), 3);
        assert_eq!(validation.assignment_validations.len(), 3);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let plan = TaskPlan {
            analysis: String::new(),
            assignments: vec![planned("a", 0, &["a"])],
        };
        let validation = validate_plan(&plan, &[agent("a", true)]);
        assert!(validation.has_cycle());
    }
}
