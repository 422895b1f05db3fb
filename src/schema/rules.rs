//! Plan and patch rules that JSON Schema cannot express.

use std::collections::{HashMap, HashSet};

use shipwright_common::{Patch, Plan};

/// Errors fail validation; warnings are reported alongside a valid result.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RuleFindings {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn check_plan(plan: &Plan) -> RuleFindings {
    let mut findings = RuleFindings::default();

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, step) in plan.steps.iter().enumerate() {
        if index.insert(step.id.as_str(), i).is_some() {
            findings
                .errors
                .push(format!("Duplicate step id '{}'", step.id));
        }
    }

    for step in &plan.steps {
        if step.files.is_empty() {
            findings
                .warnings
                .push(format!("Step '{}' does not list any files", step.id));
        }
        for dep in &step.depends_on {
            if dep == &step.id {
                findings
                    .errors
                    .push(format!("Step '{}' depends on itself", step.id));
            } else if !index.contains_key(dep.as_str()) {
                findings.errors.push(format!(
                    "Step '{}' depends on unknown step '{}'",
                    step.id, dep
                ));
            }
        }
    }

    // cycle check only makes sense once the references are sound
    if findings.errors.is_empty()
        && let Some(cycle) = steps_in_cycle(plan, &index)
    {
        findings.errors.push(format!(
            "Step dependencies form a cycle involving: {}",
            cycle.join(", ")
        ));
    }

    findings
}

/// Kahn's algorithm over `depends_on`; returns the ids left unprocessed.
fn steps_in_cycle(plan: &Plan, index: &HashMap<&str, usize>) -> Option<Vec<String>> {
    let n = plan.steps.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (to, step) in plan.steps.iter().enumerate() {
        for dep in &step.depends_on {
            if let Some(&from) = index.get(dep.as_str()) {
                dependents[from].push(to);
                in_degree[to] += 1;
            }
        }
    }

    let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut processed = 0;
    while let Some(node) = queue.pop() {
        processed += 1;
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push(next);
            }
        }
    }

    (processed != n).then(|| {
        in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| plan.steps[i].id.clone())
            .collect()
    })
}

pub fn check_patch(patch: &Patch) -> RuleFindings {
    let mut findings = RuleFindings::default();

    let mut seen = HashSet::new();
    for file in &patch.files {
        if !seen.insert(file.path.as_str()) {
            findings
                .errors
                .push(format!("File '{}' appears more than once", file.path));
        }
    }

    if patch.total_lines_changed() == 0 {
        findings
            .warnings
            .push("Patch does not change any lines".to_string());
    }

    let described = patch
        .breaking_change_description
        .as_deref()
        .is_some_and(|d| !d.trim().is_empty());
    if patch.breaking_changes && !described {
        findings
            .warnings
            .push("Breaking change is not described".to_string());
    }

    findings
}
