//! Substitutes named placeholders in a prompt template.
//!
//! Structurally grounded on the teacher's XML prompt builder: named
//! sections assembled in a fixed order, with a dedicated function for each
//! formatted block rather than ad-hoc string concatenation at the call
//! site.

use crate::plan::{Plan, Story};
use std::collections::BTreeMap;

/// Substitutes every occurrence of `{{NAME}}` with `variables[NAME]`'s
/// stringified value. Unknown placeholders are left verbatim.
// `find` returns the byte offset of an ASCII `{{`/`}}` match, always a char
// boundary, so slicing at those offsets is safe.
#[allow(clippy::string_slice)]
pub fn render(template: &str, variables: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = &after[..end];
                match variables.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("{{");
                        out.push_str(name);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Formats the pre-formatted Markdown block for a story: id, title, status,
/// deps, description, acceptance-criteria checklist.
pub fn story_block(story: &Story) -> String {
    let mut lines = vec![
        format!("### {}: {}", story.id, story.title),
        format!("- Status: {:?}", story.status),
    ];
    if story.depends_on.is_empty() {
        lines.push("- Depends on: (none)".to_string());
    } else {
        lines.push(format!("- Depends on: {}", story.depends_on.join(", ")));
    }
    if let Some(description) = &story.description {
        lines.push(String::new());
        lines.push(description.clone());
    }
    if !story.acceptance_criteria.is_empty() {
        lines.push(String::new());
        lines.push("Acceptance criteria:".to_string());
        for criterion in &story.acceptance_criteria {
            lines.push(format!("- [ ] {}", criterion));
        }
    }
    lines.join("\n")
}

/// Formats the plan's quality gates as a Markdown bullet list, or
/// `- (none)` if there are none.
pub fn quality_gates_block(plan: &Plan) -> String {
    if plan.quality_gates.is_empty() {
        "- (none)".to_string()
    } else {
        plan.quality_gates
            .iter()
            .map(|g| format!("- {}", g))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
