//! Bidirectional YAML/JSON conversion for the plan document.
//!
//! The parser accepts both serializations and the writer preserves whichever
//! one the source used, so a caller's plan file round-trips through this
//! module without drifting between formats.

use super::model::Plan;
use crate::error::RalphError;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    fn sniff(source: &str) -> Self {
        match source.trim_start().chars().next() {
            Some('{') | Some('[') => Format::Json,
            _ => Format::Yaml,
        }
    }
}

/// Parses `source` into a `Plan`, detecting whether it is YAML or JSON.
///
/// Rejects documents whose root is not a mapping, whose `version` is absent
/// or not a positive integer, or whose `stories` (if present) is not a
/// sequence. Detects duplicate story ids.
pub fn parse(source: &str, path: &Path) -> Result<(Plan, Format), RalphError> {
    let format = Format::sniff(source);
    let invalid = |message: String| RalphError::InvalidPlan {
        path: path.to_path_buf(),
        message,
    };

    let value: serde_yaml::Value =
        serde_yaml::from_str(source).map_err(|e| invalid(format!("not valid YAML/JSON: {e}")))?;

    let mapping = value
        .as_mapping()
        .ok_or_else(|| invalid("root of plan document must be a mapping".to_string()))?;

    let version_key = serde_yaml::Value::String("version".to_string());
    match mapping.get(&version_key) {
        Some(v) if v.as_u64().map(|n| n > 0).unwrap_or(false) => {}
        Some(_) => return Err(invalid("`version` must be a positive integer".to_string())),
        None => return Err(invalid("`version` is required".to_string())),
    }

    let stories_key = serde_yaml::Value::String("stories".to_string());
    if let Some(stories) = mapping.get(&stories_key) {
        if !stories.is_sequence() {
            return Err(invalid("`stories` must be a sequence".to_string()));
        }
    }

    let plan: Plan = serde_yaml::from_value(value.clone())
        .map_err(|e| invalid(format!("failed to deserialize plan: {e}")))?;

    let mut seen = std::collections::HashSet::new();
    for story in &plan.stories {
        if !seen.insert(story.id.clone()) {
            return Err(invalid(format!("duplicate story id: {}", story.id)));
        }
    }

    Ok((plan, format))
}

/// Serializes `plan` back into `format`, preserving declared ordering.
pub fn write(plan: &Plan, format: Format) -> Result<String, RalphError> {
    let io_err = |e: String| RalphError::Io {
        context: "serializing plan".to_string(),
        message: e,
    };
    match format {
        Format::Yaml => serde_yaml::to_string(plan).map_err(|e| io_err(e.to_string())),
        Format::Json => {
            serde_json::to_string_pretty(plan).map_err(|e| io_err(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn parses_minimal_yaml_plan() {
        let yaml = r#"
version: 1
project: demo
stories:
  - id: US-001
    title: Do the thing
"#;
        let (plan, format) = parse(yaml, &p("plan.yaml")).unwrap();
        assert_eq!(format, Format::Yaml);
        assert_eq!(plan.stories.len(), 1);
        assert_eq!(plan.stories[0].status, super::super::model::StoryStatus::Open);
    }

    #[test]
    fn parses_json_plan_and_detects_format() {
        let json = r#"{"version":1,"project":"demo","stories":[]}"#;
        let (plan, format) = parse(json, &p("plan.json")).unwrap();
        assert_eq!(format, Format::Json);
        assert_eq!(plan.project, "demo");
    }

    #[test]
    fn rejects_missing_version() {
        let yaml = "project: demo\nstories: []\n";
        let err = parse(yaml, &p("plan.yaml")).unwrap_err();
        assert!(matches!(err, RalphError::InvalidPlan { .. }));
    }

    #[test]
    fn rejects_non_mapping_root() {
        let yaml = "- 1\n- 2\n";
        assert!(parse(yaml, &p("plan.yaml")).is_err());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let yaml = r#"
version: 1
project: demo
stories:
  - id: US-001
    title: First
  - id: US-001
    title: Second
"#;
        let err = parse(yaml, &p("plan.yaml")).unwrap_err();
        match err {
            RalphError::InvalidPlan { message, .. } => assert!(message.contains("US-001")),
            _ => panic!("wrong error kind"),
        }
    }

    #[test]
    fn round_trips_yaml() {
        let yaml = r#"
version: 1
project: demo
goals:
  - ship it
stories:
  - id: US-001
    title: Do the thing
    dependsOn: []
"#;
        let (plan, format) = parse(yaml, &p("plan.yaml")).unwrap();
        let written = write(&plan, format).unwrap();
        let (reparsed, _) = parse(&written, &p("plan.yaml")).unwrap();
        assert_eq!(reparsed.stories[0].id, plan.stories[0].id);
        assert_eq!(reparsed.goals, plan.goals);
    }
}
