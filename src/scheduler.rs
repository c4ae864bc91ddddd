//! Selects the next actionable story under dependency, status, and
//! staleness rules.

use crate::plan::{Plan, StoryStatus};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Selects the next actionable story, or `None` if no candidate survives
/// (a terminal condition for the loop: `no_actionable_stories`).
pub fn select_next(
    plan: &Plan,
    now: DateTime<Utc>,
    stale_seconds: i64,
    ignore_story_ids: &HashSet<String>,
) -> Option<String> {
    let dependencies_satisfied = |ids: &[String]| ids.iter().all(|dep| plan.is_done(dep));

    let candidates: Vec<&crate::plan::Story> = plan
        .stories
        .iter()
        .filter(|s| matches!(s.status, StoryStatus::Open | StoryStatus::InProgress))
        .filter(|s| !ignore_story_ids.contains(&s.id))
        .filter(|s| dependencies_satisfied(&s.depends_on))
        .collect();

    if candidates.is_empty() {
        return None;
    }

    let is_stale = |s: &crate::plan::Story| -> bool {
        if stale_seconds == 0 {
            return true;
        }
        match s.updated_at.as_deref().and_then(|t| t.parse::<DateTime<Utc>>().ok()) {
            Some(updated) => (now - updated).num_seconds() > stale_seconds,
            None => true,
        }
    };

    let stale_in_progress: Vec<&crate::plan::Story> = candidates
        .iter()
        .filter(|s| s.status == StoryStatus::InProgress && is_stale(s))
        .copied()
        .collect();

    let pool = if !stale_in_progress.is_empty() {
        stale_in_progress
    } else {
        candidates
    };

    // Declared plan order; `pool` was built by filtering `plan.stories` in
    // order so the first element already respects the tiebreak.
    pool.into_iter()
        .min_by_key(|s| plan.stories.iter().position(|p| p.id == s.id))
        .map(|s| s.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Story;

    fn story(id: &str, status: StoryStatus, deps: &[&str]) -> Story {
        Story {
            id: id.to_string(),
            title: id.to_string(),
            status,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            description: None,
            acceptance_criteria: vec![],
            started_at: None,
            completed_at: None,
            updated_at: None,
        }
    }

    fn plan(stories: Vec<Story>) -> Plan {
        Plan {
            version: 1,
            project: "demo".into(),
            overview: None,
            goals: vec![],
            non_goals: vec![],
            quality_gates: vec![],
            stories,
        }
    }

    #[test]
    fn selects_first_open_story_in_declared_order() {
        let p = plan(vec![
            story("US-002", StoryStatus::Open, &[]),
            story("US-001", StoryStatus::Open, &[]),
        ]);
        let id = select_next(&p, Utc::now(), 60, &HashSet::new()).unwrap();
        assert_eq!(id, "US-002");
    }

    #[test]
    fn dependency_ordering_selects_dependency_first() {
        let mut done_dep = story("US-001", StoryStatus::Open, &[]);
        done_dep.status = StoryStatus::Open;
        let p = plan(vec![
            story("US-002", StoryStatus::Open, &["US-001"]),
            story("US-001", StoryStatus::Open, &[]),
        ]);
        let id = select_next(&p, Utc::now(), 60, &HashSet::new()).unwrap();
        assert_eq!(id, "US-001");
    }

    #[test]
    fn cyclic_dependencies_yield_no_candidate() {
        let p = plan(vec![
            story("US-001", StoryStatus::Open, &["US-002"]),
            story("US-002", StoryStatus::Open, &["US-001"]),
        ]);
        assert!(select_next(&p, Utc::now(), 60, &HashSet::new()).is_none());
    }

    #[test]
    fn ignore_set_excludes_story() {
        let p = plan(vec![story("US-001", StoryStatus::Open, &[])]);
        let mut ignore = HashSet::new();
        ignore.insert("US-001".to_string());
        assert!(select_next(&p, Utc::now(), 60, &ignore).is_none());
    }

    #[test]
    fn missing_dependency_disqualifies_story() {
        let p = plan(vec![story("US-001", StoryStatus::Open, &["US-999"])]);
        assert!(select_next(&p, Utc::now(), 60, &HashSet::new()).is_none());
    }

    #[test]
    fn stale_seconds_zero_reclaims_immediately() {
        let mut s = story("US-001", StoryStatus::InProgress, &[]);
        s.updated_at = Some(Utc::now().to_rfc3339());
        let p = plan(vec![s]);
        let id = select_next(&p, Utc::now(), 0, &HashSet::new()).unwrap();
        assert_eq!(id, "US-001");
    }

    #[test]
    fn fresh_in_progress_not_preferred_over_nothing_else() {
        let mut s = story("US-001", StoryStatus::InProgress, &[]);
        s.updated_at = Some(Utc::now().to_rfc3339());
        let p = plan(vec![s]);
        // Still selectable: in_progress is a valid candidate status even if
        // not stale, it's simply not preferred over a *stale* in_progress
        // candidate when both exist.
        assert!(select_next(&p, Utc::now(), 3600, &HashSet::new()).is_some());
    }
}
