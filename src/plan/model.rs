//! Typed representation of the plan document.

use serde::{Deserialize, Serialize};

/// Status of an individual story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Open,
    InProgress,
    Done,
    Blocked,
}

impl Default for StoryStatus {
    fn default() -> Self {
        StoryStatus::Open
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: StoryStatus,
    #[serde(rename = "dependsOn", default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "acceptanceCriteria", default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(rename = "startedAt", default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(rename = "completedAt", default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub version: u32,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(rename = "nonGoals", default)]
    pub non_goals: Vec<String>,
    #[serde(rename = "qualityGates", default)]
    pub quality_gates: Vec<String>,
    #[serde(default)]
    pub stories: Vec<Story>,
}

impl Plan {
    /// Returns the story with the given id, if present.
    pub fn story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    /// Returns a mutable reference to the story with the given id, if present.
    pub fn story_mut(&mut self, id: &str) -> Option<&mut Story> {
        self.stories.iter_mut().find(|s| s.id == id)
    }

    /// Whether the given story id names a `done` story in this plan.
    pub fn is_done(&self, id: &str) -> bool {
        self.story(id)
            .map(|s| s.status == StoryStatus::Done)
            .unwrap_or(false)
    }
}
