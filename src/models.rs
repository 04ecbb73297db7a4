use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    LocalDb,
    Exophase,
    Internal,
}

#[derive(Debug, Serialize)]
pub struct Meta {
    pub version: &'static str,
    pub source: DataSource,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub meta: Meta,
    pub error: Option<ErrorBody>,
}

/// The two free-form strings the pipeline needs. Empty values are allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub handle: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Game {
    pub id: String,
    pub title: String,
    pub trophy_count: u32,
    pub details: String,
    pub image: String,
    pub playtime_min: u32,
    pub url: String,
}

/// Earned-list response from the public player API.
#[derive(Debug, Deserialize)]
pub struct EarnedResponse {
    pub success: bool,
    #[serde(default)]
    pub list: Vec<AchievementStub>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AchievementStub {
    #[serde(rename = "awardid", deserialize_with = "string_or_number")]
    pub award_id: String,
    pub slug: String,
    pub timestamp: f64,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Achievement {
    pub id: String,
    pub game_id: String,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub earned_at: DateTime<Utc>,
}

/// Result of the detail-page scrape for one stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AchievementDetails {
    pub description: String,
    pub icon: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Partial { dropped: usize, reasons: Vec<String> },
    Failed { reason: String },
    Skipped { reason: String },
}

impl StepOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GameReport {
    pub game_id: String,
    pub earned: usize,
    pub outcome: StepOutcome,
}

/// Per-step result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run: u64,
    pub user_id: Option<String>,
    pub profile: StepOutcome,
    pub games: Option<StepOutcome>,
    pub achievements: Vec<GameReport>,
}

impl PipelineReport {
    pub fn new(run: u64) -> Self {
        Self {
            run,
            user_id: None,
            profile: StepOutcome::Skipped {
                reason: "not started".to_string(),
            },
            games: None,
            achievements: Vec::new(),
        }
    }

    /// True when the run stopped before the game list was available.
    pub fn is_terminal_failure(&self) -> bool {
        self.profile.is_failure() || self.games.as_ref().is_some_and(StepOutcome::is_failure)
    }
}

/// Published view of the aggregator state.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub run: u64,
    pub loading: bool,
    pub finished: bool,
    pub games: Vec<Game>,
    pub achievements: Vec<Achievement>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            run: 0,
            loading: true,
            finished: false,
            games: Vec::new(),
            achievements: Vec::new(),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(i) => i.to_string(),
    })
}
