//! Schedule-page classifier adapter for schedwatch.
//!
//! Wraps an OpenAI-compatible chat-completions oracle behind the
//! [`ScheduleOracle`] trait. The adapter owns three responsibilities: bound
//! what the oracle sees (markup-stripped, truncated content projection),
//! parse its free-text reply by locating each field marker independently,
//! and contain every oracle failure as a degraded result so a check cycle
//! can still persist a snapshot.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use schedwatch_core::GameEntry;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

pub const CRATE_NAME: &str = "schedwatch-oracle";

/// Character budget for the content projection handed to the oracle.
pub const CONTENT_CHAR_BUDGET: usize = 8_000;

const TRUNCATION_MARKER: &str = "... [truncated]";

const SYSTEM_PROMPT: &str =
    "You are an expert at analyzing sports tournament schedule web pages.";

/// Classifier verdict for one check cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleAnalysis {
    pub schedule_available: bool,
    pub schedule_changed: bool,
    pub summary: String,
    pub games: Option<Vec<GameEntry>>,
}

impl ScheduleAnalysis {
    /// Substitute verdict when the oracle is unreachable or unreadable.
    /// The failure reason lands in the summary so it is visible in history.
    pub fn degraded(reason: impl std::fmt::Display) -> Self {
        Self {
            schedule_available: false,
            schedule_changed: false,
            summary: format!("Error analyzing schedule: {reason}"),
            games: None,
        }
    }
}

/// Content-understanding oracle. `analyze` never fails past this boundary:
/// oracle trouble degrades into a result the pipeline can persist.
/// `schedule_changed` is always false when `previous` is absent.
#[async_trait]
pub trait ScheduleOracle: Send + Sync {
    async fn analyze(&self, current: &str, previous: Option<&str>) -> ScheduleAnalysis;
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("oracle http status {status}")]
    Status { status: u16 },
    #[error("malformed oracle reply: {0}")]
    MalformedReply(String),
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// Base URL including the API version segment, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Chat-completions client speaking the OpenAI wire format.
#[derive(Debug)]
pub struct OpenAiOracle {
    client: reqwest::Client,
    config: OracleConfig,
}

impl OpenAiOracle {
    pub fn new(config: OracleConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building oracle http client")?;
        Ok(Self { client, config })
    }

    async fn request_reply(&self, prompt: String) -> Result<String, OracleError> {
        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.3,
            "max_tokens": 1000
        });

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(OracleError::Status {
                status: status.as_u16(),
            });
        }

        let value: serde_json::Value = resp.json().await?;
        value
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                OracleError::MalformedReply("missing choices[0].message.content".to_string())
            })
    }
}

#[async_trait]
impl ScheduleOracle for OpenAiOracle {
    async fn analyze(&self, current: &str, previous: Option<&str>) -> ScheduleAnalysis {
        let is_first_check = previous.is_none();
        let prompt = match previous {
            Some(prev) => change_detection_prompt(
                &condense_content(current),
                &condense_content(prev),
            ),
            None => initial_check_prompt(&condense_content(current)),
        };

        match self.request_reply(prompt).await {
            Ok(reply) => parse_reply(&reply, is_first_check),
            Err(err) => {
                error!(error = %err, "oracle call failed");
                ScheduleAnalysis::degraded(err)
            }
        }
    }
}

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b.*?</script>").expect("valid regex"));
static STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b.*?</style>").expect("valid regex"));

/// Size-bounded, markup-stripped projection of page content: script/style
/// blocks removed, whitespace collapsed, truncated to the character budget
/// with an explicit marker.
pub fn condense_content(content: &str) -> String {
    let stripped = SCRIPT_RE.replace_all(content, " ");
    let stripped = STYLE_RE.replace_all(&stripped, " ");
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    match collapsed.char_indices().nth(CONTENT_CHAR_BUDGET) {
        Some((byte_idx, _)) => format!("{}{}", &collapsed[..byte_idx], TRUNCATION_MARKER),
        None => collapsed,
    }
}

fn initial_check_prompt(content: &str) -> String {
    format!(
        "Analyze this web page content to determine if it contains an ACTUAL sports \
tournament schedule with real game information.

A schedule is ONLY available if you can see:
- Specific game times (like \"10:00 AM\", \"2:30 PM\")
- Specific game dates
- Team matchups (Team A vs Team B)
- Field/venue assignments

A schedule is NOT available if:
- You see messages like \"not released yet\", \"coming soon\", \"check back later\"
- There are only team lists without game times or matchups
- The page shows pools/brackets but no actual game schedule
- Only placeholders or \"TBD\" entries exist

Be STRICT: when in doubt, answer NO. Only say YES if you can clearly see actual \
game times and dates.

Web page content:
{content}

Respond in this exact format:
SCHEDULE_AVAILABLE: [YES or NO]
SUMMARY: [A brief 2-3 sentence summary. If YES, mention how many games you found. \
If NO, explain what is missing or what message you see instead.]

GAMES_JSON: [If SCHEDULE_AVAILABLE is YES, provide a JSON array of games. Each game \
should have: \"date\", \"time\", \"team1\" (or \"home\"), \"team2\" (or \"away\" or \
\"opponent\"), \"location\" (field/venue). If NO, return empty array []]"
    )
}

fn change_detection_prompt(current: &str, previous: &str) -> String {
    format!(
        "Compare these two versions of a sports tournament schedule web page to detect \
meaningful changes.

IMPORTANT: a schedule is ONLY available if it shows actual game times, dates, and \
matchups. Messages like \"not released yet\" or \"coming soon\" mean NO schedule.

Look for changes in:
- Game times or dates being added, removed, or changed
- Team matchups being updated
- Field/venue assignments changing
- New games appearing in the schedule
- The schedule going from \"not released\" to showing actual games

Ignore minor changes like:
- Timestamps or \"last updated\" text
- Advertisement content
- Navigation or footer changes
- Team lists if no game schedules are present

PREVIOUS VERSION:
{previous}

CURRENT VERSION:
{current}

Respond in this exact format:
SCHEDULE_AVAILABLE: [YES or NO - can you see actual game times and dates in the \
CURRENT version?]
SCHEDULE_CHANGED: [YES or NO - did the actual schedule information change \
meaningfully?]
SUMMARY: [A brief 2-3 sentence summary of what changed or why nothing did. Mention \
how many games are in the current schedule.]

GAMES_JSON: [If SCHEDULE_AVAILABLE is YES, provide a JSON array of ALL games from \
the CURRENT version. Each game should have: \"date\", \"time\", \"team1\" (or \
\"home\"), \"team2\" (or \"away\" or \"opponent\"), \"location\" (field/venue). If \
NO, return empty array []]"
    )
}

static AVAILABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)SCHEDULE_AVAILABLE:\s*(YES|NO)").expect("valid regex"));
static CHANGED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)SCHEDULE_CHANGED:\s*(YES|NO)").expect("valid regex"));
static SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)SUMMARY:\s*(.+?)(?:\n\n|\z)").expect("valid regex"));
static GAMES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)GAMES_JSON:\s*(\[.*?\])").expect("valid regex"));

/// Locate each expected field independently in the oracle's reply; the
/// oracle is allowed to wrap them in extra prose. Every field defaults on
/// absence, and `schedule_changed` is forced false on a first check.
pub fn parse_reply(reply: &str, is_first_check: bool) -> ScheduleAnalysis {
    let yes = |re: &Regex| {
        re.captures(reply)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().eq_ignore_ascii_case("YES"))
            .unwrap_or(false)
    };

    let schedule_available = yes(&AVAILABLE_RE);
    let schedule_changed = if is_first_check { false } else { yes(&CHANGED_RE) };

    let summary = SUMMARY_RE
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| reply.trim().to_string());

    let games = GAMES_RE
        .captures(reply)
        .and_then(|c| c.get(1))
        .and_then(|m| match serde_json::from_str::<Vec<GameEntry>>(m.as_str()) {
            Ok(games) => Some(games),
            Err(err) => {
                warn!(error = %err, "failed to parse GAMES_JSON");
                None
            }
        });

    ScheduleAnalysis {
        schedule_available,
        schedule_changed,
        summary,
        games,
    }
}
