use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Open,
    InProgress,
    Blocked,
    Closed,
    Tombstone,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Blocked => write!(f, "blocked"),
            Self::Closed => write!(f, "closed"),
            Self::Tombstone => write!(f, "tombstone"),
        }
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "closed" => Ok(Self::Closed),
            "tombstone" => Ok(Self::Tombstone),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum IssueType {
    Bug,
    Feature,
    #[default]
    Task,
    Epic,
    Chore,
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bug => write!(f, "bug"),
            Self::Feature => write!(f, "feature"),
            Self::Task => write!(f, "task"),
            Self::Epic => write!(f, "epic"),
            Self::Chore => write!(f, "chore"),
        }
    }
}

impl std::str::FromStr for IssueType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bug" => Ok(Self::Bug),
            "feature" => Ok(Self::Feature),
            "task" => Ok(Self::Task),
            "epic" => Ok(Self::Epic),
            "chore" => Ok(Self::Chore),
            other => Err(format!("unknown issue type '{other}'")),
        }
    }
}

/// Dependency relationship kinds. `blocked-by` is accepted at the API
/// boundary and normalized into the inverse `blocks` edge; it is never
/// stored.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
#[clap(rename_all = "kebab-case")]
pub enum Relationship {
    #[default]
    Blocks,
    Related,
    DiscoveredFrom,
}

impl std::fmt::Display for Relationship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocks => write!(f, "blocks"),
            Self::Related => write!(f, "related"),
            Self::DiscoveredFrom => write!(f, "discovered-from"),
        }
    }
}

impl std::str::FromStr for Relationship {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "blocks" => Ok(Self::Blocks),
            "related" => Ok(Self::Related),
            "discovered-from" => Ok(Self::DiscoveredFrom),
            other => Err(format!("unknown relationship '{other}'")),
        }
    }
}

/// A single unit of work. Stored in the `beads` projection and replicated
/// through the JSONL sync layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bead {
    pub id: String,
    pub project_key: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub issue_type: IssueType,
    pub priority: u8,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_touched: Vec<String>,
}

impl Bead {
    /// Stable hash of the semantic fields. Timestamps and sync bookkeeping
    /// are excluded so replicas that agree on content agree on the hash.
    pub fn compute_content_hash(&self) -> String {
        content_hash_of(
            &self.title,
            self.description.as_deref(),
            self.issue_type,
            self.priority,
            self.status,
            self.parent_id.as_deref(),
            self.assignee.as_deref(),
        )
    }
}

pub fn content_hash_of(
    title: &str,
    description: Option<&str>,
    issue_type: IssueType,
    priority: u8,
    status: Status,
    parent_id: Option<&str>,
    assignee: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0]);
    hasher.update(description.unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(issue_type.to_string().as_bytes());
    hasher.update([0]);
    hasher.update([priority]);
    hasher.update([0]);
    hasher.update(status.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(parent_id.unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(assignee.unwrap_or("").as_bytes());
    let digest = hasher.finalize();
    // First 16 bytes are plenty for change detection.
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// Generate a fresh bead id: `bd-` plus the first 8 hex chars of a UUID.
pub fn new_bead_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("bd-{}", &uuid[..8])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BeadDependency {
    pub bead_id: String,
    pub depends_on_id: String,
    pub relationship: Relationship,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub bead_id: String,
    pub author: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_comment_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub project_key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub project_key: String,
    pub sender: String,
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_by: Vec<String>,
}

/// A time-bounded lease an agent holds over a path pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: i64,
    pub project_key: String,
    pub agent: String,
    pub file_glob: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum DecisionType {
    StrategySelection,
    WorkerSpawn,
    ReviewDecision,
    FileSelection,
    ScopeChange,
}

impl std::fmt::Display for DecisionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrategySelection => write!(f, "strategy_selection"),
            Self::WorkerSpawn => write!(f, "worker_spawn"),
            Self::ReviewDecision => write!(f, "review_decision"),
            Self::FileSelection => write!(f, "file_selection"),
            Self::ScopeChange => write!(f, "scope_change"),
        }
    }
}

impl std::str::FromStr for DecisionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "strategy_selection" => Ok(Self::StrategySelection),
            "worker_spawn" => Ok(Self::WorkerSpawn),
            "review_decision" => Ok(Self::ReviewDecision),
            "file_selection" => Ok(Self::FileSelection),
            "scope_change" => Ok(Self::ScopeChange),
            other => Err(format!("unknown decision type '{other}'")),
        }
    }
}

/// A persisted record of a coordinator/worker decision with its inputs,
/// alternatives, and rationale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub id: String,
    pub decision_type: DecisionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bead_id: Option<String>,
    pub agent_name: String,
    pub project_key: String,
    pub decision: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_gathered: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_evaluated: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternatives: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precedent_cited: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_event_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    #[default]
    Assistant,
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" | "human" => Ok(Self::User),
            "assistant" | "ai" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// A textual memory with optional session provenance. The embedding lives in
/// the `memory_embeddings` virtual table, cascade-deleted with the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub collection: String,
    pub created_at: DateTime<Utc>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_role: Option<MessageRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_idx: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
}

impl Memory {
    /// Minimal memory with defaults for the optional session fields.
    pub fn new(id: impl Into<String>, content: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: None,
            collection: collection.into(),
            created_at: Utc::now(),
            confidence: 1.0,
            tags: Vec::new(),
            agent_type: None,
            session_id: None,
            message_role: None,
            message_idx: None,
            source_path: None,
        }
    }
}

/// One normalized message from an agent session transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub session_id: String,
    pub agent_type: String,
    /// Original 1-based line number in the transcript, so deletions upstream
    /// never shift ids of the surviving messages.
    pub message_idx: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&Status::InProgress).unwrap();
        assert_eq!(json, r#""in_progress""#);
    }

    #[test]
    fn relationship_serializes_kebab_case() {
        let json = serde_json::to_string(&Relationship::DiscoveredFrom).unwrap();
        assert_eq!(json, r#""discovered-from""#);
    }

    #[test]
    fn content_hash_ignores_timestamps() {
        let now = Utc::now();
        let mut bead = Bead {
            id: "bd-1".into(),
            project_key: "/repo".into(),
            title: "Fix the flaky test".into(),
            description: None,
            issue_type: IssueType::Bug,
            priority: 1,
            status: Status::Open,
            parent_id: None,
            assignee: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
            close_reason: None,
            deleted_at: None,
            content_hash: String::new(),
            files_touched: vec![],
        };
        let h1 = bead.compute_content_hash();
        bead.updated_at = now + chrono::Duration::hours(5);
        assert_eq!(h1, bead.compute_content_hash());
        bead.title = "Fix the other flaky test".into();
        assert_ne!(h1, bead.compute_content_hash());
    }

    #[test]
    fn bead_id_has_prefix() {
        let id = new_bead_id();
        assert!(id.starts_with("bd-"));
        assert_eq!(id.len(), 11);
    }

    #[test]
    fn bead_round_trips_json() {
        let now = Utc::now();
        let bead = Bead {
            id: "bd-abc12345".into(),
            project_key: "/repo".into(),
            title: "Test".into(),
            description: Some("desc".into()),
            issue_type: IssueType::Task,
            priority: 2,
            status: Status::Open,
            parent_id: Some("bd-parent00".into()),
            assignee: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
            close_reason: None,
            deleted_at: None,
            content_hash: "deadbeef".into(),
            files_touched: vec!["src/lib.rs".into()],
        };
        let json = serde_json::to_string(&bead).unwrap();
        let parsed: Bead = serde_json::from_str(&json).unwrap();
        assert_eq!(bead, parsed);
    }

    #[test]
    fn minimal_bead_omits_optional_fields() {
        let now = Utc::now();
        let bead = Bead {
            id: "bd-1".into(),
            project_key: "/repo".into(),
            title: "Minimal".into(),
            description: None,
            issue_type: IssueType::Task,
            priority: 2,
            status: Status::Open,
            parent_id: None,
            assignee: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
            close_reason: None,
            deleted_at: None,
            content_hash: "x".into(),
            files_touched: vec![],
        };
        let json = serde_json::to_string(&bead).unwrap();
        assert!(!json.contains("description"));
        assert!(!json.contains("parent_id"));
        assert!(!json.contains("closed_at"));
        assert!(!json.contains("files_touched"));
    }

    #[test]
    fn role_parses_aliases() {
        assert_eq!("human".parse::<MessageRole>().unwrap(), MessageRole::User);
        assert_eq!("ai".parse::<MessageRole>().unwrap(), MessageRole::Assistant);
        assert!("robot".parse::<MessageRole>().is_err());
    }
}
