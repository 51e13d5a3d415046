use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use super::error::EngineError;

pub fn new_id() -> String {
    Ulid::new().to_string()
}

/// How quickly a follower tends to react to new content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Responsiveness {
    Instant,
    Active,
    Casual,
    Zen,
}

impl Responsiveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Responsiveness::Instant => "instant",
            Responsiveness::Active => "active",
            Responsiveness::Casual => "casual",
            Responsiveness::Zen => "zen",
        }
    }
}

impl fmt::Display for Responsiveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Responsiveness {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "instant" => Ok(Responsiveness::Instant),
            "active" => Ok(Responsiveness::Active),
            "casual" => Ok(Responsiveness::Casual),
            "zen" => Ok(Responsiveness::Zen),
            _ => Err(EngineError::Parse(format!("unknown responsiveness: {}", s))),
        }
    }
}

/// Reply delay bounds in minutes, both inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: u32,
    pub max: u32,
}

impl DelayRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionPreferences {
    #[serde(default)]
    pub likes: Vec<String>,
    #[serde(default)]
    pub dislikes: Vec<String>,
}

/// An AI persona that reacts to posts in the circles it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiFollower {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub personality: String,
    pub avatar_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub communication_style: Option<String>,
    #[serde(default)]
    pub interaction_preferences: InteractionPreferences,
    pub active: bool,
    pub responsiveness: Responsiveness,
    /// Explicit override of the responsiveness class range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_delay: Option<DelayRange>,
    /// Percent chance (0..=100) of reacting to a given piece of content.
    pub response_chance: u8,
    pub created_at: DateTime<Utc>,
}

impl AiFollower {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        personality: impl Into<String>,
        responsiveness: Responsiveness,
        response_chance: u8,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            user_id: user_id.into(),
            name: name.into(),
            personality: personality.into(),
            avatar_url: String::new(),
            background: None,
            interests: Vec::new(),
            communication_style: None,
            interaction_preferences: InteractionPreferences::default(),
            active: true,
            responsiveness,
            response_delay: None,
            response_chance,
            created_at: now,
        }
    }

    pub fn with_delay(mut self, min: u32, max: u32) -> Self {
        self.response_delay = Some(DelayRange::new(min, max));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Circle {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Circle {
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            owner_id: owner_id.into(),
            name: name.into(),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    /// Lab draft not yet published.
    Pending,
    Posted,
    /// Every scheduled response has been resolved.
    Completed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Posted => "posted",
            PostStatus::Completed => "completed",
        }
    }
}

impl FromStr for PostStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PostStatus::Pending),
            "posted" => Ok(PostStatus::Posted),
            "completed" => Ok(PostStatus::Completed),
            _ => Err(EngineError::Parse(format!("unknown post status: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub user_id: String,
    /// `None` means the post is visible to all of the author's followers.
    pub circle_id: Option<String>,
    pub lab_id: Option<String>,
    pub content: String,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
}

impl Post {
    pub fn new(
        user_id: impl Into<String>,
        circle_id: Option<String>,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            user_id: user_id.into(),
            circle_id,
            lab_id: None,
            content: content.into(),
            status: PostStatus::Posted,
            created_at: now,
        }
    }

    pub fn draft(
        lab_id: impl Into<String>,
        user_id: impl Into<String>,
        circle_id: Option<String>,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            lab_id: Some(lab_id.into()),
            status: PostStatus::Pending,
            ..Self::new(user_id, circle_id, content, now)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabStatus {
    Draft,
    Active,
    Completed,
}

impl LabStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabStatus::Draft => "draft",
            LabStatus::Active => "active",
            LabStatus::Completed => "completed",
        }
    }
}

impl FromStr for LabStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(LabStatus::Draft),
            "active" => Ok(LabStatus::Active),
            "completed" => Ok(LabStatus::Completed),
            _ => Err(EngineError::Parse(format!("unknown lab status: {}", s))),
        }
    }
}

/// Experiment wrapper holding draft posts that get published in one burst.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lab {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub status: LabStatus,
    pub created_at: DateTime<Utc>,
}

impl Lab {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            user_id: user_id.into(),
            name: name.into(),
            status: LabStatus::Draft,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionType {
    Like,
    Comment,
    Reply,
}

impl InteractionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionType::Like => "like",
            InteractionType::Comment => "comment",
            InteractionType::Reply => "reply",
        }
    }
}

impl FromStr for InteractionType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "like" => Ok(InteractionType::Like),
            "comment" => Ok(InteractionType::Comment),
            "reply" => Ok(InteractionType::Reply),
            _ => Err(EngineError::Parse(format!("unknown interaction type: {}", s))),
        }
    }
}

/// Who wrote an interaction. Exactly one kind of author per row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Author {
    Ai {
        #[serde(rename = "followerId")]
        follower_id: String,
    },
    Human {
        #[serde(rename = "userId")]
        user_id: String,
    },
}

impl Author {
    pub fn kind(&self) -> &'static str {
        match self {
            Author::Ai { .. } => "ai",
            Author::Human { .. } => "human",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Author::Ai { follower_id } => follower_id,
            Author::Human { user_id } => user_id,
        }
    }

    pub fn from_parts(kind: &str, id: String) -> Result<Self, EngineError> {
        match kind {
            "ai" => Ok(Author::Ai { follower_id: id }),
            "human" => Ok(Author::Human { user_id: id }),
            _ => Err(EngineError::Parse(format!("unknown author kind: {}", kind))),
        }
    }

    pub fn follower_id(&self) -> Option<&str> {
        match self {
            Author::Ai { follower_id } => Some(follower_id),
            Author::Human { .. } => None,
        }
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, Author::Ai { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub id: String,
    pub post_id: String,
    pub author: Author,
    #[serde(rename = "type")]
    pub interaction_type: InteractionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Interaction {
    pub fn new(
        post_id: impl Into<String>,
        author: Author,
        interaction_type: InteractionType,
        content: Option<String>,
        parent_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            post_id: post_id.into(),
            author,
            interaction_type,
            content,
            parent_id,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Dispatched,
    Failed,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Dispatched => "dispatched",
            PendingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PendingStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PendingStatus::Pending),
            "dispatched" => Ok(PendingStatus::Dispatched),
            "failed" => Ok(PendingStatus::Failed),
            _ => Err(EngineError::Parse(format!("unknown pending status: {}", s))),
        }
    }
}

/// A committed intent for one follower to react to one post.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResponse {
    pub id: String,
    pub post_id: String,
    pub follower_id: String,
    /// Interaction whose creation scheduled this response, if any.
    pub trigger_id: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: PendingStatus,
    /// Generator attempts that have failed so far.
    pub attempts: u32,
    pub stale_retries: u32,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Materialized,
    Skipped,
    DuplicateLike,
    /// Replaced by a newer pending row for the same pair.
    Superseded,
    /// The post disappeared while the response was in flight.
    Orphaned,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Materialized => "materialized",
            DispatchOutcome::Skipped => "skipped",
            DispatchOutcome::DuplicateLike => "duplicate_like",
            DispatchOutcome::Superseded => "superseded",
            DispatchOutcome::Orphaned => "orphaned",
        }
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchOutcome {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "materialized" => Ok(DispatchOutcome::Materialized),
            "skipped" => Ok(DispatchOutcome::Skipped),
            "duplicate_like" => Ok(DispatchOutcome::DuplicateLike),
            "superseded" => Ok(DispatchOutcome::Superseded),
            "orphaned" => Ok(DispatchOutcome::Orphaned),
            _ => Err(EngineError::Parse(format!("unknown dispatch outcome: {}", s))),
        }
    }
}

/// Archived record of a finalized pending response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRecord {
    pub pending_id: String,
    pub post_id: String,
    pub follower_id: String,
    pub outcome: DispatchOutcome,
    pub interaction_id: Option<String>,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}
