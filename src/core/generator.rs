use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{EngineError, Result};
use super::model::{AiFollower, Interaction, Post};
use super::thread::ThreadTree;

/// What a follower decided to do with a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Decision {
    Like,
    Comment {
        content: String,
    },
    Reply {
        #[serde(rename = "parentId")]
        parent_id: String,
        content: String,
    },
    /// The follower chose not to respond. Still a successful outcome.
    Skip,
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Like => "like",
            Decision::Comment { .. } => "comment",
            Decision::Reply { .. } => "reply",
            Decision::Skip => "skip",
        }
    }
}

/// Everything the generator sees about the conversation so far.
#[derive(Debug, Clone)]
pub struct ThreadContext {
    pub tree: ThreadTree,
    /// The interaction that caused this response to be scheduled, if any.
    pub trigger: Option<Interaction>,
}

impl ThreadContext {
    pub fn new(tree: ThreadTree, trigger: Option<Interaction>) -> Self {
        Self { tree, trigger }
    }

    /// Plain-text rendering of the thread, one line per interaction, indented by depth.
    pub fn transcript(&self, follower_name_for: impl Fn(&str) -> String) -> String {
        let mut out = String::new();
        for entry in self.tree.walk() {
            let who = match entry.interaction.author.follower_id() {
                Some(id) => follower_name_for(id),
                None => format!("user:{}", entry.interaction.author.id()),
            };
            let body = entry.interaction.content.as_deref().unwrap_or("");
            out.push_str(&"  ".repeat(entry.depth));
            out.push_str(&format!(
                "[{}] {} ({}): {}\n",
                entry.interaction.id,
                who,
                entry.interaction.interaction_type.as_str(),
                body
            ));
        }
        out
    }
}

/// Boundary to the generative-content provider.
///
/// Implementations return `EngineError::GeneratorError` for provider failures;
/// a `Decision::Skip` is reserved for the follower genuinely choosing silence.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(
        &self,
        post: &Post,
        follower: &AiFollower,
        context: &ThreadContext,
    ) -> Result<Decision>;
}

/// Parse a model reply into a decision, tolerating code fences and chatter around the JSON.
pub fn parse_decision(raw: &str) -> Result<Decision> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &raw[s..=e],
        _ => {
            return Err(EngineError::GeneratorError(format!(
                "no JSON object in model reply: {}",
                truncate(raw, 120)
            )))
        }
    };

    let decision: Decision = serde_json::from_str(json).map_err(|e| {
        EngineError::GeneratorError(format!("unparseable decision ({}): {}", e, truncate(json, 120)))
    })?;

    match &decision {
        Decision::Comment { content } | Decision::Reply { content, .. } if content.trim().is_empty() => {
            Err(EngineError::GeneratorError(format!(
                "{} decision with empty content",
                decision.label()
            )))
        }
        _ => Ok(decision),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}
