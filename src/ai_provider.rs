use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::core::{
    parse_decision, AiFollower, Decision, EngineError, Post, ResponseGenerator, Store,
    ThreadContext,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AIProvider {
    OpenAI,
    Ollama,
}

impl std::fmt::Display for AIProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AIProvider::OpenAI => write!(f, "openai"),
            AIProvider::Ollama => write!(f, "ollama"),
        }
    }
}

impl std::str::FromStr for AIProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" | "gpt" => Ok(AIProvider::OpenAI),
            "ollama" => Ok(AIProvider::Ollama),
            _ => Err(anyhow!("Unknown AI provider: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AIConfig {
    pub provider: AIProvider,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Default for AIConfig {
    fn default() -> Self {
        AIConfig {
            provider: AIProvider::Ollama,
            model: "qwen2.5".to_string(),
            api_key: None,
            base_url: Some("http://localhost:11434".to_string()),
            max_tokens: Some(512),
            temperature: Some(0.8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

pub struct AIProviderClient {
    config: AIConfig,
    http_client: reqwest::Client,
}

impl AIProviderClient {
    pub fn new(config: AIConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(AIProviderClient {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &AIConfig {
        &self.config
    }

    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        match self.config.provider {
            AIProvider::OpenAI => self.chat_openai(messages).await,
            AIProvider::Ollama => self.chat_ollama(messages).await,
        }
    }

    fn request_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|msg| {
                serde_json::json!({
                    "role": msg.role,
                    "content": msg.content
                })
            })
            .collect()
    }

    async fn chat_openai(&self, messages: &[ChatMessage]) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| anyhow!("OpenAI API key required"))?;
        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");

        let request_body = serde_json::json!({
            "model": self.config.model,
            "messages": Self::request_messages(messages),
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "response_format": { "type": "json_object" }
        });

        let response = self
            .http_client
            .post(format!("{}/chat/completions", base_url.trim_end_matches('/')))
            .bearer_auth(api_key)
            .json(&request_body)
            .send()
            .await
            .context("OpenAI request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("OpenAI API error {}: {}", status, error_text));
        }

        let response_json: serde_json::Value = response.json().await?;
        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("Invalid OpenAI response format"))?
            .to_string();

        Ok(content)
    }

    async fn chat_ollama(&self, messages: &[ChatMessage]) -> Result<String> {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("http://localhost:11434");

        let request_body = serde_json::json!({
            "model": self.config.model,
            "messages": Self::request_messages(messages),
            "stream": false,
            "format": "json",
            "options": {
                "temperature": self.config.temperature,
                "num_predict": self.config.max_tokens
            }
        });

        let response = self
            .http_client
            .post(format!("{}/api/chat", base_url.trim_end_matches('/')))
            .json(&request_body)
            .send()
            .await
            .context("Ollama request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Ollama API error {}: {}", status, error_text));
        }

        let response_json: serde_json::Value = response.json().await?;
        let content = response_json["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("Invalid Ollama response format"))?
            .to_string();

        Ok(content)
    }
}

/// Persona instructions for one follower.
pub fn build_system_prompt(follower: &AiFollower) -> String {
    let mut prompt = format!(
        "You are {}, a follower on a small social network. Personality: {}.",
        follower.name, follower.personality
    );
    if let Some(background) = &follower.background {
        prompt.push_str(&format!(" Background: {}.", background));
    }
    if !follower.interests.is_empty() {
        prompt.push_str(&format!(" Interests: {}.", follower.interests.join(", ")));
    }
    if let Some(style) = &follower.communication_style {
        prompt.push_str(&format!(" You write in a {} style.", style));
    }
    let prefs = &follower.interaction_preferences;
    if !prefs.likes.is_empty() {
        prompt.push_str(&format!(" You enjoy: {}.", prefs.likes.join(", ")));
    }
    if !prefs.dislikes.is_empty() {
        prompt.push_str(&format!(" You avoid: {}.", prefs.dislikes.join(", ")));
    }

    prompt.push_str(
        "\n\nDecide how to react to the post. Answer with a single JSON object and nothing else, one of:\n\
         {\"type\":\"like\"}\n\
         {\"type\":\"comment\",\"content\":\"...\"}\n\
         {\"type\":\"reply\",\"parentId\":\"<id of an existing comment>\",\"content\":\"...\"}\n\
         {\"type\":\"skip\"}\n\
         Keep comments short and in character. Only reply to ids shown in the thread.",
    );
    prompt
}

/// Post, thread so far, and what prompted this follower to look.
pub fn build_user_prompt(
    post: &Post,
    context: &ThreadContext,
    follower_name_for: impl Fn(&str) -> String,
) -> String {
    let mut prompt = format!("Post by user:{}\n{}\n", post.user_id, post.content);

    if context.tree.is_empty() {
        prompt.push_str("\nNo comments yet.\n");
    } else {
        prompt.push_str("\nThread (ids in brackets, replies indented):\n");
        prompt.push_str(&context.transcript(&follower_name_for));
    }

    if let Some(trigger) = &context.trigger {
        prompt.push_str(&format!(
            "\nYou were drawn in by [{}]: {}\n",
            trigger.id,
            trigger.content.as_deref().unwrap_or("")
        ));
    }
    prompt
}

/// [`ResponseGenerator`] backed by a chat-completion API.
pub struct LlmGenerator {
    client: AIProviderClient,
    store: Store,
}

impl LlmGenerator {
    pub fn new(config: AIConfig, store: Store) -> Result<Self> {
        Ok(Self {
            client: AIProviderClient::new(config)?,
            store,
        })
    }

    fn follower_name(&self, follower_id: &str) -> String {
        self.store
            .get_follower(follower_id)
            .map(|f| f.name)
            .unwrap_or_else(|_| format!("follower:{}", follower_id))
    }
}

#[async_trait]
impl ResponseGenerator for LlmGenerator {
    async fn generate(
        &self,
        post: &Post,
        follower: &AiFollower,
        context: &ThreadContext,
    ) -> crate::core::Result<Decision> {
        let messages = [
            ChatMessage::system(build_system_prompt(follower)),
            ChatMessage::user(build_user_prompt(post, context, |id| self.follower_name(id))),
        ];

        let raw = self
            .client
            .chat(&messages)
            .await
            .map_err(|e| EngineError::GeneratorError(format!("{:#}", e)))?;
        debug!(
            post_id = %post.id,
            follower_id = %follower.id,
            provider = %self.client.config().provider,
            "model replied"
        );

        parse_decision(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Author, Interaction, InteractionType, Responsiveness, ThreadTree};
    use chrono::Utc;

    #[test]
    fn test_provider_from_str() {
        assert_eq!("OpenAI".parse::<AIProvider>().unwrap(), AIProvider::OpenAI);
        assert_eq!("gpt".parse::<AIProvider>().unwrap(), AIProvider::OpenAI);
        assert_eq!("ollama".parse::<AIProvider>().unwrap(), AIProvider::Ollama);
        assert!("claude".parse::<AIProvider>().is_err());
    }

    #[test]
    fn test_system_prompt_carries_persona() {
        let mut follower =
            AiFollower::new("u1", "Noor", "warm and nosy", Responsiveness::Active, 80, Utc::now());
        follower.interests = vec!["gardening".to_string()];
        follower.interaction_preferences.dislikes = vec!["politics".to_string()];

        let prompt = build_system_prompt(&follower);
        assert!(prompt.contains("Noor"));
        assert!(prompt.contains("gardening"));
        assert!(prompt.contains("You avoid: politics"));
        assert!(prompt.contains("\"parentId\""));
    }

    #[test]
    fn test_user_prompt_lists_thread_ids() {
        let post = Post::new("u1", None, "first tomatoes of the year", Utc::now());
        let comment = Interaction::new(
            &post.id,
            Author::Human {
                user_id: "u2".to_string(),
            },
            InteractionType::Comment,
            Some("jealous".to_string()),
            None,
            Utc::now(),
        );
        let tree = ThreadTree::build(&post.id, vec![comment.clone()]);
        let context = ThreadContext::new(tree, Some(comment.clone()));

        let prompt = build_user_prompt(&post, &context, |id| id.to_string());
        assert!(prompt.contains("first tomatoes"));
        assert!(prompt.contains(&format!("[{}]", comment.id)));
        assert!(prompt.contains("You were drawn in by"));
    }

    #[tokio::test]
    async fn test_missing_openai_key_is_generator_error() {
        let store = Store::open_in_memory().unwrap();
        let generator = LlmGenerator::new(
            AIConfig {
                provider: AIProvider::OpenAI,
                model: "gpt-4o-mini".to_string(),
                api_key: None,
                base_url: None,
                max_tokens: None,
                temperature: None,
            },
            store,
        )
        .unwrap();
        let post = Post::new("u1", None, "hello", Utc::now());
        let follower = AiFollower::new("u1", "A", "", Responsiveness::Instant, 100, Utc::now());
        let context = ThreadContext::new(ThreadTree::build(&post.id, Vec::new()), None);

        let err = generator.generate(&post, &follower, &context).await.unwrap_err();
        assert!(matches!(err, EngineError::GeneratorError(_)));
        assert!(err.is_transient());
    }
}
