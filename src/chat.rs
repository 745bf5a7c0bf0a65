//! Grounded chat turns: retrieve sources for the user's message, embed them in a
//! fixed instruction template and ask a completion model for the answer.

use async_trait::async_trait;
use reqwest::Client;
use serde::{ Deserialize, Serialize };
use log::{ info, error, debug };

use crate::config::ChatConfig;
use crate::error::{ PipelineError, Result };
use crate::query::{ QueryExecutor, SearchHit };

pub const GROUNDED_PROMPT: &str =
    "You are an AI assistant that helps users learn from the information found in the source material.
Answer the query using only the sources provided below.
The sources are in JSON format. You can use the information in the sources to answer the query.
Use bullets if the answer has multiple points.
If the answer is longer than 3 sentences, provide a summary.
Answer ONLY with the facts listed in the list of sources below. Cite your source when you answer the question
If there isn't enough information below, say you don't know.
Do not generate answers that don't use the sources below.
Query: {query}
Sources:
{sources}
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self { role: Role::User, content: content.to_string() }
    }

    pub fn assistant(content: &str) -> Self {
        Self { role: Role::Assistant, content: content.to_string() }
    }
}

/// History of one chat session. Owned by the session and threaded through each turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }
}

#[derive(Serialize)]
struct Source<'a> {
    title: &'a str,
    chunk: &'a str,
    locations: &'a [String],
}

/// Renders hits as the JSON array the prompt template expects.
pub fn format_sources(hits: &[SearchHit]) -> Result<String> {
    let sources: Vec<Source<'_>> = hits
        .iter()
        .map(|h| Source { title: &h.title, chunk: &h.chunk, locations: &h.locations })
        .collect();
    Ok(serde_json::to_string_pretty(&sources)?)
}

/// Fills both placeholders in one pass over the template; substituted text is never rescanned.
pub fn grounded_prompt(query: &str, sources: &str) -> String {
    let mut out = String::with_capacity(GROUNDED_PROMPT.len() + query.len() + sources.len());
    let mut rest = GROUNDED_PROMPT;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        if let Some(after) = tail.strip_prefix("{query}") {
            out.push_str(query);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{sources}") {
            out.push_str(sources);
            rest = after;
        } else {
            out.push('{');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat completions against an OpenAI deployment hosted on Azure.
pub struct AzureOpenAiChat {
    client: Client,
    url: String,
    api_key: String,
}

impl AzureOpenAiChat {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            config.endpoint.trim_end_matches('/'),
            config.deployment,
            config.api_version
        );
        info!("Chat deployment: {}", config.deployment);
        Ok(Self {
            client,
            url,
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl CompletionModel for AzureOpenAiChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        debug!("Sending {} messages for completion", messages.len());
        let resp = self.client
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(&(CompletionRequest { messages }))
            .send().await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_else(|_| "Failed to read error body".to_string());
            error!("Chat completion failed ({}): {}", status, message);
            return Err(match status.as_u16() {
                401 | 403 => PipelineError::Auth { status: status.as_u16(), message },
                code => PipelineError::Remote { status: code, message },
            });
        }

        let body: CompletionResponse = resp.json().await?;
        Ok(
            body.choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default()
        )
    }
}

/// Answers user turns from the index's content.
pub struct Assistant<M> {
    executor: QueryExecutor,
    model: M,
}

impl<M: CompletionModel> Assistant<M> {
    pub fn new(executor: QueryExecutor, model: M) -> Self {
        Self { executor, model }
    }

    /// Retrieves sources for `user_text`, sends the prior history plus the grounded
    /// prompt to the model, and returns the conversation with both new turns appended.
    pub async fn respond(&self, mut conversation: Conversation, user_text: &str) -> Result<(Conversation, String)> {
        let hits = self.executor.search(user_text).await?;
        let prompt = grounded_prompt(user_text, &format_sources(&hits)?);

        let mut messages = conversation.messages().to_vec();
        messages.push(ChatMessage::user(&prompt));
        let reply = self.model.complete(&messages).await?;

        conversation.push(ChatMessage::user(user_text));
        conversation.push(ChatMessage::assistant(&reply));
        Ok((conversation, reply))
    }
}
