//! Chat-completion boundary client
//!
//! Sends the accepted transcript plus bounded history to the completion
//! service. Streamed and non-streamed replies are treated uniformly: chunks
//! accumulate into one reply string before the engine moves to speaking.

use async_trait::async_trait;
use futures::StreamExt;

use crate::config::CompletionConfig;
use crate::{Error, Result};

/// At most this many history messages travel with a request
const HISTORY_WINDOW: usize = 10;

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Engine-level instructions
    System,
    /// The person speaking
    User,
    /// The assistant
    Assistant,
}

/// One message in a completion request
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatMessage {
    /// Author
    pub role: Role,
    /// Text content
    pub content: String,
}

/// Chat-completion boundary: conversation history in, reply text out
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    /// Produce a reply for the conversation so far
    ///
    /// # Errors
    ///
    /// Returns error if the boundary rejects or fails the request
    async fn complete(&self, history: &[ChatMessage]) -> Result<String>;
}

#[derive(serde::Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(serde::Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(serde::Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(serde::Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(serde::Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(serde::Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// HTTP client for an OpenAI-shaped chat-completion API
pub struct CompletionClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    system_prompt: String,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

impl CompletionClient {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Config(
                "completion API key required".to_string(),
            ));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            stream: config.stream,
        })
    }

    fn build_messages(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let tail = history.len().saturating_sub(HISTORY_WINDOW);
        let mut messages = Vec::with_capacity(history.len() - tail + 1);
        messages.push(ChatMessage {
            role: Role::System,
            content: self.system_prompt.clone(),
        });
        messages.extend(history[tail..].iter().cloned());
        messages
    }

    async fn request_reply(&self, messages: &[ChatMessage]) -> Result<String> {
        #[derive(serde::Serialize)]
        struct CompletionRequest<'a> {
            model: &'a str,
            messages: &'a [ChatMessage],
            max_tokens: u32,
            temperature: f32,
            stream: bool,
        }

        let request = CompletionRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: self.stream,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                service: "completion",
                status,
                message: body,
            });
        }

        if self.stream {
            accumulate_stream(response).await
        } else {
            let result: CompletionResponse = response.json().await?;
            result
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .filter(|text| !text.trim().is_empty())
                .ok_or_else(|| Error::Completion("empty reply".to_string()))
        }
    }
}

#[async_trait]
impl ChatCompletion for CompletionClient {
    async fn complete(&self, history: &[ChatMessage]) -> Result<String> {
        let messages = self.build_messages(history);
        let reply = self.request_reply(&messages).await?;
        tracing::debug!(reply_len = reply.len(), "completion received");
        Ok(reply)
    }
}

/// Accumulate a server-sent-event reply into one string
async fn accumulate_stream(response: reqwest::Response) -> Result<String> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut reply = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim().to_string();
            buffer.drain(..=newline);

            match parse_stream_line(&line) {
                StreamLine::Delta(text) => reply.push_str(&text),
                StreamLine::Done => {
                    return finish_reply(reply);
                }
                StreamLine::Skip => {}
            }
        }
    }

    finish_reply(reply)
}

fn finish_reply(reply: String) -> Result<String> {
    if reply.trim().is_empty() {
        Err(Error::Completion("empty streamed reply".to_string()))
    } else {
        Ok(reply)
    }
}

enum StreamLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_stream_line(line: &str) -> StreamLine {
    let Some(data) = line.strip_prefix("data: ") else {
        return StreamLine::Skip;
    };
    if data == "[DONE]" {
        return StreamLine::Done;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .map_or(StreamLine::Skip, StreamLine::Delta),
        Err(_) => StreamLine::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> CompletionClient {
        let config = CompletionConfig {
            api_key: "test".to_string(),
            system_prompt: "be brief".to_string(),
            ..CompletionConfig::default()
        };
        CompletionClient::new(&config).unwrap()
    }

    fn message(role: Role, content: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: content.to_string(),
        }
    }

    #[test]
    fn test_system_prompt_leads() {
        let messages = client().build_messages(&[message(Role::User, "привет")]);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "be brief");
        assert_eq!(messages[1].content, "привет");
    }

    #[test]
    fn test_history_windowed_to_recent_messages() {
        let history: Vec<ChatMessage> = (0..20)
            .map(|n| message(Role::User, &format!("msg {n}")))
            .collect();

        let messages = client().build_messages(&history);
        // System prompt + the window
        assert_eq!(messages.len(), HISTORY_WINDOW + 1);
        assert_eq!(messages[1].content, "msg 10");
        assert_eq!(messages.last().unwrap().content, "msg 19");
    }

    #[test]
    fn test_stream_line_parsing() {
        assert!(matches!(
            parse_stream_line(r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#),
            StreamLine::Delta(text) if text == "hi"
        ));
        assert!(matches!(parse_stream_line("data: [DONE]"), StreamLine::Done));
        assert!(matches!(parse_stream_line(""), StreamLine::Skip));
        assert!(matches!(parse_stream_line(": keepalive"), StreamLine::Skip));
        assert!(matches!(
            parse_stream_line(r#"data: {"choices":[{"delta":{}}]}"#),
            StreamLine::Skip
        ));
    }

    #[test]
    fn test_missing_key_rejected() {
        let config = CompletionConfig {
            api_key: String::new(),
            ..CompletionConfig::default()
        };
        assert!(CompletionClient::new(&config).is_err());
    }
}
