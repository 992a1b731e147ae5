use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use url::Url;

use crate::cli::chat::conversation_state::{ChatMessage, ConversationState};
use crate::config::Config;
use crate::stream::{read_into_conversation, StreamOutcome};

/// Shown when a quota error carries no readable message.
const FALLBACK_ERROR_MESSAGE: &str = "Failed to get response from AI assistant";

pub type ByteStream = BoxStream<'static, Result<Bytes, ChatError>>;

#[derive(Debug, Error)]
pub enum ChatError {
    /// 429 from the chat endpoint; carries the server's message verbatim.
    #[error("{0}")]
    RateLimited(String),

    /// 402 from the chat endpoint; carries the server's message verbatim.
    #[error("{0}")]
    PaymentRequired(String),

    #[error("Failed to start stream")]
    StreamStart,

    #[error("No response body")]
    NoBody,

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Status line and body of a chat request, before any interpretation.
pub struct RawResponse {
    pub status: StatusCode,
    pub body: Option<ByteStream>,
}

/// Sends the conversation to the chat endpoint.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn post_messages(&self, messages: &[ChatMessage]) -> Result<RawResponse, ChatError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// `reqwest` transport: authenticated JSON POST to the configured chat URL.
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    api_key: String,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.chat_url.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn post_messages(&self, messages: &[ChatMessage]) -> Result<RawResponse, ChatError> {
        debug!("Sending {} messages to {}", messages.len(), self.url);

        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.api_key)
            .json(&ChatRequest { messages })
            .send()
            .await?;

        // Only null-body statuses lack a body; an empty 200 is an empty stream.
        let status = response.status();
        let body = if status == StatusCode::NO_CONTENT || status == StatusCode::RESET_CONTENT {
            None
        } else {
            let chunks = response.bytes_stream().map(|chunk| chunk.map_err(ChatError::from));
            Some(chunks.boxed())
        };

        Ok(RawResponse { status, body })
    }
}

pub struct ChatClient {
    transport: Box<dyn ChatTransport>,
}

impl ChatClient {
    pub fn new(config: &Config) -> Self {
        Self::with_transport(HttpTransport::new(config))
    }

    pub fn with_transport(transport: impl ChatTransport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
        }
    }

    /// Start a reply for `messages` and return its event stream.
    ///
    /// 429 and 402 are answered with the server's own message and the body is
    /// never handed to the event reader. Any other failure status is a
    /// generic [`ChatError::StreamStart`].
    pub async fn open_stream(&self, messages: &[ChatMessage]) -> Result<ByteStream, ChatError> {
        let response = self.transport.post_messages(messages).await?;
        let status = response.status;

        if !status.is_success() {
            if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::PAYMENT_REQUIRED {
                let message = read_error_message(response.body).await;
                error!("Chat request rejected with {}: {}", status, message);
                return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                    ChatError::RateLimited(message)
                } else {
                    ChatError::PaymentRequired(message)
                });
            }
            error!("Chat request failed with status {}", status);
            return Err(ChatError::StreamStart);
        }

        response.body.ok_or(ChatError::NoBody)
    }

    /// Append `input` as a user message and stream the assistant's reply into
    /// `conversation`.
    pub async fn send<F>(
        &self,
        conversation: &mut ConversationState,
        input: &str,
        cancel: &CancellationToken,
        on_delta: F,
    ) -> Result<StreamOutcome, ChatError>
    where
        F: FnMut(&str),
    {
        conversation.add_user_message(input);
        let body = self.open_stream(conversation.get_messages()).await?;
        let outcome = read_into_conversation(body, conversation, cancel, on_delta).await?;
        debug!("Reply finished: {:?}", outcome);
        Ok(outcome)
    }
}

async fn read_error_message(body: Option<ByteStream>) -> String {
    let mut raw = Vec::new();
    if let Some(mut body) = body {
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => raw.extend_from_slice(&chunk),
                Err(_) => break,
            }
        }
    }

    serde_json::from_slice::<ErrorBody>(&raw)
        .ok()
        .and_then(|body| body.error)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| FALLBACK_ERROR_MESSAGE.to_string())
}


#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::testing::ScriptedTransport;
    use super::*;

    const HELLO: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: [DONE]\n\n",
    );

    async fn send(
        client: &ChatClient,
        conversation: &mut ConversationState,
        input: &str,
    ) -> Result<StreamOutcome, ChatError> {
        client
            .send(conversation, input, &CancellationToken::new(), |_| {})
            .await
    }

    #[tokio::test]
    async fn streams_reply_into_conversation() {
        let client =
            ChatClient::with_transport(ScriptedTransport::default().respond(200, Some(&[HELLO])));
        let mut conversation = ConversationState::new();

        let outcome = send(&client, &mut conversation, "hi").await.unwrap();

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(
            conversation.get_messages(),
            &[ChatMessage::user("hi"), ChatMessage::assistant("Hello")]
        );
    }

    #[tokio::test]
    async fn split_json_across_reads_is_reassembled() {
        let (head, tail) = HELLO.split_at(30);
        let transport = ScriptedTransport::default().respond(200, Some(&[head, tail]));
        let client = ChatClient::with_transport(transport);
        let mut conversation = ConversationState::new();

        send(&client, &mut conversation, "hi").await.unwrap();

        assert_eq!(conversation.last(), Some(&ChatMessage::assistant("Hello")));
    }

    #[tokio::test]
    async fn rate_limit_surfaces_server_message() {
        let client = ChatClient::with_transport(
            ScriptedTransport::default().respond(429, Some(&[r#"{"error":"rate limited"}"#])),
        );
        let mut conversation = ConversationState::new();

        let err = send(&client, &mut conversation, "hi").await.unwrap_err();

        assert!(matches!(err, ChatError::RateLimited(_)));
        assert_eq!(err.to_string(), "rate limited");
        assert_eq!(conversation.get_messages(), &[ChatMessage::user("hi")]);
    }

    #[tokio::test]
    async fn payment_required_surfaces_server_message() {
        let client = ChatClient::with_transport(
            ScriptedTransport::default().respond(402, Some(&[r#"{"error":"credits exhausted"}"#])),
        );
        let mut conversation = ConversationState::new();

        let err = send(&client, &mut conversation, "hi").await.unwrap_err();

        assert!(matches!(err, ChatError::PaymentRequired(_)));
        assert_eq!(err.to_string(), "credits exhausted");
    }

    #[tokio::test]
    async fn quota_error_without_message_falls_back() {
        let client = ChatClient::with_transport(
            ScriptedTransport::default().respond(429, Some(&["<html>too many</html>"])),
        );
        let mut conversation = ConversationState::new();

        let err = send(&client, &mut conversation, "hi").await.unwrap_err();

        assert_eq!(err.to_string(), FALLBACK_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn other_failure_status_is_generic() {
        let client = ChatClient::with_transport(
            ScriptedTransport::default().respond(500, Some(&[r#"{"error":"boom"}"#])),
        );
        let mut conversation = ConversationState::new();

        let err = send(&client, &mut conversation, "hi").await.unwrap_err();

        assert!(matches!(err, ChatError::StreamStart));
        assert_eq!(err.to_string(), "Failed to start stream");
    }

    #[tokio::test]
    async fn missing_body_leaves_only_user_message() {
        let client = ChatClient::with_transport(ScriptedTransport::default().respond(200, None));
        let mut conversation = ConversationState::new();

        let err = send(&client, &mut conversation, "hi").await.unwrap_err();

        assert_eq!(err.to_string(), "No response body");
        assert_eq!(conversation.get_messages(), &[ChatMessage::user("hi")]);
    }

    #[tokio::test]
    async fn second_message_starts_fresh_reply() {
        let second = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Again\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let transport = ScriptedTransport::default()
            .respond(200, Some(&[HELLO]))
            .respond(200, Some(&[second]));
        let requests = transport.requests.clone();
        let client = ChatClient::with_transport(transport);
        let mut conversation = ConversationState::new();

        send(&client, &mut conversation, "hi").await.unwrap();
        send(&client, &mut conversation, "more").await.unwrap();

        assert_eq!(
            conversation.get_messages(),
            &[
                ChatMessage::user("hi"),
                ChatMessage::assistant("Hello"),
                ChatMessage::user("more"),
                ChatMessage::assistant("Again"),
            ]
        );
        let requests = requests.lock().unwrap();
        assert_eq!(requests[0], vec![ChatMessage::user("hi")]);
        assert_eq!(requests[1].len(), 3);
    }

    #[tokio::test]
    async fn failed_request_keeps_history_usable() {
        let transport = ScriptedTransport::default()
            .respond(503, None)
            .respond(200, Some(&[HELLO]));
        let client = ChatClient::with_transport(transport);
        let mut conversation = ConversationState::new();

        assert!(send(&client, &mut conversation, "first").await.is_err());
        send(&client, &mut conversation, "second").await.unwrap();

        assert_eq!(
            conversation.get_messages(),
            &[
                ChatMessage::user("first"),
                ChatMessage::user("second"),
                ChatMessage::assistant("Hello"),
            ]
        );
    }

    fn config_for(server: &MockServer) -> Config {
        Config::new(Some(&server.uri()), Some("test-key"), None).unwrap()
    }

    #[tokio::test]
    async fn http_transport_posts_messages_with_bearer_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/chat"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_json(serde_json::json!({
                "messages": [{ "role": "user", "content": "hi" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(HELLO, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChatClient::new(&config_for(&server));
        let mut conversation = ConversationState::new();
        let mut streamed = String::new();

        let outcome = client
            .send(&mut conversation, "hi", &CancellationToken::new(), |d| streamed.push_str(d))
            .await
            .unwrap();

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(streamed, "Hello");
        assert_eq!(conversation.last(), Some(&ChatMessage::assistant("Hello")));
    }

    #[tokio::test]
    async fn http_transport_reports_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/chat"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_json(serde_json::json!({ "error": "rate limited" })),
            )
            .mount(&server)
            .await;

        let client = ChatClient::new(&config_for(&server));
        let mut conversation = ConversationState::new();

        let err = send(&client, &mut conversation, "hi").await.unwrap_err();

        assert_eq!(err.to_string(), "rate limited");
    }

    #[tokio::test]
    async fn http_transport_treats_no_content_as_missing_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = ChatClient::new(&config_for(&server));
        let mut conversation = ConversationState::new();

        let err = send(&client, &mut conversation, "hi").await.unwrap_err();

        assert!(matches!(err, ChatError::NoBody));
    }

    #[tokio::test]
    async fn http_transport_reads_empty_success_body_as_empty_stream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("", "text/event-stream"))
            .mount(&server)
            .await;

        let client = ChatClient::new(&config_for(&server));
        let mut conversation = ConversationState::new();

        let outcome = send(&client, &mut conversation, "hi").await.unwrap();

        assert_eq!(outcome, StreamOutcome::Ended);
        assert_eq!(conversation.get_messages(), &[ChatMessage::user("hi")]);
    }
}
