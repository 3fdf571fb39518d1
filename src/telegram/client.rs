//! Thin reqwest client for the Telegram Bot API.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Bot API client with bounded request timeouts.
#[derive(Clone)]
pub struct TelegramClient {
    bot_token: String,
    poll_total_timeout: Duration,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

/// One update from `getUpdates`.
#[derive(Clone, Deserialize)]
pub struct TelegramUpdate {
    /// Monotonic update id; next poll offset is `update_id + 1`.
    pub update_id: i64,
    /// Message payload, when the update carries one.
    pub message: Option<TelegramMessage>,
}

/// Inbound chat message.
#[derive(Clone, Deserialize)]
pub struct TelegramMessage {
    /// Text body; absent for stickers and service messages.
    pub text: Option<String>,
    /// Chat the message arrived in.
    pub chat: TelegramChat,
    /// Forum thread the message belongs to.
    pub message_thread_id: Option<i64>,
    /// Message this one replies to.
    pub reply_to_message: Option<Box<TelegramMessage>>,
}

/// Chat identifier wrapper.
#[derive(Clone, Deserialize)]
pub struct TelegramChat {
    /// Numeric chat id.
    pub id: i64,
}

#[derive(Serialize)]
struct GetUpdatesRequest<'a> {
    offset: i64,
    timeout: u64,
    allowed_updates: &'a [&'a str],
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_thread_id: Option<i64>,
}

#[derive(Serialize)]
struct CreateForumTopicRequest<'a> {
    chat_id: i64,
    name: &'a str,
}

#[derive(Deserialize)]
struct ForumTopic {
    message_thread_id: i64,
}

#[derive(Serialize)]
struct DeleteForumTopicRequest {
    chat_id: i64,
    message_thread_id: i64,
}

impl TelegramClient {
    /// Build a client. `poll_total_timeout` bounds each `getUpdates`
    /// round-trip end to end.
    #[must_use]
    pub fn new(bot_token: String, poll_total_timeout: Duration) -> Self {
        Self {
            bot_token,
            poll_total_timeout,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.bot_token)
    }

    async fn call<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp> {
        let response = self
            .client
            .post(self.url(method))
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|err| AppError::Transport(format!("telegram {method} failed: {err}")))?
            .error_for_status()
            .map_err(|err| AppError::Transport(format!("telegram {method} failed: {err}")))?;
        let body: ApiResponse<Resp> = response
            .json()
            .await
            .map_err(|err| AppError::Transport(format!("telegram {method} decode failed: {err}")))?;
        if !body.ok {
            return Err(AppError::Transport(format!(
                "telegram {method} returned not ok: {}",
                body.description.unwrap_or_default()
            )));
        }
        body.result
            .ok_or_else(|| AppError::Transport(format!("telegram {method} returned empty result")))
    }

    /// Long-poll for updates. The total request timeout is the poll
    /// timeout plus the configured margin, so a stalled connection
    /// surfaces as an error instead of hanging.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` on request, status, or decode failure.
    pub async fn get_updates(&self, offset: i64, timeout_s: u64) -> Result<Vec<TelegramUpdate>> {
        let request = GetUpdatesRequest {
            offset,
            timeout: timeout_s,
            allowed_updates: &["message"],
        };
        self.call("getUpdates", &request, self.poll_total_timeout)
            .await
    }

    /// Send text to a chat, optionally inside a forum thread. When the
    /// thread has been closed the send is retried against the bare chat.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` when both attempts fail.
    pub async fn send_message(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        text: &str,
    ) -> Result<()> {
        let request = SendMessageRequest {
            chat_id,
            text,
            message_thread_id: thread_id,
        };
        let first: Result<serde_json::Value> = self
            .call("sendMessage", &request, Duration::from_secs(10))
            .await;
        match first {
            Ok(_) => Ok(()),
            Err(err) if thread_id.is_some() && is_thread_error(&err) => {
                let fallback = SendMessageRequest {
                    chat_id,
                    text,
                    message_thread_id: None,
                };
                self.call::<_, serde_json::Value>("sendMessage", &fallback, Duration::from_secs(10))
                    .await
                    .map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    /// Create a forum topic and return its thread id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` on failure.
    pub async fn create_forum_topic(&self, chat_id: i64, name: &str) -> Result<i64> {
        let request = CreateForumTopicRequest { chat_id, name };
        let topic: ForumTopic = self
            .call("createForumTopic", &request, Duration::from_secs(10))
            .await?;
        Ok(topic.message_thread_id)
    }

    /// Delete a forum topic.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` on failure.
    pub async fn delete_forum_topic(&self, chat_id: i64, thread_id: i64) -> Result<()> {
        let request = DeleteForumTopicRequest {
            chat_id,
            message_thread_id: thread_id,
        };
        self.call::<_, serde_json::Value>("deleteForumTopic", &request, Duration::from_secs(10))
            .await
            .map(|_| ())
    }
}

/// Whether a transport error indicates a missing or closed thread.
fn is_thread_error(err: &AppError) -> bool {
    let text = err.to_string().to_ascii_lowercase();
    text.contains("thread") || text.contains("topic")
}
