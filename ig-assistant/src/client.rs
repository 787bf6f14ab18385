use crate::error::{AssistantError, Result};
use crate::policy::{PollPolicy, poll_until_terminal};
use crate::types::{Role, Run, RunStatus};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const ASSISTANTS_BETA_HEADER: &str = "OpenAI-Beta";
const ASSISTANTS_BETA_VALUE: &str = "assistants=v2";

/// Drives one user text through a thread/run round trip on an
/// Assistants-style API and returns the assistant's reply.
#[derive(Clone)]
pub struct AssistantClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    assistant_id: String,
    poll_policy: PollPolicy,
    delete_threads: bool,
}

impl AssistantClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, assistant_id: &str) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(AssistantError::InvalidInput(
                "assistant api key is required".to_string(),
            ));
        }
        let assistant_id = assistant_id.trim();
        if assistant_id.is_empty() {
            return Err(AssistantError::InvalidInput(
                "assistant id is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url: parse_base_url(DEFAULT_BASE_URL)?,
            api_key: api_key.to_string(),
            assistant_id: assistant_id.to_string(),
            poll_policy: PollPolicy::default(),
            delete_threads: true,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        self.base_url = parse_base_url(base_url)?;
        Ok(self)
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Result<Self> {
        policy.validate()?;
        self.poll_policy = policy;
        Ok(self)
    }

    pub fn with_delete_threads(mut self, delete_threads: bool) -> Self {
        self.delete_threads = delete_threads;
        self
    }

    /// Run `text` through a fresh thread and return the assistant's reply.
    #[tracing::instrument(level = "info", skip_all, fields(assistant_id = %self.assistant_id))]
    pub async fn reply(&self, text: &str) -> Result<String> {
        if text.is_empty() {
            return Err(AssistantError::InvalidInput(
                "user text is empty".to_string(),
            ));
        }

        let thread_id = self.create_thread().await?;
        let result = self.reply_in_thread(&thread_id, text).await;
        if self.delete_threads {
            if let Err(error) = self.delete_thread(&thread_id).await {
                tracing::warn!(%error, %thread_id, "thread cleanup failed");
            }
        }
        result
    }

    async fn reply_in_thread(&self, thread_id: &str, text: &str) -> Result<String> {
        self.add_user_message(thread_id, text).await?;
        let run = self.create_run(thread_id).await?;
        let run_id = run.id.clone();
        tracing::debug!(%thread_id, %run_id, status = %run.status, "run created");

        let run = if run.status.is_terminal() {
            run
        } else {
            poll_until_terminal(&self.poll_policy, &run_id, || self.get_run(thread_id, &run_id))
                .await?
        };

        if !run.status.is_success() {
            return Err(AssistantError::RunFailed {
                run_id: run.id,
                status: run.status,
                detail: run.last_error,
            });
        }

        let messages = self.list_run_messages(thread_id, &run_id).await?;
        extract_reply(&messages, &run_id)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn create_thread(&self) -> Result<String> {
        let thread: ThreadObject = self
            .send_json(self.http.post(self.url(&["threads"])?).json(&serde_json::json!({})))
            .await?;
        Ok(thread.id)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(%thread_id))]
    pub async fn add_user_message(&self, thread_id: &str, text: &str) -> Result<()> {
        let body = CreateMessageRequest {
            role: Role::User,
            content: text,
        };
        let _: MessageObject = self
            .send_json(
                self.http
                    .post(self.url(&["threads", thread_id, "messages"])?)
                    .json(&body),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(%thread_id))]
    pub async fn create_run(&self, thread_id: &str) -> Result<Run> {
        let body = CreateRunRequest {
            assistant_id: &self.assistant_id,
        };
        let run: RunObject = self
            .send_json(
                self.http
                    .post(self.url(&["threads", thread_id, "runs"])?)
                    .json(&body),
            )
            .await?;
        Ok(run.into_run(thread_id))
    }

    #[tracing::instrument(level = "trace", skip_all, fields(%thread_id, %run_id))]
    pub async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run> {
        let run: RunObject = self
            .send_json(
                self.http
                    .get(self.url(&["threads", thread_id, "runs", run_id])?),
            )
            .await?;
        Ok(run.into_run(thread_id))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(%thread_id, %run_id))]
    async fn list_run_messages(&self, thread_id: &str, run_id: &str) -> Result<Vec<MessageObject>> {
        let list: MessageList = self
            .send_json(
                self.http
                    .get(self.url(&["threads", thread_id, "messages"])?)
                    .query(&[("run_id", run_id), ("order", "desc")]),
            )
            .await?;
        Ok(list.data)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(%thread_id))]
    pub async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .send_json(self.http.delete(self.url(&["threads", thread_id])?))
            .await?;
        Ok(())
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                AssistantError::InvalidInput(format!(
                    "assistant base url cannot be a base: {}",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .bearer_auth(&self.api_key)
            .header(ASSISTANTS_BETA_HEADER, ASSISTANTS_BETA_VALUE)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AssistantError::Http(format!(
                "assistant api status={status} body={body}"
            )));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| AssistantError::InvalidInput(format!("invalid assistant base url {raw:?}: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AssistantError::InvalidInput(format!(
            "assistant base url must be http or https: {raw:?}"
        )));
    }
    Ok(url)
}

/// Pick the text of the assistant message written by `run_id`.
fn extract_reply(messages: &[MessageObject], run_id: &str) -> Result<String> {
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .filter(|m| m.run_id.as_deref().is_none_or(|id| id == run_id))
        .find_map(|m| {
            m.content.iter().find_map(|part| match part {
                ContentPart::Text { text } => Some(text.value.clone()),
                ContentPart::Other => None,
            })
        })
        .ok_or_else(|| AssistantError::NoResponse {
            run_id: run_id.to_string(),
        })
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateRunRequest<'a> {
    assistant_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ThreadObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    status: RunStatus,
    #[serde(default)]
    last_error: Option<RunLastError>,
}

#[derive(Debug, Deserialize)]
struct RunLastError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl RunObject {
    fn into_run(self, thread_id: &str) -> Run {
        let last_error = self.last_error.and_then(|e| match (e.code, e.message) {
            (Some(code), Some(message)) => Some(format!("{code}: {message}")),
            (None, Some(message)) => Some(message),
            (Some(code), None) => Some(code),
            (None, None) => None,
        });
        Run {
            id: self.id,
            thread_id: thread_id.to_string(),
            status: self.status,
            last_error,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    data: Vec<MessageObject>,
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    role: Role,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: TextContent },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    value: String,
}

#[cfg(test)]
mod tests {
    use super::{AssistantClient, ContentPart, MessageObject, extract_reply};
    use crate::error::AssistantError;
    use crate::policy::PollPolicy;
    use crate::types::{Role, RunStatus};
    use httpmock::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn client_for(server: &MockServer) -> AssistantClient {
        AssistantClient::new("sk-test", "asst_123")
            .expect("client")
            .with_base_url(&server.url("/v1"))
            .expect("base url")
            .with_poll_policy(PollPolicy::fixed(Duration::from_millis(5), 5))
            .expect("poll policy")
    }

    fn assistant_message(run_id: Option<&str>, text: &str) -> MessageObject {
        serde_json::from_value(json!({
            "role": "assistant",
            "run_id": run_id,
            "content": [{ "type": "text", "text": { "value": text, "annotations": [] } }]
        }))
        .expect("message")
    }

    #[test]
    fn new_requires_credentials() {
        assert!(AssistantClient::new("", "asst_1").is_err());
        assert!(AssistantClient::new("sk", "  ").is_err());
        assert!(
            AssistantClient::new("sk", "asst_1")
                .expect("client")
                .with_base_url("ftp://example.com")
                .is_err()
        );
    }

    #[test]
    fn extract_reply_prefers_message_from_the_run() {
        let messages = vec![
            assistant_message(Some("run_other"), "stale"),
            assistant_message(Some("run_1"), "fresh"),
        ];
        assert_eq!(extract_reply(&messages, "run_1").expect("reply"), "fresh");
    }

    #[test]
    fn extract_reply_skips_non_text_parts() {
        let message: MessageObject = serde_json::from_value(json!({
            "role": "assistant",
            "run_id": "run_1",
            "content": [
                { "type": "image_file", "image_file": { "file_id": "file_1" } },
                { "type": "text", "text": { "value": "caption" } }
            ]
        }))
        .expect("message");
        assert!(matches!(message.content[0], ContentPart::Other));
        assert_eq!(extract_reply(&[message], "run_1").expect("reply"), "caption");
    }

    #[test]
    fn extract_reply_without_assistant_text_is_no_response() {
        let user: MessageObject = serde_json::from_value(json!({
            "role": "user",
            "run_id": null,
            "content": [{ "type": "text", "text": { "value": "hi" } }]
        }))
        .expect("message");
        assert_eq!(user.role, Role::User);
        let err = extract_reply(&[user], "run_1").expect_err("no assistant message");
        assert!(matches!(err, AssistantError::NoResponse { .. }));
    }

    #[tokio::test]
    async fn reply_drives_thread_message_run_and_extraction() {
        let server = MockServer::start_async().await;
        let create_thread = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/threads")
                    .header("authorization", "Bearer sk-test")
                    .header("openai-beta", "assistants=v2");
                then.status(200).json_body(json!({ "id": "thread_1" }));
            })
            .await;
        let add_message = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/threads/thread_1/messages")
                    .json_body(json!({ "role": "user", "content": "hello there" }));
                then.status(200)
                    .json_body(json!({ "id": "msg_1", "role": "user", "content": [] }));
            })
            .await;
        let create_run = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/threads/thread_1/runs")
                    .json_body(json!({ "assistant_id": "asst_123" }));
                then.status(200)
                    .json_body(json!({ "id": "run_1", "status": "queued" }));
            })
            .await;
        let get_run = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/threads/thread_1/runs/run_1");
                then.status(200)
                    .json_body(json!({ "id": "run_1", "status": "completed" }));
            })
            .await;
        let list_messages = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/threads/thread_1/messages")
                    .query_param("run_id", "run_1");
                then.status(200).json_body(json!({
                    "data": [{
                        "id": "msg_2",
                        "role": "assistant",
                        "run_id": "run_1",
                        "content": [{ "type": "text", "text": { "value": "General Kenobi", "annotations": [] } }]
                    }]
                }));
            })
            .await;
        let delete_thread = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/v1/threads/thread_1");
                then.status(200)
                    .json_body(json!({ "id": "thread_1", "deleted": true }));
            })
            .await;

        let reply = client_for(&server)
            .reply("hello there")
            .await
            .expect("reply");

        assert_eq!(reply, "General Kenobi");
        create_thread.assert_async().await;
        add_message.assert_async().await;
        create_run.assert_async().await;
        get_run.assert_hits_async(1).await;
        list_messages.assert_async().await;
        delete_thread.assert_async().await;
    }

    #[tokio::test]
    async fn reply_polls_until_completed_and_forwards_text_verbatim() {
        use axum::routing::{get, post};
        use axum::{Json, Router};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{Arc, Mutex};
        use std::time::Instant;

        let status_fetches = Arc::new(AtomicUsize::new(0));
        let posted = Arc::new(Mutex::new(Vec::<serde_json::Value>::new()));

        let app = Router::new()
            .route("/v1/threads", post(|| async { Json(json!({ "id": "thread_1" })) }))
            .route(
                "/v1/threads/{thread_id}",
                axum::routing::delete(|| async { Json(json!({ "deleted": true })) }),
            )
            .route(
                "/v1/threads/{thread_id}/messages",
                post({
                    let posted = posted.clone();
                    move |Json(body): Json<serde_json::Value>| {
                        let posted = posted.clone();
                        async move {
                            posted.lock().expect("posted lock").push(body);
                            Json(json!({ "id": "msg_1", "role": "user", "content": [] }))
                        }
                    }
                })
                .get(|| async {
                    Json(json!({
                        "data": [{
                            "role": "assistant",
                            "run_id": "run_1",
                            "content": [{ "type": "text", "text": { "value": "third time lucky" } }]
                        }]
                    }))
                }),
            )
            .route(
                "/v1/threads/{thread_id}/runs",
                post(|| async { Json(json!({ "id": "run_1", "status": "queued" })) }),
            )
            .route(
                "/v1/threads/{thread_id}/runs/{run_id}",
                get({
                    let status_fetches = status_fetches.clone();
                    move || {
                        let status_fetches = status_fetches.clone();
                        async move {
                            let fetch = status_fetches.fetch_add(1, Ordering::SeqCst);
                            let status = ["queued", "in_progress", "completed"]
                                .get(fetch)
                                .copied()
                                .unwrap_or("completed");
                            Json(json!({ "id": "run_1", "status": status }))
                        }
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake assistant api");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake assistant api");
        });

        let interval = Duration::from_millis(20);
        let client = AssistantClient::new("sk-test", "asst_123")
            .expect("client")
            .with_base_url(&format!("http://{addr}/v1"))
            .expect("base url")
            .with_poll_policy(PollPolicy::fixed(interval, 10))
            .expect("poll policy");

        let started = Instant::now();
        let reply = client.reply("  hello there \n").await.expect("reply");

        assert_eq!(reply, "third time lucky");
        assert_eq!(status_fetches.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= interval * 2);
        assert_eq!(
            *posted.lock().expect("posted lock"),
            vec![json!({ "role": "user", "content": "  hello there \n" })]
        );
    }

    #[tokio::test]
    async fn failed_run_surfaces_status_and_still_cleans_up() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/threads");
                then.status(200).json_body(json!({ "id": "thread_9" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/threads/thread_9/messages");
                then.status(200).json_body(json!({ "id": "msg_1", "role": "user" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/threads/thread_9/runs");
                then.status(200)
                    .json_body(json!({ "id": "run_9", "status": "in_progress" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/threads/thread_9/runs/run_9");
                then.status(200).json_body(json!({
                    "id": "run_9",
                    "status": "failed",
                    "last_error": { "code": "server_error", "message": "upstream exploded" }
                }));
            })
            .await;
        let list_messages = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/threads/thread_9/messages");
                then.status(200).json_body(json!({ "data": [] }));
            })
            .await;
        let delete_thread = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/v1/threads/thread_9");
                then.status(200).json_body(json!({ "deleted": true }));
            })
            .await;

        let err = client_for(&server)
            .reply("hi")
            .await
            .expect_err("run failed");
        match err {
            AssistantError::RunFailed {
                run_id,
                status,
                detail,
            } => {
                assert_eq!(run_id, "run_9");
                assert_eq!(status, RunStatus::Failed);
                assert_eq!(detail.as_deref(), Some("server_error: upstream exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }
        list_messages.assert_hits_async(0).await;
        delete_thread.assert_async().await;
    }

    #[tokio::test]
    async fn thread_creation_failure_aborts_before_any_other_call() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/threads");
                then.status(401).body("bad key");
            })
            .await;
        let add_message = server
            .mock_async(|when, then| {
                when.path_contains("/messages");
                then.status(200);
            })
            .await;

        let err = client_for(&server)
            .reply("hi")
            .await
            .expect_err("thread creation fails");
        assert!(matches!(err, AssistantError::Http(ref msg) if msg.contains("401")));
        add_message.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn empty_text_is_rejected_without_network() {
        let server = MockServer::start_async().await;
        let any = server
            .mock_async(|when, then| {
                when.path_contains("/");
                then.status(200);
            })
            .await;
        let err = client_for(&server)
            .reply("")
            .await
            .expect_err("empty text");
        assert!(matches!(err, AssistantError::InvalidInput(_)));
        any.assert_hits_async(0).await;
    }
}
