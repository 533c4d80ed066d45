//! Transport used by the client layer

use async_trait::async_trait;
use futures::{StreamExt, future, stream::BoxStream};
use reqwest::{Client, RequestBuilder, Response, header::ACCEPT};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tracing::debug;

use super::Error;
use crate::{
    PushMessage,
    broadcast::Role,
    ledger::{Answer, Submission},
    participant::{Id, Participant},
    question::QuestionSet,
    step::{QuizState, Step},
};

/// The server operations a client relies on
#[async_trait]
pub trait QuizApi: Send + Sync {
    /// `GET /api/state`
    async fn state(&self) -> Result<QuizState, Error>;

    /// `GET /api/participants`
    async fn participants(&self) -> Result<Vec<Participant>, Error>;

    /// `GET /api/answers/{questionIndex}`
    async fn answers(&self, question_index: usize) -> Result<Vec<Answer>, Error>;

    /// `GET /api/questions`
    async fn questions(&self) -> Result<QuestionSet, Error>;

    /// `POST /api/participants`, returning the new or existing record
    async fn join(
        &self,
        id: Id,
        name: &str,
        avatar_url: Option<String>,
    ) -> Result<Participant, Error>;

    /// `POST /api/answers`
    async fn submit(&self, submission: &Submission) -> Result<Answer, Error>;

    /// Opens the push channel
    async fn subscribe(&self, role: Role)
    -> Result<BoxStream<'static, PushMessage>, Error>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JoinResponse {
    Existing { participant: Participant },
    New(Participant),
}

/// [`QuizApi`] over HTTP, with Server-Sent Events for push
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    base_url: String,
    driver_pin: Option<String>,
}

impl HttpApi {
    /// A client for the server at `base_url`, such as `http://localhost:8080`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            driver_pin: None,
        }
    }

    /// Sends `pin` with driver operations
    #[must_use]
    pub fn with_driver_pin(mut self, pin: impl Into<String>) -> Self {
        self.driver_pin = Some(pin.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn driver(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.driver_pin {
            Some(pin) => request.header(crate::server::auth::DRIVER_PIN_HEADER, pin),
            None => request,
        }
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let text = response.text().await?;
        let (code, message) = serde_json::from_str::<ErrorBody>(&text)
            .map_or_else(|_| ("unknown".to_owned(), text), |b| (b.code, b.error));
        Err(Error::Server {
            status: status.as_u16(),
            code,
            message,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        Self::parse(self.client.get(self.url(path)).send().await?).await
    }

    /// `PUT /api/state` as the driver
    pub async fn transition(&self, step: Step) -> Result<QuizState, Error> {
        let request = self
            .client
            .put(self.url("/api/state"))
            .json(&json!({ "step": step }));
        Self::parse(self.driver(request).send().await?).await
    }

    /// `POST /api/reset` as the driver
    pub async fn reset(&self) -> Result<QuizState, Error> {
        let request = self.client.post(self.url("/api/reset"));
        Self::parse(self.driver(request).send().await?).await
    }

    /// `PUT /api/questions` as the driver
    pub async fn replace_questions(&self, questions: &QuestionSet) -> Result<QuizState, Error> {
        let request = self.client.put(self.url("/api/questions")).json(questions);
        Self::parse(self.driver(request).send().await?).await
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest<'a> {
    id: Id,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    avatar_url: Option<String>,
}

#[async_trait]
impl QuizApi for HttpApi {
    async fn state(&self) -> Result<QuizState, Error> {
        self.get("/api/state").await
    }

    async fn participants(&self) -> Result<Vec<Participant>, Error> {
        self.get("/api/participants").await
    }

    async fn answers(&self, question_index: usize) -> Result<Vec<Answer>, Error> {
        self.get(&format!("/api/answers/{question_index}")).await
    }

    async fn questions(&self) -> Result<QuestionSet, Error> {
        self.get("/api/questions").await
    }

    async fn join(
        &self,
        id: Id,
        name: &str,
        avatar_url: Option<String>,
    ) -> Result<Participant, Error> {
        let response = self
            .client
            .post(self.url("/api/participants"))
            .json(&JoinRequest {
                id,
                name,
                avatar_url,
            })
            .send()
            .await?;
        Ok(match Self::parse(response).await? {
            JoinResponse::Existing { participant } | JoinResponse::New(participant) => {
                participant
            }
        })
    }

    async fn submit(&self, submission: &Submission) -> Result<Answer, Error> {
        let response = self
            .client
            .post(self.url("/api/answers"))
            .json(submission)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn subscribe(
        &self,
        role: Role,
    ) -> Result<BoxStream<'static, PushMessage>, Error> {
        let response = self
            .client
            .get(self.url("/api/events"))
            .query(&[("role", role)])
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|_| Error::ChannelUnavailable)?;
        if !response.status().is_success() {
            return Err(Error::ChannelUnavailable);
        }

        let messages = response
            .bytes_stream()
            .scan(SseDecoder::default(), |decoder, chunk| {
                future::ready(chunk.ok().map(|bytes| decoder.push(&bytes)))
            })
            .flat_map(futures::stream::iter)
            .filter_map(|data| {
                future::ready(
                    serde_json::from_str::<PushMessage>(&data)
                        .inspect_err(|e| debug!(error = %e, "undecodable push message"))
                        .ok(),
                )
            });
        Ok(messages.boxed())
    }
}

/// Splits a Server-Sent Events byte stream into `data` payloads
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    /// Feeds a chunk and returns the payloads of the events it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer
            .push_str(&String::from_utf8_lossy(chunk).replace('\r', ""));

        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let event: String = self.buffer.drain(..end + 2).collect();
            let data = event
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect::<Vec<_>>()
                .join("\n");
            if !data.is_empty() {
                payloads.push(data);
            }
        }
        payloads
    }
}
