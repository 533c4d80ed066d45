#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response},
};
use futures::stream::{self, BoxStream, StreamExt};
use http_body_util::BodyExt;
use quizsync::{
    PushMessage,
    broadcast::{ConnectionId, Role},
    client::{Error, api::QuizApi},
    clock::ManualClock,
    engine::{self, Options, QuizEngine},
    ledger::{Answer, Submission},
    participant::{Id, Participant},
    question::{Question, QuestionSet},
    server::{AppState, create_app, error::AppError},
    session::ChannelTunnel,
    step::QuizState,
    store::MemoryStore,
};
use serde_json::Value;

pub const PIN: &str = "4321";

pub struct TestServer {
    pub app: Router,
    pub engine: Arc<QuizEngine>,
    pub clock: ManualClock,
}

pub fn engine(clock: &ManualClock) -> Arc<QuizEngine> {
    Arc::new(
        QuizEngine::open(
            Options::default(),
            Arc::new(MemoryStore::default()),
            Arc::new(clock.clone()),
        )
        .unwrap(),
    )
}

pub fn create_test_server() -> TestServer {
    let clock = ManualClock::new(1_700_000_000_000);
    let engine = engine(&clock);
    let app = create_app(AppState::new(Arc::clone(&engine), PIN));
    TestServer { app, engine, clock }
}

pub fn questions(count: usize) -> QuestionSet {
    QuestionSet::new(
        (0..count)
            .map(|i| Question {
                id: format!("q{i}"),
                text: format!("Question {i}"),
                options: vec!["A".into(), "B".into(), "C".into(), "D".into()],
                correct_index: 2,
                question_image: None,
                answer_image: None,
            })
            .collect(),
    )
}

pub fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn driver_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let mut request = request(method, uri, body);
    request
        .headers_mut()
        .insert("x-driver-pin", PIN.parse().unwrap());
    request
}

pub async fn json_body(response: Response<Body>) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap_or(Value::Null)
}

/// Unregisters an in-process push stream once the client drops it
struct Subscription {
    engine: Arc<QuizEngine>,
    id: Option<ConnectionId>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.engine.broadcaster().disconnect(id);
        }
    }
}

/// A client transport calling the engine in-process
pub struct EngineApi {
    pub engine: Arc<QuizEngine>,
    pub push: bool,
}

fn client_error(e: engine::Error) -> Error {
    let e = AppError::from(e);
    Error::Server {
        status: e.status().as_u16(),
        code: e.code().to_owned(),
        message: e.to_string(),
    }
}

#[async_trait]
impl QuizApi for EngineApi {
    async fn state(&self) -> Result<QuizState, Error> {
        Ok(self.engine.state().await)
    }

    async fn participants(&self) -> Result<Vec<Participant>, Error> {
        Ok(self.engine.participants().await)
    }

    async fn answers(&self, question_index: usize) -> Result<Vec<Answer>, Error> {
        Ok(self.engine.answers(question_index).await)
    }

    async fn questions(&self) -> Result<QuestionSet, Error> {
        Ok(self.engine.questions().await)
    }

    async fn join(
        &self,
        id: Id,
        name: &str,
        avatar_url: Option<String>,
    ) -> Result<Participant, Error> {
        self.engine
            .join(id, name, avatar_url)
            .await
            .map(|joined| joined.participant().clone())
            .map_err(client_error)
    }

    async fn submit(&self, submission: &Submission) -> Result<Answer, Error> {
        self.engine
            .submit(submission.clone())
            .await
            .map_err(client_error)
    }

    async fn subscribe(&self, role: Role) -> Result<BoxStream<'static, PushMessage>, Error> {
        if !self.push {
            return Err(Error::ChannelUnavailable);
        }
        let (tunnel, receiver) = ChannelTunnel::new(64);
        let subscription = Subscription {
            engine: Arc::clone(&self.engine),
            id: self.engine.connect(role, tunnel).await,
        };
        Ok(stream::unfold(
            (receiver, subscription),
            |(mut receiver, subscription)| async move {
                let message = receiver.recv().await?;
                Some((message, (receiver, subscription)))
            },
        )
        .boxed())
    }
}
