//! In-process Graph transport for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{GraphError, GraphMethod, GraphRequest, GraphResponse, GraphTransport, UsageReport};

type Key = (GraphMethod, String);
type Reply = Result<GraphResponse, GraphError>;
type Handler = Box<dyn Fn(&GraphRequest) -> Reply + Send + Sync>;

/// Answers requests by method and path. One-shot replies are consumed in
/// order before the standing reply for the same key is used.
#[derive(Default)]
pub struct FakeGraph {
    once: Mutex<HashMap<Key, VecDeque<Reply>>>,
    standing: Mutex<HashMap<Key, Reply>>,
    handlers: Mutex<HashMap<Key, Handler>>,
    requests: Mutex<Vec<GraphRequest>>,
}

impl FakeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(method: GraphMethod, path: &str) -> Key {
        (method, path.trim_start_matches('/').to_string())
    }

    pub fn on(&self, method: GraphMethod, path: &str, body: Value) {
        self.reply(method, path, Ok(GraphResponse::new(body)));
    }

    pub fn on_with_usage(&self, method: GraphMethod, path: &str, body: Value, usage: UsageReport) {
        self.reply(method, path, Ok(GraphResponse { body, usage }));
    }

    pub fn on_error(&self, method: GraphMethod, path: &str, error: GraphError) {
        self.reply(method, path, Err(error));
    }

    pub fn reply(&self, method: GraphMethod, path: &str, reply: Reply) {
        self.standing
            .lock()
            .unwrap()
            .insert(Self::key(method, path), reply);
    }

    pub fn on_once(&self, method: GraphMethod, path: &str, body: Value) {
        self.reply_once(method, path, Ok(GraphResponse::new(body)));
    }

    pub fn error_once(&self, method: GraphMethod, path: &str, error: GraphError) {
        self.reply_once(method, path, Err(error));
    }

    pub fn reply_once(&self, method: GraphMethod, path: &str, reply: Reply) {
        self.once
            .lock()
            .unwrap()
            .entry(Self::key(method, path))
            .or_default()
            .push_back(reply);
    }

    pub fn on_fn<F>(&self, method: GraphMethod, path: &str, handler: F)
    where
        F: Fn(&GraphRequest) -> Reply + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(Self::key(method, path), Box::new(handler));
    }

    pub fn requests(&self) -> Vec<GraphRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<GraphRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path.trim_start_matches('/'))
            .collect()
    }

    pub fn rate_limited(code: i64) -> GraphError {
        GraphError::RateLimited {
            code,
            message: "User request limit reached".to_string(),
            retry_after: None,
        }
    }
}

#[async_trait]
impl GraphTransport for FakeGraph {
    async fn call(&self, request: GraphRequest) -> Result<GraphResponse, GraphError> {
        self.requests.lock().unwrap().push(request.clone());
        let key = Self::key(request.method, &request.path);

        if let Some(reply) = self
            .once
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        if let Some(handler) = self.handlers.lock().unwrap().get(&key) {
            return handler(&request);
        }
        if let Some(reply) = self.standing.lock().unwrap().get(&key) {
            return reply.clone();
        }

        Err(GraphError::Api {
            status: 404,
            code: 803,
            subcode: None,
            message: format!("no fake reply for {} {}", request.method, request.path),
        })
    }
}
