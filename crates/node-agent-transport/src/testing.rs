//! In-memory transport for loop tests.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::{Correlation, Transport, TransportError};

#[derive(Default)]
pub struct RecordingTransport {
    posts: Mutex<Vec<(Instant, Value)>>,
    responses: Mutex<VecDeque<Result<Option<Value>, ()>>>,
    fail_posts: AtomicBool,
    pub gets: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_posts(&self, fail: bool) {
        self.fail_posts.store(fail, Ordering::SeqCst);
    }

    /// Queue a GET outcome; `None` makes that GET fail.
    pub fn push_response(&self, response: Option<Value>) {
        self.responses.lock().unwrap().push_back(response.map(Some).ok_or(()));
    }

    /// Queue a GET that succeeds with an empty or non-JSON body.
    pub fn push_empty(&self) {
        self.responses.lock().unwrap().push_back(Ok(None));
    }

    pub fn posts(&self) -> Vec<Value> {
        self.posts.lock().unwrap().iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn post_times(&self) -> Vec<Instant> {
        self.posts.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    /// Every message of every POST, in send order.
    pub fn posted_messages(&self) -> Vec<Value> {
        self.posts()
            .into_iter()
            .flat_map(|p| p["messages"].as_array().cloned().unwrap_or_default())
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn get(&self, _correlation: &Correlation) -> Result<Option<Value>, TransportError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(body)) => Ok(body),
            Some(Err(())) => Err(TransportError::new("mock://manager")),
            None => std::future::pending().await,
        }
    }

    async fn post(&self, body: &Value) -> Result<Option<Value>, TransportError> {
        self.posts
            .lock()
            .unwrap()
            .push((Instant::now(), body.clone()));
        if self.fail_posts.load(Ordering::SeqCst) {
            Err(TransportError::new("mock://manager"))
        } else {
            Ok(None)
        }
    }
}
