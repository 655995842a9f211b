//! Scripted transport shared by the adapter integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flowhub_core::adapters::transport::{HttpRequest, HttpResponse, Method, Transport};
use flowhub_core::events::EventCallback;
use flowhub_core::models::Event;
use flowhub_core::Result;

pub const N8N_BASE: &str = "https://n8n.test/api/v1";
pub const MAKE_BASE: &str = "https://eu1.make.test/api/v2";

struct Route {
    method: Method,
    path: String,
    /// Only answer requests carrying this query parameter
    query: Option<(String, String)>,
    /// Played in order; the last one repeats
    responses: VecDeque<HttpResponse>,
}

/// Transport double answering by method and URL path
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer `method path` with `status`/`body` until replaced
    pub fn on(&self, method: Method, path: &str, status: u16, body: &str) {
        self.on_sequence(method, path, &[(status, body)]);
    }

    /// Answer with each response in turn, repeating the last
    pub fn on_sequence(&self, method: Method, path: &str, responses: &[(u16, &str)]) {
        self.install(method, path, None, responses);
    }

    /// Answer `method path?key=value`; takes precedence over a plain route
    pub fn on_query(
        &self,
        method: Method,
        path: &str,
        (key, value): (&str, &str),
        status: u16,
        body: &str,
    ) {
        let query = Some((key.to_string(), value.to_string()));
        self.install(method, path, query, &[(status, body)]);
    }

    fn install(
        &self,
        method: Method,
        path: &str,
        query: Option<(String, String)>,
        responses: &[(u16, &str)],
    ) {
        let mut routes = self.routes.lock().unwrap();
        routes.retain(|r| !(r.method == method && r.path == path && r.query == query));
        routes.push(Route {
            method,
            path: path.to_string(),
            query,
            responses: responses
                .iter()
                .map(|(status, body)| HttpResponse::new(*status, *body))
                .collect(),
        });
    }

    pub fn requests_to(&self, method: Method, path: &str) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && path_of(&r.url) == path)
            .cloned()
            .collect()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn calls_to(&self, method: Method, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && path_of(&r.url) == path)
            .count()
    }

    pub fn last_request_to(&self, method: Method, path: &str) -> Option<HttpRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.method == method && path_of(&r.url) == path)
            .cloned()
    }
}

fn path_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let path = path_of(&request.url);

        let mut routes = self.routes.lock().unwrap();
        let mut candidates: Vec<&mut Route> = routes
            .iter_mut()
            .filter(|r| r.method == request.method && r.path == path)
            .filter(|r| match &r.query {
                Some((key, value)) => request.query_value(key) == Some(value.as_str()),
                None => true,
            })
            .collect();
        candidates.sort_by_key(|r| r.query.is_none());
        let Some(route) = candidates.into_iter().next() else {
            return Ok(HttpResponse::new(404, format!("no route for {}", path)));
        };

        let response = if route.responses.len() > 1 {
            route.responses.pop_front()
        } else {
            route.responses.front().cloned()
        };
        Ok(response.unwrap_or_else(|| HttpResponse::new(500, "empty route")))
    }
}

/// Callback that records every event it receives
pub fn recorder() -> (EventCallback, Arc<Mutex<Vec<Event>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: EventCallback = Arc::new(move |event: &Event| {
        sink.lock().unwrap().push(event.clone());
    });
    (callback, events)
}
