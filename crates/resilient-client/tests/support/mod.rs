//! Scripted transport, refresh endpoint and client harness shared by the
//! integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Method;
use reqwest::header::AUTHORIZATION;
use resilient_client::{
    Client, ClientConfig, Priority, RequestDescriptor, RequestOptions, WatchConnectivity,
};
use session_auth::{Credential, MemoryCredentialStore, RefreshTransport, TokenResponse, now_millis};
use transport::{Body, Transport, TransportError, TransportRequest, TransportResponse};

/// What the scripted server does with one call.
pub enum Step {
    Reply(TransportResponse),
    Fail(TransportError),
    After(Duration, Box<Step>),
}

pub fn reply(status: u16, body: &str) -> Step {
    Step::Reply(TransportResponse::new(status, body.to_string()))
}

pub fn fail_connect() -> Step {
    Step::Fail(TransportError::Connect("connection refused".into()))
}

#[derive(Debug, Clone)]
pub struct Call {
    pub index: usize,
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub at: tokio::time::Instant,
}

type Handler = dyn Fn(&Call) -> Step + Send + Sync;

pub struct ScriptedTransport {
    handler: Box<Handler>,
    calls: Mutex<Vec<Call>>,
    completed: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(handler: impl Fn(&Call) -> Step + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            completed: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Calls whose send future ran to the end, whoever was still listening.
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn paths(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.path).collect()
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = transport::Result<TransportResponse>> + Send + '_>> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let call = Call {
                index: calls.len(),
                method: request.method.clone(),
                path: request.path.clone(),
                authorization: request
                    .headers
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                at: tokio::time::Instant::now(),
            };
            calls.push(call.clone());
            call
        };
        let step = (self.handler)(&call);
        let completed = self.completed.clone();
        Box::pin(async move {
            let mut step = step;
            let result = loop {
                match step {
                    Step::Reply(response) => break Ok(response),
                    Step::Fail(error) => break Err(error),
                    Step::After(delay, next) => {
                        tokio::time::sleep(delay).await;
                        step = *next;
                    }
                }
            };
            completed.fetch_add(1, Ordering::SeqCst);
            result
        })
    }
}

/// Token endpoint issuing `at_N` / `rt_N` on the Nth call.
pub struct ScriptedRefresh {
    calls: AtomicUsize,
    delay: Duration,
    fail: AtomicBool,
}

impl ScriptedRefresh {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            fail: AtomicBool::new(false),
        })
    }

    pub fn failing(delay: Duration) -> Arc<Self> {
        let refresh = Self::new(delay);
        refresh.fail.store(true, Ordering::SeqCst);
        refresh
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RefreshTransport for ScriptedRefresh {
    fn refresh<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<TokenResponse>> + Send + 'a>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(session_auth::Error::InvalidCredentials("refresh token revoked".into()));
            }
            Ok(TokenResponse {
                access_token: format!("at_{n}"),
                refresh_token: Some(format!("rt_{n}")),
                expires_in: 3600,
                token_type: None,
            })
        })
    }
}

pub struct Harness {
    pub client: Client,
    pub transport: Arc<ScriptedTransport>,
    pub refresh: Arc<ScriptedRefresh>,
    pub store: Arc<MemoryCredentialStore>,
    pub connectivity: Arc<WatchConnectivity>,
    pub expired: Arc<AtomicUsize>,
}

impl Harness {
    pub fn expired_count(&self) -> usize {
        self.expired.load(Ordering::SeqCst)
    }
}

/// Deterministic config: no jitter, short batch pause.
pub fn config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.retry.jitter_pct = 0;
    config.queue.batch_delay_ms = 100;
    config
}

pub fn harness(
    config: ClientConfig,
    transport: Arc<ScriptedTransport>,
    refresh: Arc<ScriptedRefresh>,
) -> Harness {
    let store = Arc::new(MemoryCredentialStore::new(Some(Credential::new(
        "at_0",
        "rt_0",
        now_millis() + 3_600_000,
    ))));
    let connectivity = Arc::new(WatchConnectivity::new(true));
    let expired = Arc::new(AtomicUsize::new(0));
    let counter = expired.clone();

    let client = Client::builder(
        transport.clone(),
        store.clone(),
        refresh.clone(),
        connectivity.clone(),
    )
    .config(config)
    .on_session_expired(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .build();

    Harness {
        client,
        transport,
        refresh,
        store,
        connectivity,
        expired,
    }
}

pub fn offline_request(path: &str, priority: Priority) -> RequestDescriptor {
    RequestDescriptor::new(
        Method::POST,
        path,
        Body::Empty,
        RequestOptions::default().offline().priority(priority),
    )
}

pub fn request(path: &str) -> RequestDescriptor {
    RequestDescriptor::new(Method::GET, path, Body::Empty, RequestOptions::default())
}

/// Let spawned request tasks run up to their next real wait.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
