//! Request executor
//!
//! Drives one logical request through its lifecycle: connectivity check,
//! credential attach, send, classify, then either settle, refresh and resend,
//! back off and retry, or park in the offline queue. Every request settles
//! exactly once with a response or one `Error` kind.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use common::Secret;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use session_auth::{Credential, CredentialStore, RefreshTransport};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use transport::{
    Body, ErrorClassification, Transport, TransportRequest, classify_response,
    classify_transport_error,
};

use crate::Response;
use crate::config::ClientConfig;
use crate::connectivity::{ConnectivityMonitor, wait_for_connection};
use crate::descriptor::{RequestDescriptor, RequestOptions};
use crate::error::{Error, Result};
use crate::handle::{RequestHandle, request_channel};
use crate::metrics;
use crate::queue::{DrainReport, QueuedEntry, Replay, RequestQueue};
use crate::refresh::{self, RefreshCoordinator, SessionExpiredHook};
use crate::retry::RetryPolicy;
use crate::timeout::RttTracker;

/// Diagnostics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    /// Requests currently waiting on a shared credential refresh
    pub queue_size: usize,
    /// Requests parked until connectivity returns
    pub offline_queue_size: usize,
    pub is_refreshing: bool,
}

pub struct ClientBuilder {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    refresh: Arc<dyn RefreshTransport>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    on_session_expired: Option<SessionExpiredHook>,
}

impl ClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Run `hook` when the session ends because a refresh failed.
    pub fn on_session_expired(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_session_expired = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Client {
        let queue = Arc::new(RequestQueue::new(&self.config.queue));

        // A failed refresh ends the session: nothing parked can succeed any more.
        let session_hook: SessionExpiredHook = {
            let queue = queue.clone();
            let user_hook = self.on_session_expired;
            Arc::new(move || {
                queue.clear(Error::SessionExpired);
                if let Some(hook) = &user_hook {
                    hook();
                }
            })
        };
        let refresher =
            RefreshCoordinator::with_session_expired_hook(self.store, self.refresh, session_hook);

        Client {
            inner: Arc::new(ClientInner {
                policy: RetryPolicy::from(&self.config.retry),
                rtt: RttTracker::new(&self.config.timeout),
                config: self.config,
                transport: self.transport,
                refresher,
                queue,
                connectivity: self.connectivity,
            }),
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    refresher: RefreshCoordinator,
    queue: Arc<RequestQueue>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    policy: RetryPolicy,
    rtt: RttTracker,
}

/// Resilient client. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        refresh: Arc<dyn RefreshTransport>,
        connectivity: Arc<dyn ConnectivityMonitor>,
    ) -> ClientBuilder {
        ClientBuilder {
            config: ClientConfig::default(),
            transport,
            store,
            refresh,
            connectivity,
            on_session_expired: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.inner.refresher
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connectivity.is_connected()
    }

    /// Start a request and return a handle to await or cancel it.
    pub fn submit(&self, descriptor: RequestDescriptor) -> RequestHandle {
        let (handle, responder, cancel) = request_channel(descriptor.id, self.inner.queue.clone());
        let client = self.clone();
        tokio::spawn(async move {
            match client.run(descriptor, cancel.clone()).await {
                Replay::Finished(result) => responder.send(result),
                Replay::Offline(descriptor) => {
                    client.park(QueuedEntry::new(descriptor, responder, cancel));
                }
            }
        });
        handle
    }

    pub async fn execute(&self, descriptor: RequestDescriptor) -> Result<Response> {
        self.submit(descriptor).response().await
    }

    /// Execute and decode the JSON body.
    pub async fn execute_json<T: DeserializeOwned>(&self, descriptor: RequestDescriptor) -> Result<T> {
        let response = self.execute(descriptor).await?;
        response
            .json()
            .map_err(|e| Error::Unknown(format!("decoding response body: {e}")))
    }

    pub async fn get(&self, path: &str, options: RequestOptions) -> Result<Response> {
        self.execute(RequestDescriptor::new(Method::GET, path, Body::Empty, options))
            .await
    }

    pub async fn post(&self, path: &str, body: Body, options: RequestOptions) -> Result<Response> {
        self.execute(RequestDescriptor::new(Method::POST, path, body, options))
            .await
    }

    pub async fn put(&self, path: &str, body: Body, options: RequestOptions) -> Result<Response> {
        self.execute(RequestDescriptor::new(Method::PUT, path, body, options))
            .await
    }

    pub async fn patch(&self, path: &str, body: Body, options: RequestOptions) -> Result<Response> {
        self.execute(RequestDescriptor::new(Method::PATCH, path, body, options))
            .await
    }

    pub async fn delete(&self, path: &str, options: RequestOptions) -> Result<Response> {
        self.execute(RequestDescriptor::new(Method::DELETE, path, Body::Empty, options))
            .await
    }

    /// POST a raw payload with the upload timeout floor.
    pub async fn upload(
        &self,
        path: &str,
        content_type: &str,
        data: Bytes,
        options: RequestOptions,
    ) -> Result<Response> {
        self.execute(RequestDescriptor::upload(
            Method::POST,
            path,
            content_type,
            data,
            options,
        ))
        .await
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            queue_size: self.inner.refresher.waiting(),
            offline_queue_size: self.inner.queue.size(),
            is_refreshing: self.inner.refresher.is_refreshing(),
        }
    }

    /// Install a freshly issued credential.
    pub async fn login(&self, credential: Credential) -> Result<()> {
        self.inner.refresher.install(credential).await?;
        info!("session started");
        Ok(())
    }

    /// End the session and settle every parked request with `SessionExpired`.
    pub async fn logout(&self) -> Result<()> {
        self.inner.refresher.revoke().await?;
        let cleared = self.inner.queue.clear(Error::SessionExpired);
        info!(cleared, "session ended");
        Ok(())
    }

    /// Replay the offline queue. `None` if a drain is already running.
    pub async fn drain(&self) -> Option<DrainReport> {
        let client = self.clone();
        let connectivity = self.inner.connectivity.clone();
        self.inner
            .queue
            .drain(
                move |descriptor, cancel| {
                    let client = client.clone();
                    async move { client.run(descriptor, cancel).await }
                },
                move || connectivity.is_connected(),
            )
            .await
    }

    /// Drain the offline queue on every offline-to-online transition.
    pub fn spawn_reconnect_listener(&self) -> JoinHandle<()> {
        let client = self.clone();
        let mut rx = self.inner.connectivity.subscribe();
        tokio::spawn(async move {
            let mut was_connected = *rx.borrow_and_update();
            while rx.changed().await.is_ok() {
                let connected = *rx.borrow_and_update();
                if connected && !was_connected {
                    let queued = client.inner.queue.size();
                    info!(queued, "connectivity restored");
                    if queued > 0 {
                        let client = client.clone();
                        tokio::spawn(async move {
                            client.drain().await;
                        });
                    }
                }
                was_connected = connected;
            }
        })
    }

    /// Proactively refresh the credential before it expires.
    pub fn spawn_refresh_task(&self) -> JoinHandle<()> {
        let settings = &self.inner.config.refresh;
        refresh::spawn_refresh_task(
            self.inner.refresher.clone(),
            Duration::from_secs(settings.interval_secs),
            Duration::from_secs(settings.threshold_secs),
        )
    }

    fn park(&self, entry: QueuedEntry) {
        let id = entry.id();
        if self.inner.queue.enqueue(entry).is_err() {
            return;
        }
        info!(request_id = %id, depth = self.inner.queue.size(), "request queued until connectivity returns");

        // Connectivity may have come back while the request was in flight.
        if self.inner.connectivity.is_connected() && !self.inner.queue.is_draining() {
            let client = self.clone();
            tokio::spawn(async move {
                client.drain().await;
            });
        }
    }

    async fn run(&self, descriptor: RequestDescriptor, cancel: CancellationToken) -> Replay {
        let span = info_span!(
            "request",
            request_id = %descriptor.id,
            method = %descriptor.method,
            path = %descriptor.path,
        );
        let created_at = descriptor.created_at;
        let outcome = self.run_attempts(descriptor, cancel).instrument(span).await;
        if let Replay::Finished(result) = &outcome {
            let label = match result {
                Ok(_) => "success",
                Err(e) => e.kind(),
            };
            metrics::record_request(label, created_at.elapsed().as_secs_f64());
        }
        outcome
    }

    async fn run_attempts(
        &self,
        mut descriptor: RequestDescriptor,
        cancel: CancellationToken,
    ) -> Replay {
        let policy = self.inner.policy.for_descriptor(&descriptor);
        let mut refreshed = false;

        loop {
            if cancel.is_cancelled() {
                return Replay::Finished(Err(Error::Cancelled));
            }

            if !self.inner.connectivity.is_connected() {
                if descriptor.offline_eligible {
                    debug!("offline, deferring request");
                    return Replay::Offline(descriptor);
                }
                let wait = self.inner.config.connection_wait();
                let connected = tokio::select! {
                    connected = wait_for_connection(self.inner.connectivity.as_ref(), wait) => connected,
                    _ = cancel.cancelled() => return Replay::Finished(Err(Error::Cancelled)),
                };
                if !connected {
                    warn!(wait_ms = wait.as_millis() as u64, "no connectivity, failing request");
                    return Replay::Finished(Err(Error::NetworkUnreachable(
                        "device is offline".into(),
                    )));
                }
            }

            let (request, sent_token) = match self.prepare(&descriptor).await {
                Ok(prepared) => prepared,
                Err(e) => return Replay::Finished(Err(e)),
            };

            debug!(attempt = descriptor.attempt, timeout_ms = request.timeout.as_millis() as u64, "sending");
            let started = Instant::now();
            // A call already on the wire runs to completion; on cancel its
            // result is dropped.
            let mut send = self.inner.transport.send(request);
            let sent = tokio::select! {
                sent = &mut send => sent,
                _ = cancel.cancelled() => {
                    debug!("cancelled while sending, discarding the result");
                    let _ = send.await;
                    return Replay::Finished(Err(Error::Cancelled));
                }
            };

            let (classification, detail) = match sent {
                Ok(response) => {
                    self.inner.rtt.record(started.elapsed());
                    if response.is_success() {
                        return Replay::Finished(self.check_business(response));
                    }
                    (classify_response(&response), response.text())
                }
                Err(e) => (classify_transport_error(&e), e.to_string()),
            };

            match classification {
                ErrorClassification::Unauthorized if !descriptor.skip_auth => {
                    if refreshed {
                        warn!("refreshed credential rejected, ending request");
                        return Replay::Finished(Err(Error::SessionExpired));
                    }
                    refreshed = true;
                    debug!("credential rejected, refreshing");
                    let refresh = tokio::select! {
                        refresh = self.inner.refresher.refresh_stale(sent_token.as_ref()) => refresh,
                        _ = cancel.cancelled() => return Replay::Finished(Err(Error::Cancelled)),
                    };
                    if let Err(e) = refresh {
                        return Replay::Finished(Err(e));
                    }
                    continue;
                }
                ErrorClassification::NetworkUnreachable
                    if descriptor.offline_eligible && !self.inner.connectivity.is_connected() =>
                {
                    debug!(error = %detail, "connectivity lost mid-request, deferring");
                    return Replay::Offline(descriptor);
                }
                _ => {}
            }

            let decision = policy.decide(&classification, descriptor.attempt);
            if !decision.retry {
                debug!(
                    attempt = descriptor.attempt,
                    classification = classification.label(),
                    "request failed"
                );
                return Replay::Finished(Err(Error::from_classification(classification, &detail)));
            }

            metrics::record_retry(classification.label());
            warn!(
                attempt = descriptor.attempt,
                classification = classification.label(),
                delay_ms = decision.delay.as_millis() as u64,
                "attempt failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(decision.delay) => {}
                _ = cancel.cancelled() => return Replay::Finished(Err(Error::Cancelled)),
            }
            descriptor.attempt += 1;
        }
    }

    /// Build the transport request, attaching the current credential.
    async fn prepare(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<(TransportRequest, Option<Secret<String>>)> {
        let mut headers = descriptor.headers.clone();
        let mut token = None;
        if !descriptor.skip_auth {
            if let Some(credential) = self.inner.refresher.store().get().await {
                let mut value = HeaderValue::from_str(&credential.authorization())
                    .map_err(|_| Error::Unknown("credential is not a valid header value".into()))?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
                token = Some(credential.access_token);
            }
        }

        let request = TransportRequest {
            method: descriptor.method.clone(),
            path: descriptor.path.clone(),
            headers,
            body: descriptor.body.clone(),
            timeout: self.inner.rtt.timeout_for(descriptor),
        };
        Ok((request, token))
    }

    /// Surface application errors carried in a 2xx body.
    fn check_business(&self, response: Response) -> Result<Response> {
        let business = &self.inner.config.business;
        let Ok(serde_json::Value::Object(body)) = response.json::<serde_json::Value>() else {
            return Ok(response);
        };

        let code = body
            .get(&business.code_field)
            .and_then(serde_json::Value::as_i64);
        let explicit_failure = body.get("success").and_then(serde_json::Value::as_bool) == Some(false);
        let bad_code = code.is_some_and(|c| !business.success_codes.contains(&c));
        if !explicit_failure && !bad_code {
            return Ok(response);
        }

        let message = body
            .get(&business.message_field)
            .and_then(serde_json::Value::as_str)
            .unwrap_or("request failed")
            .to_string();
        debug!(?code, %message, "business error in successful response");
        Err(Error::Business { code, message })
    }
}
