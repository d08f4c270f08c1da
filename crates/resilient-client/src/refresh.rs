//! Single-flight credential refresh
//!
//! However many requests hit a 401 at once, at most one refresh call is in
//! flight. Every caller that arrives while it runs awaits the same shared
//! result. The refresh itself runs on its own task, so it completes and
//! persists even if every waiter is dropped.
//!
//! Also hosts the proactive background refresh task, which renews the
//! credential shortly before its advisory expiry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use common::Secret;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use session_auth::{Credential, CredentialStore, RefreshTransport, now_millis};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Side effect run once per session loss (e.g. return to the login screen).
pub type SessionExpiredHook = Arc<dyn Fn() + Send + Sync>;

type InFlight = Shared<BoxFuture<'static, Result<Credential>>>;

#[derive(Default)]
struct RefreshState {
    in_flight: Option<InFlight>,
    generation: u64,
    /// Access token of the credential most recently installed through this
    /// coordinator. A 401 carrying any other token is already stale.
    current_access: Option<Secret<String>>,
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn RefreshTransport>,
    on_session_expired: Option<SessionExpiredHook>,
    state: Mutex<RefreshState>,
    waiters: AtomicUsize,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_refresh(&self) -> Result<Credential> {
        let Some(current) = self.store.get().await else {
            warn!("no stored credential to refresh, ending session");
            metrics::record_refresh("failure");
            return Err(self.expire().await);
        };

        let started = Instant::now();
        match self.transport.refresh(current.refresh_token.expose()).await {
            Ok(token) => {
                let credential =
                    Credential::from_token_response(token, &current.refresh_token, now_millis());
                if let Err(e) = self.store.set(credential.clone()).await {
                    warn!(error = %e, "failed to persist refreshed credential");
                }
                metrics::record_refresh("success");
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    expires_at = credential.expires_at,
                    "credential refreshed"
                );
                Ok(credential)
            }
            Err(session_auth::Error::InvalidCredentials(msg)) => {
                warn!(error = %msg, "refresh token rejected, ending session");
                metrics::record_refresh("failure");
                Err(self.expire().await)
            }
            Err(e) => {
                warn!(error = %e, "credential refresh failed, ending session");
                metrics::record_refresh("failure");
                Err(self.expire().await)
            }
        }
    }

    async fn expire(&self) -> Error {
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to clear credential store");
        }
        if let Some(hook) = &self.on_session_expired {
            hook();
        }
        Error::SessionExpired
    }
}

/// Decrements the waiter count when a caller stops waiting, however it stops.
struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serializes credential refreshes across concurrent requests.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<dyn CredentialStore>, transport: Arc<dyn RefreshTransport>) -> Self {
        Self::build(store, transport, None)
    }

    /// Coordinator that runs `hook` whenever a refresh fails and the session ends.
    pub fn with_session_expired_hook(
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn RefreshTransport>,
        hook: SessionExpiredHook,
    ) -> Self {
        Self::build(store, transport, Some(hook))
    }

    fn build(
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn RefreshTransport>,
        on_session_expired: Option<SessionExpiredHook>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                on_session_expired,
                state: Mutex::new(RefreshState::default()),
                waiters: AtomicUsize::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.lock_state().in_flight.is_some()
    }

    /// Callers currently awaiting a refresh result.
    pub fn waiting(&self) -> usize {
        self.inner.waiters.load(Ordering::SeqCst)
    }

    /// Refresh unconditionally, joining one already in flight.
    pub async fn refresh(&self) -> Result<Credential> {
        self.refresh_stale(None).await
    }

    /// Refresh after `stale` was rejected by the server.
    ///
    /// If a refresh is in flight the caller joins it. If the coordinator has
    /// since installed a different access token, that credential is returned
    /// without another round trip.
    pub async fn refresh_stale(&self, stale: Option<&Secret<String>>) -> Result<Credential> {
        let shared = {
            let mut state = self.inner.lock_state();
            if let Some(shared) = &state.in_flight {
                debug!("joining in-flight credential refresh");
                Some(shared.clone())
            } else {
                let superseded = match (stale, &state.current_access) {
                    (Some(stale), Some(current)) => stale != current,
                    _ => false,
                };
                if superseded {
                    None
                } else {
                    Some(self.start(&mut state))
                }
            }
        };

        let Some(shared) = shared else {
            debug!("rejected token already superseded, reusing current credential");
            return self.inner.store.get().await.ok_or(Error::SessionExpired);
        };

        let _waiter = WaiterGuard::enter(&self.inner.waiters);
        shared.await
    }

    fn start(&self, state: &mut RefreshState) -> InFlight {
        state.generation += 1;
        let generation = state.generation;
        let inner = Arc::clone(&self.inner);

        let task = tokio::spawn(async move {
            let outcome = inner.run_refresh().await;
            {
                let mut state = inner.lock_state();
                if state.generation == generation {
                    state.in_flight = None;
                }
                state.current_access = outcome.as_ref().ok().map(|c| c.access_token.clone());
            }
            outcome
        });

        let shared = async move {
            task.await
                .unwrap_or_else(|e| Err(Error::Unknown(format!("refresh task failed: {e}"))))
        }
        .boxed()
        .shared();
        state.in_flight = Some(shared.clone());
        shared
    }

    /// Persist a credential obtained outside the refresh flow (login).
    pub async fn install(&self, credential: Credential) -> Result<()> {
        let access = credential.access_token.clone();
        self.inner
            .store
            .set(credential)
            .await
            .map_err(|e| Error::Unknown(format!("persisting credential: {e}")))?;
        self.inner.lock_state().current_access = Some(access);
        Ok(())
    }

    /// Forget the current credential (logout). Does not run the session hook.
    pub async fn revoke(&self) -> Result<()> {
        self.inner.lock_state().current_access = None;
        self.inner
            .store
            .clear()
            .await
            .map_err(|e| Error::Unknown(format!("clearing credential: {e}")))
    }

    /// Refresh if the stored credential expires within `threshold`.
    ///
    /// Returns `None` when there is no credential or it is not yet due.
    pub async fn refresh_if_expiring(&self, threshold: Duration) -> Option<Result<Credential>> {
        let credential = self.inner.store.get().await?;
        if !credential.expires_within(threshold, now_millis()) {
            return None;
        }
        debug!(
            expires_at = credential.expires_at,
            "credential expiring within threshold, refreshing"
        );
        Some(self.refresh_stale(Some(&credential.access_token)).await)
    }
}

/// Spawn a background task that proactively refreshes an expiring credential.
///
/// Runs every `interval`; the first tick is skipped since the credential was
/// just loaded. A failed refresh ends the session like any other refresh
/// failure, so the task only logs.
pub fn spawn_refresh_task(
    coordinator: RefreshCoordinator,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match coordinator.refresh_if_expiring(threshold).await {
                None => debug!("credential not due for refresh"),
                Some(Ok(_)) => info!("background credential refresh succeeded"),
                Some(Err(e)) => warn!(error = %e, "background credential refresh failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_auth::{MemoryCredentialStore, TokenResponse};
    use std::future::Future;
    use std::pin::Pin;

    struct ScriptedRefresh {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl ScriptedRefresh {
        fn new(delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                fail,
            })
        }

        fn calls(&self) -> usize {
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
                if self.fail {
                    return Err(session_auth::Error::InvalidCredentials("revoked".into()));
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

    fn store_with(access: &str) -> Arc<MemoryCredentialStore> {
        Arc::new(MemoryCredentialStore::new(Some(Credential::new(
            access,
            "rt_0",
            now_millis() + 60_000,
        ))))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_share_one_call() {
        let store = store_with("at_0");
        let transport = ScriptedRefresh::new(Duration::from_millis(50), false);
        let coordinator = RefreshCoordinator::new(store.clone(), transport.clone());
        let stale = Secret::from("at_0");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coordinator = coordinator.clone();
            let stale = stale.clone();
            handles.push(tokio::spawn(async move {
                coordinator.refresh_stale(Some(&stale)).await
            }));
        }

        for handle in handles {
            let credential = handle.await.unwrap().unwrap();
            assert_eq!(credential.access_token.expose(), "at_1");
        }
        assert_eq!(transport.calls(), 1);
        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.waiting(), 0);

        let stored = store.get().await.unwrap();
        assert_eq!(stored.access_token.expose(), "at_1");
        assert_eq!(stored.refresh_token.expose(), "rt_1");
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_token_skips_refresh() {
        let store = store_with("at_0");
        let transport = ScriptedRefresh::new(Duration::ZERO, false);
        let coordinator = RefreshCoordinator::new(store, transport.clone());

        coordinator.refresh().await.unwrap();
        let again = coordinator
            .refresh_stale(Some(&Secret::from("at_0")))
            .await
            .unwrap();
        assert_eq!(again.access_token.expose(), "at_1");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_refreshes_each_call_transport() {
        let store = store_with("at_0");
        let transport = ScriptedRefresh::new(Duration::ZERO, false);
        let coordinator = RefreshCoordinator::new(store, transport.clone());

        coordinator.refresh().await.unwrap();
        let second = coordinator.refresh().await.unwrap();
        assert_eq!(second.access_token.expose(), "at_2");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_clears_store_and_fires_hook_once() {
        let store = store_with("at_0");
        let transport = ScriptedRefresh::new(Duration::from_millis(10), true);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let coordinator = RefreshCoordinator::with_session_expired_hook(
            store.clone(),
            transport.clone(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let a = coordinator.clone();
        let b = coordinator.clone();
        let (ra, rb) = tokio::join!(a.refresh(), b.refresh());
        assert_eq!(ra.unwrap_err(), Error::SessionExpired);
        assert_eq!(rb.unwrap_err(), Error::SessionExpired);
        assert_eq!(transport.calls(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(store.get().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credential_is_session_expired() {
        let store = Arc::new(MemoryCredentialStore::new(None));
        let transport = ScriptedRefresh::new(Duration::ZERO, false);
        let coordinator = RefreshCoordinator::new(store, transport.clone());

        assert_eq!(coordinator.refresh().await.unwrap_err(), Error::SessionExpired);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_refreshing_and_waiters_while_in_flight() {
        let store = store_with("at_0");
        let transport = ScriptedRefresh::new(Duration::from_secs(1), false);
        let coordinator = RefreshCoordinator::new(store, transport);

        let first = tokio::spawn({
            let c = coordinator.clone();
            async move { c.refresh().await }
        });
        let second = tokio::spawn({
            let c = coordinator.clone();
            async move { c.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(coordinator.is_refreshing());
        assert_eq!(coordinator.waiting(), 2);

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_completes_when_waiter_is_dropped() {
        let store = store_with("at_0");
        let transport = ScriptedRefresh::new(Duration::from_millis(100), false);
        let coordinator = RefreshCoordinator::new(store.clone(), transport.clone());

        let waiter = tokio::spawn({
            let c = coordinator.clone();
            async move { c.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.calls(), 1);
        assert_eq!(store.get().await.unwrap().access_token.expose(), "at_1");
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_if_expiring_respects_threshold() {
        let store = Arc::new(MemoryCredentialStore::new(Some(Credential::new(
            "at_0",
            "rt_0",
            now_millis() + 3_600_000,
        ))));
        let transport = ScriptedRefresh::new(Duration::ZERO, false);
        let coordinator = RefreshCoordinator::new(store.clone(), transport.clone());

        assert!(coordinator
            .refresh_if_expiring(Duration::from_secs(300))
            .await
            .is_none());
        assert_eq!(transport.calls(), 0);

        let refreshed = coordinator
            .refresh_if_expiring(Duration::from_secs(7200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.access_token.expose(), "at_1");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn install_and_revoke_update_store() {
        let store = Arc::new(MemoryCredentialStore::new(None));
        let transport = ScriptedRefresh::new(Duration::ZERO, false);
        let coordinator = RefreshCoordinator::new(store.clone(), transport);

        coordinator
            .install(Credential::new("at_login", "rt_login", now_millis() + 60_000))
            .await
            .unwrap();
        assert_eq!(store.get().await.unwrap().access_token.expose(), "at_login");

        coordinator.revoke().await.unwrap();
        assert!(store.get().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_refreshes_expiring_credential() {
        let store = Arc::new(MemoryCredentialStore::new(Some(Credential::new(
            "at_0",
            "rt_0",
            now_millis() + 1_000,
        ))));
        let transport = ScriptedRefresh::new(Duration::ZERO, false);
        let coordinator = RefreshCoordinator::new(store.clone(), transport.clone());

        let handle = spawn_refresh_task(
            coordinator,
            Duration::from_secs(60),
            Duration::from_secs(300),
        );
        tokio::time::sleep(Duration::from_secs(61)).await;
        handle.abort();

        assert_eq!(transport.calls(), 1);
        assert_eq!(store.get().await.unwrap().access_token.expose(), "at_1");
    }
}
