//! Per-backend OAuth refresh worker
//!
//! A [`Provider`] is a finite loop, not a request/response service. Each
//! iteration fetches the token status, decides how long to wait, and then
//! blocks on a single multi-way wait: the timer, the event inbox, the
//! provider's own stop signal, and the gateway's run scope. That wait is
//! the loop's only suspension point, which keeps iterations strictly
//! sequential per provider.
//!
//! Failure handling is deliberately blunt: a credential-store read error
//! or an exhausted retry budget terminates this provider only. The
//! backend stays reachable with whatever token it has until a new login
//! event recreates the worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use toolgate_core::{AuthEvent, CredentialStore, TokenStatus};

/// Attempts with an unchanged expiry before the worker gives up
pub const MAX_REFRESH_RETRIES: u32 = 7;

/// First retry wait; doubles per attempt (30s, 60s, ... 1920s)
pub const REFRESH_BACKOFF_BASE: Duration = Duration::from_secs(30);

/// Poll this much before the token actually expires
pub const EXPIRY_SLACK: Duration = Duration::from_secs(10);

/// Re-poll interval for tokens that report no expiry at all
const NO_EXPIRY_RECHECK: Duration = Duration::from_secs(3600);

/// Inbox depth; login/refresh events are rare and tiny
const INBOX_CAPACITY: usize = 16;

/// Callback into the orchestrator to republish one backend's capabilities
pub type ReloadFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// What one poll iteration decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollDecision {
    /// Retry budget exhausted with an unchanged expiry
    Terminate,
    Wait {
        duration: Duration,
        trigger_refresh: bool,
    },
}

/// Retry and wait bookkeeping, kept separate from the actor loop so the
/// schedule is testable without running workers.
#[derive(Debug, Default)]
struct RefreshSchedule {
    /// Expiry recorded by the previous refresh-triggering iteration
    last_expiry: Option<DateTime<Utc>>,
    retries: u32,
}

impl RefreshSchedule {
    fn new() -> Self {
        Self::default()
    }

    /// Feed one token-status snapshot through the schedule.
    fn observe(&mut self, status: &TokenStatus, now: DateTime<Utc>) -> PollDecision {
        if status.needs_refresh {
            if self.retries > 0 && status.expires_at == self.last_expiry {
                self.retries += 1;
            } else {
                if self.retries > 0 {
                    info!(
                        retries = self.retries,
                        "[Provider] Token expiry advanced, resetting retry counter"
                    );
                }
                self.retries = 1;
            }

            if self.retries > MAX_REFRESH_RETRIES {
                return PollDecision::Terminate;
            }

            let duration = REFRESH_BACKOFF_BASE * 2u32.pow(self.retries - 1);
            self.last_expiry = status.expires_at;
            PollDecision::Wait {
                duration,
                trigger_refresh: true,
            }
        } else {
            let duration = match status.expires_at {
                Some(expires_at) => {
                    let until_expiry = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
                    until_expiry.saturating_sub(EXPIRY_SLACK)
                }
                // No expiry reported: nothing to schedule against, so
                // re-poll on a slow cadence instead of spinning.
                None => NO_EXPIRY_RECHECK,
            };
            PollDecision::Wait {
                duration,
                trigger_refresh: false,
            }
        }
    }

    /// A login or refresh event landed: the stored credential changed.
    fn reset(&mut self) {
        self.retries = 0;
        self.last_expiry = None;
    }
}

/// Handle to one running refresh worker
pub struct Provider {
    name: String,
    inbox: mpsc::Sender<AuthEvent>,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl Provider {
    /// Spawn the refresh worker for `name`.
    ///
    /// `cancel` is the gateway's run scope; `stop()` is the narrower
    /// per-provider teardown. The worker honors whichever fires first.
    pub fn spawn(
        name: impl Into<String>,
        credentials: Arc<dyn CredentialStore>,
        reload: ReloadFn,
        cancel: CancellationToken,
    ) -> Self {
        let name = name.into();
        let stop = CancellationToken::new();
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        let worker = ProviderWorker {
            name: name.clone(),
            credentials,
            reload,
            schedule: RefreshSchedule::new(),
        };
        let handle = tokio::spawn(worker.run(inbox_rx, stop.clone(), cancel));

        Self {
            name,
            inbox: inbox_tx,
            stop,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forward an authorization event to the worker's inbox.
    pub async fn notify(&self, event: AuthEvent) {
        if self.inbox.send(event).await.is_err() {
            debug!(server = %self.name, "[Provider] Inbox closed, worker already exited");
        }
    }

    /// Clone of the inbox sender, for forwarding outside the registry lock.
    pub(crate) fn inbox_sender(&self) -> mpsc::Sender<AuthEvent> {
        self.inbox.clone()
    }

    /// Signal the worker to stop. Idempotent: the underlying signal fires
    /// exactly once no matter how often or concurrently this is called.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether the worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker task to exit (teardown/tests).
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

struct ProviderWorker {
    name: String,
    credentials: Arc<dyn CredentialStore>,
    reload: ReloadFn,
    schedule: RefreshSchedule,
}

impl ProviderWorker {
    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<AuthEvent>,
        stop: CancellationToken,
        cancel: CancellationToken,
    ) {
        info!(server = %self.name, "[Provider] Refresh worker started");

        loop {
            let status = match self.credentials.token_status(&self.name).await {
                Ok(status) => status,
                Err(e) => {
                    // Fatal for this provider; a login event recreates it.
                    error!(
                        server = %self.name,
                        "[Provider] Token status fetch failed, stopping refresh handling. \
                         Re-authorize with `toolgate login {}`: {}",
                        self.name, e
                    );
                    break;
                }
            };

            let (wait, trigger_refresh) = match self.schedule.observe(&status, Utc::now()) {
                PollDecision::Terminate => {
                    error!(
                        server = %self.name,
                        max_retries = MAX_REFRESH_RETRIES,
                        "[Provider] Refresh retries exhausted with unchanged expiry, giving up. \
                         Re-authorize with `toolgate login {}`",
                        self.name
                    );
                    break;
                }
                PollDecision::Wait {
                    duration,
                    trigger_refresh,
                } => (duration, trigger_refresh),
            };

            if trigger_refresh {
                debug!(
                    server = %self.name,
                    wait_secs = wait.as_secs(),
                    "[Provider] Token needs refresh, probing app status"
                );
                // Best-effort probe, detached on purpose: the poll loop is
                // the source of truth for retry bookkeeping, not this call.
                let credentials = Arc::clone(&self.credentials);
                let name = self.name.clone();
                tokio::spawn(async move {
                    match credentials.oauth_app(&name).await {
                        Ok(app) if !app.authorized => {
                            warn!(
                                server = %name,
                                "[Provider] OAuth app not authorized, waiting for login"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => debug!(server = %name, "[Provider] App status probe failed: {}", e),
                    }
                });
            }

            if wait.is_zero() {
                continue;
            }

            // The only suspension point in the loop: timer, inbox, stop
            // signal, run scope - first one wins.
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                event = inbox.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            debug!(server = %self.name, "[Provider] Inbox closed, exiting");
                            break;
                        }
                    }
                }
                _ = stop.cancelled() => {
                    debug!(server = %self.name, "[Provider] Stop signal received");
                    break;
                }
                _ = cancel.cancelled() => {
                    debug!(server = %self.name, "[Provider] Run scope cancelled");
                    break;
                }
            }
        }

        info!(server = %self.name, "[Provider] Refresh worker exited");
    }

    async fn handle_event(&mut self, event: AuthEvent) {
        info!(
            server = %self.name,
            kind = ?event.kind,
            "[Provider] Authorization event, reloading capabilities"
        );

        (self.reload)(self.name.clone()).await;

        if event.kind.is_credential_update() {
            self.schedule.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    use async_trait::async_trait;
    use toolgate_core::{AuthEventKind, CredentialError, OAuthAppStatus};

    fn fixed_now() -> DateTime<Utc> {
        "2026-01-15T12:00:00Z".parse().unwrap()
    }

    fn needs_refresh(expires_at: Option<DateTime<Utc>>) -> TokenStatus {
        TokenStatus {
            valid: false,
            expires_at,
            needs_refresh: true,
        }
    }

    fn valid_until(expires_at: DateTime<Utc>) -> TokenStatus {
        TokenStatus {
            valid: true,
            expires_at: Some(expires_at),
            needs_refresh: false,
        }
    }

    // ── RefreshSchedule tests ──

    #[test]
    fn test_backoff_sequence_and_termination() {
        let mut schedule = RefreshSchedule::new();
        let expiry = Some(fixed_now());

        let expected_secs = [30, 60, 120, 240, 480, 960, 1920];
        for &secs in &expected_secs {
            match schedule.observe(&needs_refresh(expiry), fixed_now()) {
                PollDecision::Wait {
                    duration,
                    trigger_refresh,
                } => {
                    assert_eq!(duration, Duration::from_secs(secs));
                    assert!(trigger_refresh);
                }
                PollDecision::Terminate => panic!("terminated before attempt budget"),
            }
        }

        // 8th iteration with the same expiry terminates instead of waiting
        assert_eq!(
            schedule.observe(&needs_refresh(expiry), fixed_now()),
            PollDecision::Terminate
        );
    }

    #[test]
    fn test_changed_expiry_resets_retry_counter() {
        let mut schedule = RefreshSchedule::new();
        let first = Some(fixed_now());

        for _ in 0..5 {
            schedule.observe(&needs_refresh(first), fixed_now());
        }
        assert_eq!(schedule.retries, 5);

        // Expiry advanced between iterations: counter restarts at 1
        let advanced = Some(fixed_now() + chrono::Duration::hours(1));
        match schedule.observe(&needs_refresh(advanced), fixed_now()) {
            PollDecision::Wait { duration, .. } => {
                assert_eq!(duration, REFRESH_BACKOFF_BASE);
            }
            PollDecision::Terminate => panic!("reset counter must not terminate"),
        }
        assert_eq!(schedule.retries, 1);
    }

    #[test]
    fn test_valid_token_wait_is_expiry_minus_slack() {
        let mut schedule = RefreshSchedule::new();
        let now = fixed_now();
        let status = valid_until(now + chrono::Duration::seconds(600));

        match schedule.observe(&status, now) {
            PollDecision::Wait {
                duration,
                trigger_refresh,
            } => {
                assert_eq!(duration, Duration::from_secs(590));
                assert!(!trigger_refresh);
            }
            PollDecision::Terminate => panic!("valid token must not terminate"),
        }
    }

    #[test]
    fn test_imminent_expiry_clamps_to_zero() {
        let mut schedule = RefreshSchedule::new();
        let now = fixed_now();
        let status = valid_until(now + chrono::Duration::seconds(5));

        match schedule.observe(&status, now) {
            PollDecision::Wait { duration, .. } => assert_eq!(duration, Duration::ZERO),
            PollDecision::Terminate => panic!("unexpected termination"),
        }
    }

    #[test]
    fn test_event_reset_restarts_backoff() {
        let mut schedule = RefreshSchedule::new();
        let expiry = Some(fixed_now());
        for _ in 0..4 {
            schedule.observe(&needs_refresh(expiry), fixed_now());
        }

        schedule.reset();
        assert_eq!(schedule.retries, 0);
        assert_eq!(schedule.last_expiry, None);

        match schedule.observe(&needs_refresh(expiry), fixed_now()) {
            PollDecision::Wait { duration, .. } => assert_eq!(duration, REFRESH_BACKOFF_BASE),
            PollDecision::Terminate => panic!("fresh schedule must not terminate"),
        }
    }

    // ── Worker tests ──

    struct ScriptedStore {
        status: Mutex<Result<TokenStatus, ()>>,
        polls: AtomicU32,
    }

    impl ScriptedStore {
        fn new(status: TokenStatus) -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(Ok(status)),
                polls: AtomicU32::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(Err(())),
                polls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl CredentialStore for ScriptedStore {
        async fn token_status(&self, server_name: &str) -> Result<TokenStatus, CredentialError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let status = *self.status.lock().await;
            status.map_err(|_| CredentialError::Store(format!("unreachable for {server_name}")))
        }

        async fn oauth_app(&self, _server_name: &str) -> Result<OAuthAppStatus, CredentialError> {
            Ok(OAuthAppStatus { authorized: true })
        }
    }

    fn noop_reload() -> ReloadFn {
        Arc::new(|_name| Box::pin(async {}))
    }

    fn counting_reload(counter: Arc<AtomicU32>) -> ReloadFn {
        Arc::new(move |_name| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_terminates_after_exhausted_retries() {
        // Constant needs_refresh with an unchanged expiry: 7 waits, then
        // the 8th poll terminates. Paused time fast-forwards the sleeps.
        let store = ScriptedStore::new(needs_refresh(Some(Utc::now())));
        let provider = Provider::spawn(
            "github",
            store.clone(),
            noop_reload(),
            CancellationToken::new(),
        );

        tokio::time::timeout(Duration::from_secs(7200), provider.join())
            .await
            .expect("worker terminates on its own");
        assert_eq!(store.polls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_terminates_on_store_error() {
        let store = ScriptedStore::failing();
        let provider = Provider::spawn(
            "github",
            store.clone(),
            noop_reload(),
            CancellationToken::new(),
        );

        tokio::time::timeout(Duration::from_secs(10), provider.join())
            .await
            .expect("fetch error is fatal for the provider");
        assert_eq!(store.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let store = ScriptedStore::new(valid_until(Utc::now() + chrono::Duration::hours(2)));
        let provider = Provider::spawn(
            "github",
            store,
            noop_reload(),
            CancellationToken::new(),
        );

        provider.stop();
        provider.stop();
        provider.stop();

        tokio::time::timeout(Duration::from_secs(10), provider.join())
            .await
            .expect("worker observes stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_scope_cancellation_stops_worker() {
        let store = ScriptedStore::new(valid_until(Utc::now() + chrono::Duration::hours(2)));
        let cancel = CancellationToken::new();
        let provider = Provider::spawn("github", store, noop_reload(), cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), provider.join())
            .await
            .expect("worker observes run scope");
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_interrupts_wait_and_reloads() {
        let store = ScriptedStore::new(valid_until(Utc::now() + chrono::Duration::hours(2)));
        let reloads = Arc::new(AtomicU32::new(0));
        let provider = Provider::spawn(
            "github",
            store,
            counting_reload(Arc::clone(&reloads)),
            CancellationToken::new(),
        );

        // Let the worker reach its wait, then interrupt it
        tokio::task::yield_now().await;
        provider
            .notify(AuthEvent::new(AuthEventKind::LoginSuccess, "github"))
            .await;

        // The reload callback runs inside the loop before the next poll
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while reloads.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::task::yield_now().await;
        }
        assert_eq!(reloads.load(Ordering::SeqCst), 1);

        provider.stop();
        provider.join().await;
    }
}
