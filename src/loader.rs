use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::{sleep, timeout};
use tracing::{Instrument, debug, info_span};

use crate::config::{InjectMode, SdkConfig};
use crate::error::ConnectError;
use crate::eventlog::EventLog;
use crate::status::StatusBoard;
use crate::vendor::{SdkHandle, exposes_open};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoaderState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script failed to load: {0}")]
    Load(String),
    #[error("script threw while executing: {0}")]
    Execution(String),
    #[error("no page is attached to run the script")]
    Detached,
}

/// Where the vendor script runs: injects it and inspects the global namespace.
#[async_trait]
pub trait ScriptEnvironment: Send + Sync {
    /// Resolves once the script resource reports load completion (or failure).
    async fn inject(&self, url: &str, mode: InjectMode) -> Result<(), ScriptError>;
    /// Current value of the vendor's global entry point, if defined.
    async fn probe(&self) -> Option<SdkHandle>;
    /// Identifies the page the script runs in. A handle loaded under one session is
    /// never handed out under another.
    fn page_session(&self) -> u64 {
        0
    }
}

/// Memo of the SDK handle for the current page session.
///
/// The mutex is held for the whole load, so concurrent callers queue behind the one
/// doing the work. `rounds` counts finished load rounds; a caller that queued during a
/// round that failed gets that round's error instead of starting another one.
pub struct LoaderCell {
    slot: Mutex<Slot>,
    rounds: AtomicU64,
    state: watch::Sender<LoaderState>,
}

#[derive(Default)]
struct Slot {
    handle: Option<(u64, SdkHandle)>,
    failure: Option<(u64, ConnectError)>,
}

impl Default for LoaderCell {
    fn default() -> Self {
        Self::new()
    }
}

impl LoaderCell {
    pub fn new() -> Self {
        let (state, _rx) = watch::channel(LoaderState::Unloaded);
        Self {
            slot: Mutex::new(Slot::default()),
            rounds: AtomicU64::new(0),
            state,
        }
    }

    pub fn state(&self) -> LoaderState {
        *self.state.borrow()
    }

    /// Readiness notifications for anyone interested, not only the caller that loaded.
    pub fn subscribe(&self) -> watch::Receiver<LoaderState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LoaderState) {
        self.state.send_replace(next);
    }
}

/// Resolve the SDK handle, loading the script at most once at a time.
pub async fn ensure_ready(
    cell: &LoaderCell,
    env: &dyn ScriptEnvironment,
    cfg: &SdkConfig,
    log: &EventLog,
) -> Result<SdkHandle, ConnectError> {
    let seen = cell.rounds.load(Ordering::SeqCst);
    let mut slot = cell.slot.lock().await;
    let page = env.page_session();
    if let Some((session, handle)) = &slot.handle {
        if *session == page {
            return Ok(handle.clone());
        }
        debug!(cached = session, page, "page session changed; reloading SDK");
        log.info("Connect page changed; the Pluggy SDK will be loaded again");
        slot.handle = None;
    }
    if let Some((round, err)) = &slot.failure
        && *round > seen
    {
        return Err(err.clone());
    }

    cell.transition(LoaderState::Loading);
    let outcome = load_with_retries(env, cfg, log)
        .instrument(info_span!("sdk_load", url = %cfg.url))
        .await;
    let round = cell.rounds.fetch_add(1, Ordering::SeqCst) + 1;
    match outcome {
        Ok(handle) => {
            slot.handle = Some((page, handle.clone()));
            slot.failure = None;
            cell.transition(LoaderState::Ready);
            Ok(handle)
        }
        Err(err) => {
            slot.failure = Some((round, err.clone()));
            cell.transition(LoaderState::Failed);
            Err(err)
        }
    }
}

async fn load_with_retries(
    env: &dyn ScriptEnvironment,
    cfg: &SdkConfig,
    log: &EventLog,
) -> Result<SdkHandle, ConnectError> {
    let attempts = cfg.max_attempts.max(1);
    let mut last_err = String::from("SDK never loaded");
    for attempt in 1..=attempts {
        log.info(format!(
            "Loading Pluggy SDK (attempt {attempt}/{attempts})..."
        ));
        match timeout(cfg.attempt_timeout, load_once(env, cfg)).await {
            Ok(Ok(handle)) => {
                log.success("Pluggy SDK ready");
                return Ok(handle);
            }
            Ok(Err(detail)) => {
                log.warning(format!("Pluggy SDK attempt {attempt} failed: {detail}"));
                last_err = detail;
            }
            Err(_) => {
                last_err = format!(
                    "timed out after {} ms",
                    cfg.attempt_timeout.as_millis()
                );
                log.warning(format!("Pluggy SDK attempt {attempt} {last_err}"));
            }
        }
        if attempt < attempts {
            sleep(cfg.retry_backoff * attempt).await;
        }
    }
    log.error(format!("Pluggy SDK unavailable: {last_err}"));
    Err(ConnectError::SdkLoad(last_err))
}

async fn load_once(env: &dyn ScriptEnvironment, cfg: &SdkConfig) -> Result<SdkHandle, String> {
    env.inject(&cfg.url, cfg.mode)
        .await
        .map_err(|err| err.to_string())?;
    let polls = cfg.poll_attempts.max(1);
    for poll in 1..=polls {
        // load completion alone does not mean top-level init has finished
        if let Some(handle) = env.probe().await
            && exposes_open(handle.as_ref())
        {
            debug!(poll, "entry point ready");
            return Ok(handle);
        }
        if poll < polls {
            sleep(cfg.poll_interval).await;
        }
    }
    Err(format!("entry point not ready after {polls} polls"))
}

/// Loader bound to its environment; what the rest of the app holds.
pub struct SdkLoader {
    cell: LoaderCell,
    env: Arc<dyn ScriptEnvironment>,
    cfg: SdkConfig,
    log: Arc<EventLog>,
}

impl SdkLoader {
    pub fn new(env: Arc<dyn ScriptEnvironment>, cfg: SdkConfig, log: Arc<EventLog>) -> Self {
        Self {
            cell: LoaderCell::new(),
            env,
            cfg,
            log,
        }
    }

    pub async fn ensure_ready(&self) -> Result<SdkHandle, ConnectError> {
        ensure_ready(&self.cell, self.env.as_ref(), &self.cfg, &self.log).await
    }

    pub fn state(&self) -> LoaderState {
        self.cell.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoaderState> {
        self.cell.subscribe()
    }

    /// Flash a short-lived "ready" notice on the status board whenever the SDK becomes ready.
    pub fn announce_readiness(&self, status: Arc<StatusBoard>) -> tokio::task::JoinHandle<()> {
        let mut rx = self.subscribe();
        let hide_after: Duration = self.cfg.notice_hide_delay;
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                if state == LoaderState::Ready {
                    status.flash_notice("Pluggy SDK ready", hide_after);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeScriptEnv, FakeSdk, FakeShape};

    fn cfg() -> SdkConfig {
        SdkConfig {
            max_attempts: 2,
            poll_attempts: 20,
            poll_interval: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(250),
            ..SdkConfig::default()
        }
    }

    fn loader(env: Arc<FakeScriptEnv>) -> Arc<SdkLoader> {
        Arc::new(SdkLoader::new(env, cfg(), Arc::new(EventLog::new(50))))
    }

    fn same_handle(a: &SdkHandle, b: &SdkHandle) -> bool {
        std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_injection() {
        let sdk = FakeSdk::new(FakeShape::default());
        let env = Arc::new(
            FakeScriptEnv::new(sdk)
                .ready_after(3)
                .inject_delay(Duration::from_millis(300)),
        );
        let loader = loader(env.clone());

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let loader = loader.clone();
                tokio::spawn(async move { loader.ensure_ready().await })
            })
            .collect();
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert_eq!(env.injections(), 1);
        assert!(handles.iter().all(|h| same_handle(h, &handles[0])));
        assert_eq!(loader.state(), LoaderState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_handle_is_cached() {
        let env = Arc::new(FakeScriptEnv::new(FakeSdk::new(FakeShape::default())));
        let loader = loader(env.clone());
        let first = loader.ensure_ready().await.unwrap();
        let probes = env.probes();
        let second = loader.ensure_ready().await.unwrap();
        assert!(same_handle(&first, &second));
        assert_eq!(env.injections(), 1);
        assert_eq!(env.probes(), probes);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_exhaustion_fails_then_retriggers() {
        let env = Arc::new(FakeScriptEnv::new(FakeSdk::new(FakeShape::default())).never_ready());
        let loader = loader(env.clone());

        let result = loader.ensure_ready().await;
        assert!(matches!(result, Err(ConnectError::SdkLoad(_))));
        assert_eq!(env.injections(), 2);
        assert_eq!(loader.state(), LoaderState::Failed);

        assert!(loader.ensure_ready().await.is_err());
        assert_eq!(env.injections(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_share_a_failed_round() {
        let env = Arc::new(FakeScriptEnv::new(FakeSdk::new(FakeShape::default())).never_ready());
        let loader = loader(env.clone());
        let a = tokio::spawn({
            let loader = loader.clone();
            async move { loader.ensure_ready().await }
        });
        let b = tokio::spawn({
            let loader = loader.clone();
            async move { loader.ensure_ready().await }
        });
        assert!(a.await.unwrap().is_err());
        assert!(b.await.unwrap().is_err());
        assert_eq!(env.injections(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_triggers_one_retry() {
        let env = Arc::new(
            FakeScriptEnv::new(FakeSdk::new(FakeShape::default()))
                .inject_delays([Duration::from_secs(30), Duration::from_millis(10)]),
        );
        let loader = loader(env.clone());
        loader.ensure_ready().await.unwrap();
        assert_eq!(env.injections(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn script_error_counts_as_failed_attempt() {
        let env = Arc::new(
            FakeScriptEnv::new(FakeSdk::new(FakeShape::default())).failing_injections(1),
        );
        let log = Arc::new(EventLog::new(50));
        let loader = SdkLoader::new(env.clone(), cfg(), log.clone());
        loader.ensure_ready().await.unwrap();
        assert_eq!(env.injections(), 2);
        assert!(
            log.snapshot()
                .iter()
                .any(|e| e.message.contains("attempt 1 failed"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn entry_point_without_open_is_not_ready() {
        let shape = FakeShape {
            instance_open: false,
            prototype_open: false,
            global_open: false,
            ..FakeShape::default()
        };
        let env = Arc::new(FakeScriptEnv::new(FakeSdk::new(shape)));
        let loader = loader(env.clone());
        assert!(loader.ensure_ready().await.is_err());
        assert_eq!(env.probes(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn new_page_session_drops_cached_handle() {
        let env = Arc::new(FakeScriptEnv::new(FakeSdk::new(FakeShape::default())));
        let loader = loader(env.clone());
        loader.ensure_ready().await.unwrap();
        loader.ensure_ready().await.unwrap();
        assert_eq!(env.injections(), 1);

        env.reload_page();
        loader.ensure_ready().await.unwrap();
        assert_eq!(env.injections(), 2);
        assert_eq!(loader.state(), LoaderState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_see_readiness() {
        let env = Arc::new(FakeScriptEnv::new(FakeSdk::new(FakeShape::default())));
        let loader = loader(env);
        let status = Arc::new(StatusBoard::new());
        let mut rx = loader.subscribe();
        let _notice = loader.announce_readiness(status.clone());

        loader.ensure_ready().await.unwrap();
        rx.wait_for(|s| *s == LoaderState::Ready).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(status.snapshot().notice.as_deref(), Some("Pluggy SDK ready"));
    }
}
