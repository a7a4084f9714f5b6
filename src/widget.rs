use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::WidgetConfig;
use crate::error::{ConnectError, ErrorKind};
use crate::eventlog::EventLog;
use crate::integration::{ConnectionRecord, ConnectionSink};
use crate::loader::SdkLoader;
use crate::pluggy::ConnectToken;
use crate::status::StatusBoard;
use crate::vendor::{
    Opener, SdkHandle, UserMetadata, VendorSdk, VendorWidget, WidgetBuilder, WidgetCallbacks,
    WidgetEvent, WidgetOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetState {
    Constructing,
    Open,
    Closed,
    Error,
}

/// Lifecycle transitions. Only vendor callbacks move a session; `Closed` is final and
/// an error before `open` keeps the session out of `Open`.
pub fn reduce(state: WidgetState, event: &WidgetEvent) -> WidgetState {
    match (state, event) {
        (WidgetState::Closed, _) => WidgetState::Closed,
        (_, WidgetEvent::Close) => WidgetState::Closed,
        (WidgetState::Constructing, WidgetEvent::Open) => WidgetState::Open,
        (WidgetState::Constructing | WidgetState::Open, WidgetEvent::Error(_)) => {
            WidgetState::Error
        }
        (state, _) => state,
    }
}

/// Ways the SDK lets us build a widget, in the order we try them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstructionStyle {
    Factory,
    Constructor,
}

pub const CONSTRUCTION_ORDER: [ConstructionStyle; 2] =
    [ConstructionStyle::Factory, ConstructionStyle::Constructor];

/// Where `open` is looked up, in the order we try them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenTarget {
    Instance,
    Global,
}

pub const OPEN_ORDER: [OpenTarget; 2] = [OpenTarget::Instance, OpenTarget::Global];

impl fmt::Display for ConstructionStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstructionStyle::Factory => f.write_str("static factory"),
            ConstructionStyle::Constructor => f.write_str("constructor"),
        }
    }
}

impl fmt::Display for OpenTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenTarget::Instance => f.write_str("instance"),
            OpenTarget::Global => f.write_str("global entry point"),
        }
    }
}

pub fn pick_builder(sdk: &dyn VendorSdk) -> Option<(ConstructionStyle, &dyn WidgetBuilder)> {
    CONSTRUCTION_ORDER.into_iter().find_map(|style| {
        let builder = match style {
            ConstructionStyle::Factory => sdk.factory(),
            ConstructionStyle::Constructor => sdk.constructor(),
        };
        builder.map(|b| (style, b))
    })
}

pub fn pick_opener<'a>(
    sdk: &'a dyn VendorSdk,
    widget: &'a dyn VendorWidget,
) -> Option<(OpenTarget, &'a dyn Opener)> {
    OPEN_ORDER.into_iter().find_map(|target| {
        let opener = match target {
            OpenTarget::Instance => widget.opener(),
            OpenTarget::Global => sdk.global_opener(),
        };
        opener.map(|o| (target, o))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConnectionResult {
    Connected {
        item_id: String,
        connected_at: DateTime<Utc>,
    },
    Failed {
        kind: ErrorKind,
        detail: String,
    },
}

struct SessionInner {
    id: Uuid,
    metadata: UserMetadata,
    state: watch::Sender<WidgetState>,
    result: Mutex<Option<ConnectionResult>>,
    widget: Mutex<Option<Box<dyn VendorWidget>>>,
}

/// Handle to one vendor widget and its lifecycle.
#[derive(Clone)]
pub struct WidgetSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for WidgetSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WidgetSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl WidgetSession {
    fn new(metadata: UserMetadata) -> Self {
        let (state, _rx) = watch::channel(WidgetState::Constructing);
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                metadata,
                state,
                result: Mutex::new(None),
                widget: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn metadata(&self) -> &UserMetadata {
        &self.inner.metadata
    }

    pub fn state(&self) -> WidgetState {
        *self.inner.state.borrow()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<WidgetState> {
        self.inner.state.subscribe()
    }

    pub fn result(&self) -> Option<ConnectionResult> {
        self.inner
            .result
            .lock()
            .ok()
            .and_then(|r| r.clone())
    }

    fn apply(&self, event: &WidgetEvent) -> (WidgetState, WidgetState) {
        let mut transition = (self.state(), self.state());
        self.inner.state.send_modify(|state| {
            let prev = *state;
            *state = reduce(prev, event);
            transition = (prev, *state);
        });
        transition
    }

    /// A connected result replaces an earlier failure; a failure never replaces anything.
    fn settle(&self, result: ConnectionResult) {
        if let Ok(mut slot) = self.inner.result.lock() {
            let replace = match (&*slot, &result) {
                (None, _) => true,
                (Some(ConnectionResult::Failed { .. }), ConnectionResult::Connected { .. }) => true,
                _ => false,
            };
            if replace {
                *slot = Some(result);
            }
        }
    }

    fn attach(&self, widget: Box<dyn VendorWidget>) {
        if self.state() == WidgetState::Closed {
            return;
        }
        if let Ok(mut slot) = self.inner.widget.lock() {
            *slot = Some(widget);
        }
    }

    fn release(&self) {
        if let Ok(mut slot) = self.inner.widget.lock() {
            slot.take();
        }
    }

    fn fail(&self, err: &ConnectError) {
        self.inner.state.send_modify(|state| {
            if *state != WidgetState::Closed {
                *state = WidgetState::Error;
            }
        });
        self.settle(ConnectionResult::Failed {
            kind: err.kind(),
            detail: err.to_string(),
        });
        self.release();
    }
}

/// Applies vendor callbacks to a session and turns them into status/log/record updates.
#[derive(Clone)]
struct SessionDriver {
    log: Arc<EventLog>,
    status: Arc<StatusBoard>,
    sink: Arc<dyn ConnectionSink>,
    current: Arc<Mutex<Option<WidgetSession>>>,
}

impl SessionDriver {
    fn is_current(&self, session: &WidgetSession) -> bool {
        self.current
            .lock()
            .map(|c| c.as_ref().is_some_and(|s| s.id() == session.id()))
            .unwrap_or(false)
    }

    fn clear_if_current(&self, session: &WidgetSession) {
        if let Ok(mut current) = self.current.lock()
            && current.as_ref().is_some_and(|s| s.id() == session.id())
        {
            *current = None;
        }
    }

    async fn handle(&self, session: &WidgetSession, event: WidgetEvent) {
        let (prev, next) = session.apply(&event);
        if prev == WidgetState::Closed {
            debug!(session = %session.id(), event = event.name(), "event after close ignored");
            return;
        }
        match event {
            WidgetEvent::Open => {
                if next == WidgetState::Open && prev != WidgetState::Open {
                    self.status.loading("Pluggy Connect is open");
                    self.log.success("Pluggy Connect opened");
                } else if prev == WidgetState::Error {
                    self.log
                        .warning("Pluggy Connect reported open after an error; ignored");
                }
            }
            WidgetEvent::Close => {
                self.log.info("Pluggy Connect closed");
                session.release();
                self.clear_if_current(session);
            }
            WidgetEvent::Error(err) => {
                self.log.error(format!("Pluggy Connect error: {err}"));
                let err = ConnectError::WidgetRuntime(err);
                self.status.error(err.user_label());
                session.settle(ConnectionResult::Failed {
                    kind: err.kind(),
                    detail: err.to_string(),
                });
                if prev == WidgetState::Constructing {
                    // the widget never opened and will not; let the vendor side go
                    session.release();
                }
            }
            WidgetEvent::Success(payload) => {
                let Some(item_id) = payload.item_id.clone() else {
                    self.log
                        .warning("Pluggy Connect reported success without an itemId");
                    return;
                };
                let connected_at = Utc::now();
                session.settle(ConnectionResult::Connected {
                    item_id: item_id.clone(),
                    connected_at,
                });
                self.status.connected("Account connected", &item_id);
                self.log
                    .success(format!("Account connected (itemId {item_id})"));
                let metadata = session.metadata();
                self.sink
                    .record_connection(ConnectionRecord {
                        item_id,
                        name: metadata.name.clone(),
                        email: metadata.email.clone(),
                        connected_at,
                        payload: payload.raw,
                    })
                    .await;
            }
        }
    }

    fn spawn_relay(&self, session: WidgetSession, mut rx: mpsc::UnboundedReceiver<WidgetEvent>) {
        let driver = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !driver.is_current(&session) {
                    driver.log.warning(format!(
                        "Ignoring '{}' from a superseded widget session",
                        event.name()
                    ));
                    continue;
                }
                driver.handle(&session, event).await;
                if session.state() == WidgetState::Closed {
                    break;
                }
            }
            debug!(session = %session.id(), "widget relay finished");
        });
    }
}

/// Builds, opens and tracks Pluggy Connect widgets.
pub struct WidgetManager {
    loader: Arc<SdkLoader>,
    cfg: WidgetConfig,
    driver: SessionDriver,
}

impl WidgetManager {
    pub fn new(
        loader: Arc<SdkLoader>,
        cfg: WidgetConfig,
        log: Arc<EventLog>,
        status: Arc<StatusBoard>,
        sink: Arc<dyn ConnectionSink>,
    ) -> Self {
        Self {
            loader,
            cfg,
            driver: SessionDriver {
                log,
                status,
                sink,
                current: Arc::new(Mutex::new(None)),
            },
        }
    }

    pub fn current(&self) -> Option<WidgetSession> {
        self.driver.current.lock().ok().and_then(|c| c.clone())
    }

    /// Wait for the SDK, build a widget with `token` and open it. The returned session
    /// keeps following vendor callbacks in the background.
    pub async fn open_widget(
        &self,
        token: ConnectToken,
        metadata: UserMetadata,
    ) -> Result<WidgetSession, ConnectError> {
        let sdk = self.loader.ensure_ready().await?;
        let session = WidgetSession::new(metadata.clone());
        self.supersede(session.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        self.driver.spawn_relay(session.clone(), rx);
        let options = WidgetOptions {
            connect_token: token.access_token().to_string(),
            include_sandbox: self.cfg.include_sandbox,
            language: self.cfg.language.clone(),
            theme: self.cfg.theme.clone(),
            user_metadata: metadata,
            callbacks: WidgetCallbacks::new(tx),
        };
        debug!(session = %session.id(), token = %token.preview(), "building widget");
        drop(token);

        match self.construct_and_open(&sdk, options) {
            Ok(widget) => {
                session.attach(widget);
                Ok(session)
            }
            Err(err) => {
                self.driver.log.error(format!("Could not open Pluggy Connect: {err}"));
                session.fail(&err);
                self.driver.clear_if_current(&session);
                Err(err)
            }
        }
    }

    fn construct_and_open(
        &self,
        sdk: &SdkHandle,
        options: WidgetOptions,
    ) -> Result<Box<dyn VendorWidget>, ConnectError> {
        let Some((style, builder)) = pick_builder(sdk.as_ref()) else {
            return Err(ConnectError::WidgetUnavailable(
                "SDK exposes neither a factory nor a constructor".into(),
            ));
        };
        self.driver
            .log
            .info(format!("Creating Pluggy Connect via {style}"));
        let widget = builder.build(options).map_err(ConnectError::WidgetRuntime)?;

        let Some((target, opener)) = pick_opener(sdk.as_ref(), widget.as_ref()) else {
            return Err(ConnectError::WidgetUnavailable(
                "no open capability on the widget or the SDK".into(),
            ));
        };
        opener.open().map_err(ConnectError::WidgetRuntime)?;
        self.driver
            .log
            .info(format!("Pluggy Connect open requested on the {target}"));
        Ok(widget)
    }

    fn supersede(&self, session: WidgetSession) {
        let previous = self
            .driver
            .current
            .lock()
            .ok()
            .and_then(|mut current| current.replace(session));
        if let Some(previous) = previous {
            if previous.state() == WidgetState::Open {
                warn!(previous = %previous.id(), "new widget session started while one is open");
            }
            previous.release();
            self.driver
                .log
                .info("Previous widget session discarded");
        }
    }
}
