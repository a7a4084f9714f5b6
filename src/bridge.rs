//! Runs the vendor SDK inside the connect page.
//!
//! Each page that opens the directive stream is attached under its own [`PageId`] and
//! gets its own queue of [`Directive`]s; it answers with [`Report`]s tagged with that
//! id. Directives only ever go to one target page (the most recently attached or the
//! one that submitted the form). Switching target starts a new page session, which
//! makes the loader fetch the SDK again since it lives in the page's `window`.
//!
//! On top of that exchange this module implements [`ScriptEnvironment`] and
//! [`VendorSdk`], so the loader and widget manager drive a real browser the same way
//! they drive the test doubles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::InjectMode;
use crate::error::VendorError;
use crate::loader::{ScriptEnvironment, ScriptError};
use crate::vendor::{
    Opener, SdkHandle, SuccessPayload, VendorSdk, VendorWidget, WidgetBuilder, WidgetCallbacks,
    WidgetEvent, WidgetOptions,
};
use crate::widget::{ConstructionStyle, OpenTarget};

const DIRECTIVE_BUFFER: usize = 64;

pub type PageId = Uuid;

/// Server → page.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Directive {
    InjectScript {
        id: u64,
        url: String,
        mode: InjectMode,
    },
    Probe {
        id: u64,
    },
    Construct {
        widget: Uuid,
        style: ConstructionStyle,
        options: Value,
    },
    Open {
        widget: Uuid,
        target: OpenTarget,
    },
}

impl Directive {
    pub fn name(&self) -> &'static str {
        match self {
            Directive::InjectScript { .. } => "inject-script",
            Directive::Probe { .. } => "probe",
            Directive::Construct { .. } => "construct",
            Directive::Open { .. } => "open",
        }
    }
}

/// Page → server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Report {
    ScriptLoaded {
        id: u64,
    },
    ScriptFailed {
        id: u64,
        message: String,
        #[serde(default, rename = "duringExecution")]
        during_execution: bool,
    },
    Surface {
        id: u64,
        surface: Option<SdkSurface>,
    },
    Widget {
        widget: Uuid,
        #[serde(flatten)]
        event: WidgetReport,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum WidgetReport {
    Open,
    Close,
    Error { error: VendorError },
    Success { data: Value },
}

/// What the page found on `window.PluggyConnect`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkSurface {
    pub has_factory: bool,
    pub constructible: bool,
    pub prototype_open: bool,
    pub global_open: bool,
}

/// An attached page: its id and the directives addressed to it.
pub struct PageLink {
    pub id: PageId,
    pub directives: mpsc::Receiver<Directive>,
}

struct WidgetEntry {
    page: PageId,
    callbacks: WidgetCallbacks,
}

#[derive(Default)]
struct Registry {
    pages: HashMap<PageId, mpsc::Sender<Directive>>,
    target: Option<PageId>,
    session: u64,
    scripts: HashMap<u64, oneshot::Sender<Result<(), ScriptError>>>,
    probes: HashMap<u64, oneshot::Sender<Option<SdkSurface>>>,
    widgets: HashMap<Uuid, WidgetEntry>,
    latest_widget: Option<Uuid>,
}

impl Registry {
    fn retarget(&mut self, page: PageId) {
        if self.target == Some(page) {
            return;
        }
        self.target = Some(page);
        self.session += 1;
        // answers for the previous page can no longer arrive; waiters see a detach
        self.scripts.clear();
        self.probes.clear();
    }

    fn dispatch(&mut self, directive: Directive) -> Option<PageId> {
        let page = self.target?;
        self.dispatch_to(page, directive).then_some(page)
    }

    fn dispatch_to(&mut self, page: PageId, directive: Directive) -> bool {
        let Some(tx) = self.pages.get(&page) else {
            return false;
        };
        debug!(%page, directive = directive.name(), "bridge directive");
        match tx.try_send(directive) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%page, "connect page is not keeping up with directives");
                false
            }
            Err(TrySendError::Closed(_)) => {
                info!(%page, "connect page detached");
                self.pages.remove(&page);
                if self.target == Some(page) {
                    self.target = None;
                }
                false
            }
        }
    }
}

struct Shared {
    next_id: AtomicU64,
    probe_timeout: Duration,
    registry: Mutex<Registry>,
}

#[derive(Clone)]
pub struct BridgeHub {
    shared: Arc<Shared>,
}

impl BridgeHub {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                probe_timeout,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Register a page; it becomes the target for directives.
    pub fn attach(&self) -> PageLink {
        let id = Uuid::new_v4();
        let (tx, directives) = mpsc::channel(DIRECTIVE_BUFFER);
        let mut registry = self.registry();
        registry.pages.retain(|_, tx| !tx.is_closed());
        registry.pages.insert(id, tx);
        registry.retarget(id);
        info!(page = %id, "connect page attached");
        PageLink { id, directives }
    }

    /// Make `page` the target if it is still attached.
    pub fn focus(&self, page: PageId) -> bool {
        let mut registry = self.registry();
        let attached = registry
            .pages
            .get(&page)
            .is_some_and(|tx| !tx.is_closed());
        if attached {
            registry.retarget(page);
        }
        attached
    }

    pub fn attached_pages(&self) -> usize {
        self.registry()
            .pages
            .values()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Route a report from `page` to whoever waits for it.
    pub fn handle_report(&self, page: PageId, report: Report) {
        match report {
            Report::ScriptLoaded { id } => self.complete_script(page, id, Ok(())),
            Report::ScriptFailed {
                id,
                message,
                during_execution,
            } => {
                let err = if during_execution {
                    ScriptError::Execution(message)
                } else {
                    ScriptError::Load(message)
                };
                self.complete_script(page, id, Err(err));
            }
            Report::Surface { id, surface } => {
                let mut registry = self.registry();
                if registry.target != Some(page) {
                    debug!(%page, id, "surface report from a page that is not the target");
                    return;
                }
                if let Some(tx) = registry.probes.remove(&id) {
                    let _ = tx.send(surface);
                }
            }
            Report::Widget { widget, event } => self.relay_widget(page, widget, event),
        }
    }

    fn complete_script(&self, page: PageId, id: u64, result: Result<(), ScriptError>) {
        let mut registry = self.registry();
        if registry.target != Some(page) {
            debug!(%page, id, "script report from a page that is not the target");
            return;
        }
        match registry.scripts.remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(id, "script report for unknown or expired request"),
        }
    }

    fn relay_widget(&self, page: PageId, widget: Uuid, report: WidgetReport) {
        let callbacks = {
            let mut registry = self.registry();
            let callbacks = registry
                .widgets
                .get(&widget)
                .filter(|entry| entry.page == page)
                .map(|entry| entry.callbacks.clone());
            if callbacks.is_some() && matches!(report, WidgetReport::Close) {
                registry.widgets.remove(&widget);
            }
            callbacks
        };
        let Some(callbacks) = callbacks else {
            warn!(%page, %widget, "report for unknown or released widget");
            return;
        };
        let event = match report {
            WidgetReport::Open => WidgetEvent::Open,
            WidgetReport::Close => WidgetEvent::Close,
            WidgetReport::Error { error } => WidgetEvent::Error(error),
            WidgetReport::Success { data } => WidgetEvent::Success(SuccessPayload::from_value(data)),
        };
        callbacks.emit(event);
    }

    fn construct(
        &self,
        style: ConstructionStyle,
        options: WidgetOptions,
    ) -> Result<Uuid, VendorError> {
        let payload = serde_json::to_value(&options)
            .map_err(|err| VendorError::new(format!("unserializable options: {err}")))?;
        let widget = Uuid::new_v4();
        let mut registry = self.registry();
        let Some(page) = registry.dispatch(Directive::Construct {
            widget,
            style,
            options: payload,
        }) else {
            return Err(VendorError::new("no connect page is attached"));
        };
        registry.widgets.insert(
            widget,
            WidgetEntry {
                page,
                callbacks: options.callbacks,
            },
        );
        registry.latest_widget = Some(widget);
        Ok(widget)
    }

    /// Open goes to the page that built the widget, even if another page took over since.
    fn open(&self, widget: Option<Uuid>, target: OpenTarget) -> Result<(), VendorError> {
        let mut registry = self.registry();
        let widget = widget
            .or(registry.latest_widget)
            .ok_or_else(|| VendorError::new("no widget to open"))?;
        let page = registry
            .widgets
            .get(&widget)
            .map(|entry| entry.page)
            .ok_or_else(|| VendorError::new("widget was already released"))?;
        if registry.dispatch_to(page, Directive::Open { widget, target }) {
            Ok(())
        } else {
            Err(VendorError::new("the connect page that built the widget is gone"))
        }
    }

    /// Forget a widget's callbacks so its session relay can finish.
    fn release_widget(&self, widget: Uuid) {
        let mut registry = self.registry();
        registry.widgets.remove(&widget);
        if registry.latest_widget == Some(widget) {
            registry.latest_widget = None;
        }
    }
}

#[async_trait]
impl ScriptEnvironment for BridgeHub {
    async fn inject(&self, url: &str, mode: InjectMode) -> Result<(), ScriptError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut registry = self.registry();
            registry.scripts.insert(id, tx);
            let sent = registry.dispatch(Directive::InjectScript {
                id,
                url: url.to_string(),
                mode,
            });
            if sent.is_none() {
                registry.scripts.remove(&id);
                return Err(ScriptError::Detached);
            }
        }
        let result = rx.await.unwrap_or(Err(ScriptError::Detached));
        // the loader may time out and drop us; don't leave the entry behind
        self.registry().scripts.remove(&id);
        result
    }

    async fn probe(&self) -> Option<SdkHandle> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut registry = self.registry();
            registry.probes.insert(id, tx);
            if registry.dispatch(Directive::Probe { id }).is_none() {
                registry.probes.remove(&id);
                return None;
            }
        }
        let surface = tokio::time::timeout(self.shared.probe_timeout, rx).await;
        self.registry().probes.remove(&id);
        let surface = surface.ok()?.ok()??;
        Some(Arc::new(BridgeSdk::new(self.clone(), surface)))
    }

    fn page_session(&self) -> u64 {
        self.registry().session
    }
}

/// `window.PluggyConnect` as last reported by the page.
pub struct BridgeSdk {
    surface: SdkSurface,
    factory: BridgeBuilder,
    constructor: BridgeBuilder,
    global: BridgeOpener,
}

impl BridgeSdk {
    fn new(hub: BridgeHub, surface: SdkSurface) -> Self {
        Self {
            surface,
            factory: BridgeBuilder {
                hub: hub.clone(),
                style: ConstructionStyle::Factory,
                instance_open: surface.prototype_open,
            },
            constructor: BridgeBuilder {
                hub: hub.clone(),
                style: ConstructionStyle::Constructor,
                instance_open: surface.prototype_open,
            },
            global: BridgeOpener {
                hub,
                widget: None,
                target: OpenTarget::Global,
            },
        }
    }
}

impl VendorSdk for BridgeSdk {
    fn factory(&self) -> Option<&dyn WidgetBuilder> {
        self.surface
            .has_factory
            .then_some(&self.factory as &dyn WidgetBuilder)
    }

    fn constructor(&self) -> Option<&dyn WidgetBuilder> {
        self.surface
            .constructible
            .then_some(&self.constructor as &dyn WidgetBuilder)
    }

    fn global_opener(&self) -> Option<&dyn Opener> {
        self.surface
            .global_open
            .then_some(&self.global as &dyn Opener)
    }

    fn prototype_has_open(&self) -> bool {
        self.surface.prototype_open
    }
}

struct BridgeBuilder {
    hub: BridgeHub,
    style: ConstructionStyle,
    instance_open: bool,
}

impl WidgetBuilder for BridgeBuilder {
    fn build(&self, options: WidgetOptions) -> Result<Box<dyn VendorWidget>, VendorError> {
        let widget = self.hub.construct(self.style, options)?;
        Ok(Box::new(BridgeWidget {
            hub: self.hub.clone(),
            widget,
            opener: self.instance_open.then(|| BridgeOpener {
                hub: self.hub.clone(),
                widget: Some(widget),
                target: OpenTarget::Instance,
            }),
        }))
    }
}

struct BridgeWidget {
    hub: BridgeHub,
    widget: Uuid,
    opener: Option<BridgeOpener>,
}

impl VendorWidget for BridgeWidget {
    fn opener(&self) -> Option<&dyn Opener> {
        self.opener.as_ref().map(|o| o as &dyn Opener)
    }
}

impl Drop for BridgeWidget {
    fn drop(&mut self) {
        self.hub.release_widget(self.widget);
    }
}

struct BridgeOpener {
    hub: BridgeHub,
    widget: Option<Uuid>,
    target: OpenTarget,
}

impl Opener for BridgeOpener {
    fn open(&self) -> Result<(), VendorError> {
        self.hub.open(self.widget, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SdkConfig, WidgetConfig};
    use crate::error::ConnectError;
    use crate::eventlog::EventLog;
    use crate::integration::MemoryConnectionSink;
    use crate::loader::SdkLoader;
    use crate::pluggy::ConnectToken;
    use crate::status::StatusBoard;
    use crate::vendor::UserMetadata;
    use crate::widget::WidgetManager;
    use serde_json::json;

    fn surface() -> SdkSurface {
        SdkSurface {
            has_factory: false,
            constructible: true,
            prototype_open: true,
            global_open: false,
        }
    }

    fn options(tx: mpsc::UnboundedSender<WidgetEvent>) -> WidgetOptions {
        WidgetOptions {
            connect_token: "tok_abc".into(),
            include_sandbox: false,
            language: "pt".into(),
            theme: "dark".into(),
            user_metadata: UserMetadata::default(),
            callbacks: WidgetCallbacks::new(tx),
        }
    }

    /// Attach a page that loads the SDK on request and records every directive it sees.
    fn scripted_page(hub: &BridgeHub) -> (PageId, Arc<Mutex<Vec<&'static str>>>) {
        let PageLink { id, mut directives } = hub.attach();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let page_hub = hub.clone();
        let record = seen.clone();
        tokio::spawn(async move {
            while let Some(directive) = directives.recv().await {
                record.lock().unwrap().push(directive.name());
                match directive {
                    Directive::InjectScript { id: req, .. } => {
                        page_hub.handle_report(id, Report::ScriptLoaded { id: req })
                    }
                    Directive::Probe { id: req } => page_hub.handle_report(
                        id,
                        Report::Surface {
                            id: req,
                            surface: Some(surface()),
                        },
                    ),
                    _ => {}
                }
            }
        });
        (id, seen)
    }

    fn manager(hub: &BridgeHub) -> WidgetManager {
        let log = Arc::new(EventLog::new(100));
        let cfg = SdkConfig {
            poll_interval: Duration::from_millis(5),
            attempt_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(1),
            ..SdkConfig::default()
        };
        let loader = Arc::new(SdkLoader::new(Arc::new(hub.clone()), cfg, log.clone()));
        WidgetManager::new(
            loader,
            WidgetConfig::default(),
            log,
            Arc::new(StatusBoard::new()),
            Arc::new(MemoryConnectionSink::default()),
        )
    }

    fn token(value: &str) -> ConnectToken {
        ConnectToken::new(value.to_string(), Some("ana@example.com".into()))
    }

    async fn open(manager: &WidgetManager, value: &str) -> Result<(), ConnectError> {
        manager
            .open_widget(token(value), UserMetadata::default())
            .await
            .map(|_| ())
    }

    /// Construct and open are fire-and-forget; give the page task time to drain them.
    async fn drain() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn inject_without_page_is_detached() {
        let hub = BridgeHub::new(Duration::from_millis(50));
        let err = hub
            .inject("https://cdn.example/sdk.js", InjectMode::ScriptTag)
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Detached));
    }

    #[tokio::test]
    async fn inject_resolves_on_page_report() {
        let hub = BridgeHub::new(Duration::from_millis(50));
        let PageLink { id, mut directives } = hub.attach();
        let page_hub = hub.clone();
        let page_task = tokio::spawn(async move {
            let directive = directives.recv().await.unwrap();
            let Directive::InjectScript { id: req, url, mode } = directive else {
                panic!("unexpected directive {directive:?}");
            };
            assert_eq!(url, "https://cdn.example/sdk.js");
            assert_eq!(mode, InjectMode::FetchBlob);
            page_hub.handle_report(id, Report::ScriptLoaded { id: req });
        });
        hub.inject("https://cdn.example/sdk.js", InjectMode::FetchBlob)
            .await
            .unwrap();
        page_task.await.unwrap();
    }

    #[tokio::test]
    async fn execution_failure_is_reported() {
        let hub = BridgeHub::new(Duration::from_millis(50));
        let PageLink { id, mut directives } = hub.attach();
        let page_hub = hub.clone();
        tokio::spawn(async move {
            if let Some(Directive::InjectScript { id: req, .. }) = directives.recv().await {
                let report: Report = serde_json::from_value(json!({
                    "type": "script-failed",
                    "id": req,
                    "message": "ReferenceError: x is not defined",
                    "duringExecution": true
                }))
                .unwrap();
                page_hub.handle_report(id, report);
            }
        });
        let err = hub
            .inject("/static/pluggy-connect.js", InjectMode::ScriptTag)
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Execution(_)));
    }

    #[tokio::test]
    async fn probe_builds_sdk_from_surface() {
        let hub = BridgeHub::new(Duration::from_millis(200));
        let PageLink { id, mut directives } = hub.attach();
        let page_hub = hub.clone();
        tokio::spawn(async move {
            if let Some(Directive::Probe { id: req }) = directives.recv().await {
                page_hub.handle_report(
                    id,
                    Report::Surface {
                        id: req,
                        surface: Some(surface()),
                    },
                );
            }
        });
        let sdk = hub.probe().await.expect("surface reported");
        assert!(sdk.constructor().is_some());
        assert!(sdk.factory().is_none());
        assert!(sdk.prototype_has_open());
    }

    #[tokio::test]
    async fn probe_times_out_to_none() {
        let hub = BridgeHub::new(Duration::from_millis(20));
        let _page = hub.attach();
        assert!(hub.probe().await.is_none());
    }

    #[tokio::test]
    async fn widget_reports_reach_callbacks() {
        let hub = BridgeHub::new(Duration::from_millis(50));
        let PageLink { id: page, mut directives } = hub.attach();
        let sdk = BridgeSdk::new(hub.clone(), surface());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let widget = sdk.constructor().unwrap().build(options(tx)).unwrap();
        widget.opener().unwrap().open().unwrap();

        let Some(Directive::Construct { widget: id, style, options }) = directives.recv().await
        else {
            panic!("expected construct");
        };
        assert_eq!(style, ConstructionStyle::Constructor);
        assert_eq!(options["connectToken"], "tok_abc");
        assert_eq!(
            directives.recv().await,
            Some(Directive::Open {
                widget: id,
                target: OpenTarget::Instance
            })
        );

        let report: Report = serde_json::from_value(json!({
            "type": "widget",
            "widget": id,
            "event": "success",
            "data": {"itemId": "it_9"}
        }))
        .unwrap();
        hub.handle_report(page, report);
        match rx.recv().await.unwrap() {
            WidgetEvent::Success(payload) => assert_eq!(payload.item_id.as_deref(), Some("it_9")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn reports_from_another_page_are_ignored() {
        let hub = BridgeHub::new(Duration::from_millis(50));
        let owner = hub.attach();
        let sdk = BridgeSdk::new(hub.clone(), surface());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _widget = sdk.constructor().unwrap().build(options(tx)).unwrap();
        let widget_id = hub.registry().latest_widget.unwrap();

        let stranger = Uuid::new_v4();
        hub.handle_report(
            stranger,
            Report::Widget {
                widget: widget_id,
                event: WidgetReport::Open,
            },
        );
        assert!(rx.try_recv().is_err());

        hub.handle_report(
            owner.id,
            Report::Widget {
                widget: widget_id,
                event: WidgetReport::Open,
            },
        );
        assert!(matches!(rx.recv().await, Some(WidgetEvent::Open)));
    }

    #[tokio::test]
    async fn reloaded_page_loads_the_sdk_again() {
        let hub = BridgeHub::new(Duration::from_millis(200));
        let manager = manager(&hub);

        let (_first, first_seen) = scripted_page(&hub);
        open(&manager, "tok_1").await.unwrap();
        drain().await;
        assert_eq!(
            *first_seen.lock().unwrap(),
            vec!["inject-script", "probe", "construct", "open"]
        );

        let (_second, second_seen) = scripted_page(&hub);
        open(&manager, "tok_2").await.unwrap();
        drain().await;
        let second = second_seen.lock().unwrap().clone();
        assert_eq!(second.first(), Some(&"inject-script"));
        assert!(second.contains(&"construct"));
        assert!(second.contains(&"open"));

        // the earlier page never sees the second token
        let constructs = first_seen
            .lock()
            .unwrap()
            .iter()
            .filter(|d| **d == "construct")
            .count();
        assert_eq!(constructs, 1);
    }

    #[tokio::test]
    async fn focus_moves_directives_to_that_page() {
        let hub = BridgeHub::new(Duration::from_millis(50));
        let first = hub.attach();
        let mut second = hub.attach();
        let session = hub.page_session();

        assert!(hub.focus(first.id));
        assert_eq!(hub.page_session(), session + 1);
        assert!(hub.focus(first.id));
        assert_eq!(hub.page_session(), session + 1);

        let _ = hub.probe().await;
        assert!(second.directives.try_recv().is_err());
        assert!(!hub.focus(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn superseded_widgets_release_their_callbacks() {
        let hub = BridgeHub::new(Duration::from_millis(200));
        let manager = manager(&hub);
        let _page = scripted_page(&hub);

        for n in 0..5 {
            open(&manager, &format!("tok_{n}")).await.unwrap();
        }
        assert_eq!(hub.registry().widgets.len(), 1);
    }
}
