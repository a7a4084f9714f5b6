//! Test doubles for the script environment and the vendor SDK.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::InjectMode;
use crate::error::VendorError;
use crate::loader::{ScriptEnvironment, ScriptError};
use crate::vendor::{
    Opener, SdkHandle, VendorSdk, VendorWidget, WidgetBuilder, WidgetCallbacks, WidgetOptions,
};
use crate::widget::{ConstructionStyle, OpenTarget};

/// Which capabilities the fake entry point exposes.
#[derive(Debug, Clone, Copy)]
pub struct FakeShape {
    pub factory: bool,
    pub constructor: bool,
    /// What a built widget exposes.
    pub instance_open: bool,
    /// What the loader sees on the entry point's prototype.
    pub prototype_open: bool,
    pub global_open: bool,
}

impl Default for FakeShape {
    fn default() -> Self {
        Self {
            factory: false,
            constructor: true,
            instance_open: true,
            prototype_open: true,
            global_open: false,
        }
    }
}

pub struct BuiltWidget {
    pub style: ConstructionStyle,
    pub options: WidgetOptions,
}

/// Everything the fake vendor was asked to do.
#[derive(Default)]
pub struct VendorRecord {
    built: Mutex<Vec<BuiltWidget>>,
    opened: Mutex<Vec<OpenTarget>>,
}

impl VendorRecord {
    pub fn built_count(&self) -> usize {
        self.built.lock().unwrap().len()
    }

    pub fn style(&self, index: usize) -> ConstructionStyle {
        self.built.lock().unwrap()[index].style
    }

    pub fn token(&self, index: usize) -> String {
        self.built.lock().unwrap()[index].options.connect_token.clone()
    }

    pub fn options_json(&self, index: usize) -> serde_json::Value {
        serde_json::to_value(&self.built.lock().unwrap()[index].options).unwrap()
    }

    /// Callbacks wired into the widget at `index`; the test plays the vendor with them.
    pub fn callbacks(&self, index: usize) -> WidgetCallbacks {
        self.built.lock().unwrap()[index].options.callbacks.clone()
    }

    pub fn opened(&self) -> Vec<OpenTarget> {
        self.opened.lock().unwrap().clone()
    }
}

struct FakeBuilder {
    style: ConstructionStyle,
    instance_open: bool,
    record: Arc<VendorRecord>,
}

impl WidgetBuilder for FakeBuilder {
    fn build(&self, options: WidgetOptions) -> Result<Box<dyn VendorWidget>, VendorError> {
        self.record.built.lock().unwrap().push(BuiltWidget {
            style: self.style,
            options,
        });
        Ok(Box::new(FakeWidget {
            opener: self.instance_open.then(|| FakeOpener {
                target: OpenTarget::Instance,
                record: self.record.clone(),
            }),
        }))
    }
}

struct FakeWidget {
    opener: Option<FakeOpener>,
}

impl VendorWidget for FakeWidget {
    fn opener(&self) -> Option<&dyn Opener> {
        self.opener.as_ref().map(|o| o as &dyn Opener)
    }
}

struct FakeOpener {
    target: OpenTarget,
    record: Arc<VendorRecord>,
}

impl Opener for FakeOpener {
    fn open(&self) -> Result<(), VendorError> {
        self.record.opened.lock().unwrap().push(self.target);
        Ok(())
    }
}

pub struct FakeSdk {
    shape: FakeShape,
    record: Arc<VendorRecord>,
    factory: FakeBuilder,
    constructor: FakeBuilder,
    global: FakeOpener,
}

impl FakeSdk {
    pub fn new(shape: FakeShape) -> Arc<Self> {
        let record = Arc::new(VendorRecord::default());
        Arc::new(Self {
            shape,
            factory: FakeBuilder {
                style: ConstructionStyle::Factory,
                instance_open: shape.instance_open,
                record: record.clone(),
            },
            constructor: FakeBuilder {
                style: ConstructionStyle::Constructor,
                instance_open: shape.instance_open,
                record: record.clone(),
            },
            global: FakeOpener {
                target: OpenTarget::Global,
                record: record.clone(),
            },
            record,
        })
    }

    pub fn record(&self) -> Arc<VendorRecord> {
        self.record.clone()
    }
}

impl VendorSdk for FakeSdk {
    fn factory(&self) -> Option<&dyn WidgetBuilder> {
        self.shape
            .factory
            .then_some(&self.factory as &dyn WidgetBuilder)
    }

    fn constructor(&self) -> Option<&dyn WidgetBuilder> {
        self.shape
            .constructor
            .then_some(&self.constructor as &dyn WidgetBuilder)
    }

    fn global_opener(&self) -> Option<&dyn Opener> {
        self.shape.global_open.then_some(&self.global as &dyn Opener)
    }

    fn prototype_has_open(&self) -> bool {
        self.shape.prototype_open
    }
}

/// Script environment that "loads" instantly (or after scripted delays) and exposes
/// the fake SDK after a number of probes.
pub struct FakeScriptEnv {
    sdk: SdkHandle,
    injections: AtomicU32,
    probes: AtomicU32,
    page: AtomicU64,
    ready_after: u32,
    never_ready: bool,
    failing: u32,
    delays: Mutex<VecDeque<Duration>>,
    default_delay: Duration,
}

impl FakeScriptEnv {
    pub fn new(sdk: Arc<FakeSdk>) -> Self {
        Self {
            sdk,
            injections: AtomicU32::new(0),
            probes: AtomicU32::new(0),
            page: AtomicU64::new(0),
            ready_after: 0,
            never_ready: false,
            failing: 0,
            delays: Mutex::new(VecDeque::new()),
            default_delay: Duration::ZERO,
        }
    }

    pub fn ready_after(mut self, probes: u32) -> Self {
        self.ready_after = probes;
        self
    }

    pub fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    pub fn failing_injections(mut self, count: u32) -> Self {
        self.failing = count;
        self
    }

    pub fn inject_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn inject_delays(self, delays: impl IntoIterator<Item = Duration>) -> Self {
        self.delays.lock().unwrap().extend(delays);
        self
    }

    pub fn injections(&self) -> u32 {
        self.injections.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    /// Simulate the page reloading: the next load runs in a fresh session.
    pub fn reload_page(&self) {
        self.page.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ScriptEnvironment for FakeScriptEnv {
    async fn inject(&self, _url: &str, _mode: InjectMode) -> Result<(), ScriptError> {
        let n = self.injections.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self
            .delays
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_delay);
        tokio::time::sleep(delay).await;
        if n <= self.failing {
            return Err(ScriptError::Load("network error".into()));
        }
        Ok(())
    }

    async fn probe(&self) -> Option<SdkHandle> {
        let n = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.never_ready || n <= self.ready_after {
            None
        } else {
            Some(self.sdk.clone())
        }
    }

    fn page_session(&self) -> u64 {
        self.page.load(Ordering::SeqCst)
    }
}
