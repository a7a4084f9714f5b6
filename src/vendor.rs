//! Contract with the Pluggy Connect SDK.
//!
//! The SDK surface has drifted between releases: some builds expose a static `create`
//! factory, some are constructed directly, and `open` lives either on each instance or
//! on the global entry point. Each capability is therefore an `Option`, and the widget
//! manager decides which one to use.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::VendorError;

pub type SdkHandle = Arc<dyn VendorSdk>;

/// The vendor's global entry point once its script has executed.
pub trait VendorSdk: Send + Sync {
    /// Static factory (`PluggyConnect.create(options)`).
    fn factory(&self) -> Option<&dyn WidgetBuilder>;
    /// Direct construction (`new PluggyConnect(options)`).
    fn constructor(&self) -> Option<&dyn WidgetBuilder>;
    /// `open` on the entry point itself, acting on the most recently built widget.
    fn global_opener(&self) -> Option<&dyn Opener>;
    /// Whether instances get `open` from the prototype.
    fn prototype_has_open(&self) -> bool;
}

/// Entry point exists and an `open` capability is reachable from it.
pub fn exposes_open(sdk: &dyn VendorSdk) -> bool {
    sdk.prototype_has_open() || sdk.global_opener().is_some()
}

pub trait WidgetBuilder: Send + Sync {
    fn build(&self, options: WidgetOptions) -> Result<Box<dyn VendorWidget>, VendorError>;
}

pub trait VendorWidget: Send + Sync {
    fn opener(&self) -> Option<&dyn Opener>;
}

pub trait Opener: Send + Sync {
    fn open(&self) -> Result<(), VendorError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Construction options handed to the vendor. Callbacks are not serialized; the
/// receiving side wires its own `onOpen`/`onClose`/`onError`/`onSuccess` to them.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetOptions {
    pub connect_token: String,
    pub include_sandbox: bool,
    pub language: String,
    pub theme: String,
    pub user_metadata: UserMetadata,
    #[serde(skip)]
    pub callbacks: WidgetCallbacks,
}

#[derive(Debug, Clone)]
pub enum WidgetEvent {
    Open,
    Close,
    Error(VendorError),
    Success(SuccessPayload),
}

impl WidgetEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WidgetEvent::Open => "open",
            WidgetEvent::Close => "close",
            WidgetEvent::Error(_) => "error",
            WidgetEvent::Success(_) => "success",
        }
    }
}

/// Payload of `onSuccess`. Only the item id is read here; the rest travels untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct SuccessPayload {
    pub item_id: Option<String>,
    pub raw: Value,
}

impl SuccessPayload {
    pub fn from_value(raw: Value) -> Self {
        let item_id = raw
            .get("itemId")
            .or_else(|| raw.get("item").and_then(|item| item.get("id")))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        Self { item_id, raw }
    }
}

/// Sender side of a widget session's callback channel.
#[derive(Debug, Clone)]
pub struct WidgetCallbacks {
    tx: mpsc::UnboundedSender<WidgetEvent>,
}

impl WidgetCallbacks {
    pub fn new(tx: mpsc::UnboundedSender<WidgetEvent>) -> Self {
        Self { tx }
    }

    #[cfg(test)]
    pub fn on_open(&self) {
        self.emit(WidgetEvent::Open);
    }

    #[cfg(test)]
    pub fn on_close(&self) {
        self.emit(WidgetEvent::Close);
    }

    #[cfg(test)]
    pub fn on_error(&self, err: VendorError) {
        self.emit(WidgetEvent::Error(err));
    }

    #[cfg(test)]
    pub fn on_success(&self, payload: SuccessPayload) {
        self.emit(WidgetEvent::Success(payload));
    }

    pub fn emit(&self, event: WidgetEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("widget callback after session ended; dropped");
        }
    }
}
