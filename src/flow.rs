use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Instrument, debug, info_span};

use crate::error::ConnectError;
use crate::eventlog::EventLog;
use crate::loader::SdkLoader;
use crate::pluggy::PluggyClient;
use crate::status::StatusBoard;
use crate::vendor::UserMetadata;
use crate::widget::{WidgetManager, WidgetSession};

/// What the connect form submits.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectForm {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl ConnectForm {
    pub fn metadata(&self) -> UserMetadata {
        UserMetadata {
            name: non_blank(self.name.as_deref()),
            email: non_blank(self.email.as_deref()),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Held while a connection attempt runs; releases the re-entry flag when dropped,
/// whatever way the attempt ends.
pub struct FlowGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// One user action: token → SDK → widget.
pub struct ConnectFlow {
    pluggy: PluggyClient,
    loader: Arc<SdkLoader>,
    widgets: Arc<WidgetManager>,
    log: Arc<EventLog>,
    status: Arc<StatusBoard>,
    busy: Arc<AtomicBool>,
}

impl ConnectFlow {
    pub fn new(
        pluggy: PluggyClient,
        loader: Arc<SdkLoader>,
        widgets: Arc<WidgetManager>,
        log: Arc<EventLog>,
        status: Arc<StatusBoard>,
    ) -> Self {
        Self {
            pluggy,
            loader,
            widgets,
            log,
            status,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn in_progress(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn try_begin(&self) -> Option<FlowGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| FlowGuard {
                busy: self.busy.clone(),
            })
    }

    #[cfg(test)]
    pub async fn connect(&self, form: ConnectForm) -> Result<WidgetSession, ConnectError> {
        let Some(guard) = self.try_begin() else {
            self.log
                .warning("Connection already in progress; request ignored");
            return Err(ConnectError::Busy);
        };
        self.run(guard, form).await
    }

    /// Run an attempt under a guard the caller already took.
    pub async fn run(
        &self,
        _guard: FlowGuard,
        form: ConnectForm,
    ) -> Result<WidgetSession, ConnectError> {
        let metadata = form.metadata();
        if metadata.email.is_none() {
            self.log
                .warning("No email given; using an anonymous session id");
        }
        let span = info_span!("connect", email = ?metadata.email);
        let result = self.attempt(metadata).instrument(span).await;
        if let Err(err) = &result {
            self.status.error(err.user_label());
            self.log.warning(format!(
                "Connection attempt aborted ({:?}); submit the form to try again",
                err.kind()
            ));
        }
        result
    }

    async fn attempt(&self, metadata: UserMetadata) -> Result<WidgetSession, ConnectError> {
        self.status.loading("Generating connect token...");
        // the SDK load does not depend on the token, so both start together
        let (token, sdk) = tokio::join!(
            self.pluggy.acquire_token(metadata.email.as_deref()),
            self.loader.ensure_ready()
        );
        let token = token?;
        sdk?;
        self.log.info(format!(
            "Token ready ({}) for {}",
            token.preview(),
            token.user_id().unwrap_or("anonymous")
        ));
        debug!(issued_at = %token.issued_at(), "connect token issued");
        self.status.loading("Opening Pluggy Connect...");
        self.widgets.open_widget(token, metadata).await
    }
}
