use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusTag {
    Loading,
    Success,
    Error,
}

/// What the connect page binds to. `status` is `None` until the first attempt starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusTag>,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

#[derive(Debug)]
pub struct StatusBoard {
    tx: watch::Sender<StatusSnapshot>,
    notice_seq: AtomicU64,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot {
            label: "Waiting for connection".to_string(),
            ..StatusSnapshot::default()
        });
        Self {
            tx,
            notice_seq: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn loading(&self, label: impl Into<String>) {
        self.set(StatusTag::Loading, label.into(), None);
    }

    pub fn error(&self, label: impl Into<String>) {
        self.set(StatusTag::Error, label.into(), None);
    }

    pub fn connected(&self, label: impl Into<String>, item_id: &str) {
        self.set(StatusTag::Success, label.into(), Some(item_id.to_string()));
    }

    /// Show a transient notice that clears itself after `hide_after`, unless a newer
    /// notice replaced it in the meantime.
    pub fn flash_notice(self: &Arc<Self>, text: impl Into<String>, hide_after: Duration) {
        let seq = self.notice_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let text = text.into();
        self.tx.send_modify(|s| s.notice = Some(text));
        let board = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(hide_after).await;
            if board.notice_seq.load(Ordering::SeqCst) == seq {
                board.tx.send_modify(|s| s.notice = None);
            }
        });
    }

    fn set(&self, tag: StatusTag, label: String, item_id: Option<String>) {
        self.tx.send_modify(|s| {
            s.status = Some(tag);
            s.label = label;
            s.item_id = item_id;
        });
    }
}
