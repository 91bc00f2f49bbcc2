//! Foreground notice shown while the proxy service is alive

use std::sync::Arc;
use tracing::info;

/// Identifier of the service notice
pub const NOTICE_ID: u32 = 101;

/// Channel the notice is posted on
pub const NOTICE_CHANNEL: &str = "proxy_service_channel";

/// Title of the service notice
pub const NOTICE_TITLE: &str = "Hotspot Proxy";

/// Content of the ongoing service notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: u32,
    pub channel: &'static str,
    pub title: String,
    pub text: String,
    pub ongoing: bool,
}

impl Notice {
    /// Build the notice for the given engine state
    pub fn for_state(running: bool, port: u16) -> Self {
        let text = if running {
            format!("Running on port {}", port)
        } else {
            "Service active".to_string()
        };

        Notice {
            id: NOTICE_ID,
            channel: NOTICE_CHANNEL,
            title: NOTICE_TITLE.to_string(),
            text,
            ongoing: true,
        }
    }
}

/// Sink for service notices
///
/// Implemented by whatever surface the host shows status on.
pub trait Notifier: Send + Sync {
    /// Post or replace a notice
    fn post(&self, notice: &Notice);

    /// Withdraw the notice with the given id
    fn cancel(&self, id: u32);
}

impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    fn post(&self, notice: &Notice) {
        (**self).post(notice)
    }

    fn cancel(&self, id: u32) {
        (**self).cancel(id)
    }
}

/// Notifier that reports through the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn post(&self, notice: &Notice) {
        info!(id = notice.id, title = %notice.title, "{}", notice.text);
    }

    fn cancel(&self, id: u32) {
        info!(id, "notice withdrawn");
    }
}
