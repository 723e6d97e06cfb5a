use tracing::error;

/// Delivery of operator notifications (mail, chat, ...).
pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, body: &str);
}

/// Reports notifications through the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, body: &str) {
        error!(subject, body, "notification");
    }
}
