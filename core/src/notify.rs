//! Capabilities the request layer consumes but does not render.

/// Toast-style notification surface.
pub trait Notifier: Send + Sync {
    fn success(&self, title: &str, message: &str);
    fn warning(&self, title: &str, message: &str);
    fn error(&self, title: &str, message: &str, details: Option<&str>);
}

/// Page navigation. Session invalidation navigates to the login location.
pub trait Navigator: Send + Sync {
    fn navigate(&self, location: &str);
}

/// Notifier that only writes structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn success(&self, title: &str, message: &str) {
        tracing::info!(title, message, "Notification");
    }

    fn warning(&self, title: &str, message: &str) {
        tracing::warn!(title, message, "Notification");
    }

    fn error(&self, title: &str, message: &str, details: Option<&str>) {
        tracing::error!(title, message, details, "Notification");
    }
}
