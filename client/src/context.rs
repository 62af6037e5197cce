//! Application-wide services, constructed once at startup.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;

use ngm_config::ResolvedConfig;
use ngm_core::{
    CancelGroupRegistry, Navigator, Notifier, Rejection, RejectionMonitor, RejectionReporter,
    SessionGuard, TokenStore, combine,
};

use crate::{Client, ClientBuilder, RequestError, RequestOptions};

/// Owns the request layer's shared state. Pass it (or pieces of it) to
/// consumers instead of reaching for globals.
pub struct AppContext {
    pub config: ResolvedConfig,
    pub store: Arc<dyn TokenStore>,
    pub notifier: Arc<dyn Notifier>,
    pub session: Arc<SessionGuard>,
    pub groups: CancelGroupRegistry,
    pub client: Client,
    pub rejections: RejectionReporter,
    monitor: JoinHandle<()>,
}

impl AppContext {
    /// Wire everything together and start the rejection monitor.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: ResolvedConfig,
        store: Arc<dyn TokenStore>,
        notifier: Arc<dyn Notifier>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self, reqwest::Error> {
        let session = Arc::new(SessionGuard::new(
            store.clone(),
            navigator,
            config.login_path.clone(),
            config.public_views.clone(),
        ));
        Self::with_client(
            ClientBuilder::from_config(&config, store.clone(), session.clone()),
            config,
            store,
            notifier,
            session,
        )
    }

    /// Like [`start`](Self::start) with a caller-tuned client builder.
    pub fn with_client(
        builder: ClientBuilder,
        config: ResolvedConfig,
        store: Arc<dyn TokenStore>,
        notifier: Arc<dyn Notifier>,
        session: Arc<SessionGuard>,
    ) -> Result<Self, reqwest::Error> {
        let client = builder.build()?;
        let (rejections, monitor) = RejectionMonitor::start(notifier.clone());
        tracing::info!(
            api_base = %config.api_base,
            environment = %config.environment,
            "Request layer started"
        );
        Ok(Self {
            config,
            store,
            notifier,
            session,
            groups: CancelGroupRegistry::new(),
            client,
            rejections,
            monitor,
        })
    }

    /// Issue a call in cancel group `key`, superseding any call still running there.
    pub async fn request_in_group(
        &self,
        key: &str,
        url: &str,
        mut options: RequestOptions,
    ) -> Result<Option<Value>, RequestError> {
        let group = self.groups.begin(key);
        options.signal = Some(match options.signal.take() {
            Some(caller) => combine(&[group, caller]),
            None => group,
        });
        self.client.request(url, options).await
    }

    /// Run `task` in the background; its failure goes to the rejection monitor.
    pub fn spawn<F, E>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<Rejection> + Send + 'static,
    {
        self.rejections.spawn(task)
    }

    /// Page teardown: cancel every group and stop the monitor.
    pub fn shutdown(self) {
        self.groups.cancel_all();
        self.monitor.abort();
        tracing::debug!("Request layer stopped");
    }
}
