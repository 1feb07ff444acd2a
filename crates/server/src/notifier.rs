use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ladder_core::config::NotificationsConfig;
use ladder_core::workflow::{Notification, Notifier, NotifyError};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{info, warn};

/// Writes every notification to the log. Used when no webhook is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        info!(
            event_name = "notification.logged",
            kind = notification.kind.as_str(),
            institution_id = %notification.institution_id,
            recipient = %notification.recipient,
            approval_id = %notification.approval_id,
            task_id = notification.task_id.as_ref().map(|id| id.0.as_str()).unwrap_or("none"),
            message = %notification.message,
            "notification recorded"
        );
        Ok(())
    }
}

/// POSTs each notification as JSON to a configured endpoint.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
    token: Option<SecretString>,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    event: &'static str,
    notification: &'a Notification,
}

impl WebhookNotifier {
    pub fn new(
        url: impl Into<String>,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into(), token })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let payload = WebhookPayload { event: notification.kind.as_str(), notification: &notification };
        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|error| {
            warn!(
                event_name = "notification.webhook.transport_error",
                approval_id = %notification.approval_id,
                error = %error,
                "webhook request failed"
            );
            NotifyError::Delivery(error.to_string())
        })?;

        if !response.status().is_success() {
            warn!(
                event_name = "notification.webhook.rejected",
                approval_id = %notification.approval_id,
                status = %response.status(),
                "webhook endpoint rejected notification"
            );
            return Err(NotifyError::Delivery(format!(
                "webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Picks the webhook notifier when a URL is configured, otherwise logs only.
pub fn from_config(config: &NotificationsConfig) -> Result<Arc<dyn Notifier>, reqwest::Error> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(
            url.clone(),
            config.webhook_token.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)),
        None => Ok(Arc::new(TracingNotifier)),
    }
}
