use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use tessera_core::config::NotificationConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::Notifier;
use tessera_core::types::Notification;

/// Writes notifications to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            info!(
                recipients = ?notification.recipients,
                template = %notification.template,
                channel = %notification.channel,
                priority = %notification.priority,
                "Notification"
            );
            Ok(())
        })
    }
}

/// POSTs notifications as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: Notification) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let resp = self
                .client
                .post(&self.url)
                .json(&notification)
                .send()
                .await
                .map_err(|e| TesseraError::Notification(e.to_string()))?;

            if !resp.status().is_success() {
                return Err(TesseraError::Notification(format!(
                    "webhook returned {}",
                    resp.status()
                )));
            }
            Ok(())
        })
    }
}

/// Build the notifier described by config.
pub fn from_config(config: &NotificationConfig) -> Arc<dyn Notifier> {
    match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    }
}

/// Send without waiting. Failures are logged and dropped.
pub fn dispatch(notifier: &Arc<dyn Notifier>, notification: Notification) {
    if notification.recipients.is_empty() {
        return;
    }
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        let template = notification.template.clone();
        if let Err(e) = notifier.notify(notification).await {
            warn!(template = %template, error = %e, "Notification delivery failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::workflow::Priority;

    fn sample() -> Notification {
        Notification {
            recipients: vec!["ops@example.com".into()],
            template: "approval_request".into(),
            channel: "email".into(),
            priority: Priority::High,
            data: serde_json::json!({"step": "send"}),
        }
    }

    #[tokio::test]
    async fn log_notifier_succeeds() {
        assert!(LogNotifier.notify(sample()).await.is_ok());
    }

    #[tokio::test]
    async fn webhook_unreachable_is_error() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook");
        let err = notifier.notify(sample()).await.unwrap_err();
        assert!(matches!(err, TesseraError::Notification(_)));
    }

    #[tokio::test]
    async fn config_selects_backend() {
        let webhook = from_config(&NotificationConfig {
            webhook_url: Some("http://127.0.0.1:9/hook".into()),
            default_channel: "log".into(),
        });
        let err = webhook.notify(sample()).await.unwrap_err();
        assert!(matches!(err, TesseraError::Notification(_)));

        let log = from_config(&NotificationConfig::default());
        log.notify(sample()).await.unwrap();
    }
}
