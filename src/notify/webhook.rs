use askama::Template;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{Alert, Notifier, NotifyError};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Template)]
#[template(path = "alert.html")]
struct AlertTemplate<'a> {
    alert: &'a Alert,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    #[serde(flatten)]
    alert: &'a Alert,
    html: String,
}

/// POSTs each alert as JSON, with an HTML rendering under `html`.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let html = AlertTemplate { alert }.render()?;
        let payload = WebhookPayload { alert, html };

        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(NotifyError::Rejected(format!("status {}: {}", status, body)));
        }

        tracing::info!("Alert for '{}' delivered to webhook", alert.monitor_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MonitorDefinition, ProbeResult};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert() -> Alert {
        let monitor = MonitorDefinition {
            id: "m-1".to_string(),
            name: "Checkout <API>".to_string(),
            monitor_type: "http".to_string(),
            target: "https://shop.example".to_string(),
            ..Default::default()
        };
        let result = ProbeResult::failed(&monitor, "probe timed out after 5s");
        Alert::new(&monitor, &result, 3, "http://localhost:3000")
    }

    #[test]
    fn test_template_escapes_html() {
        let html = AlertTemplate { alert: &alert() }.render().unwrap();
        assert!(html.contains("Checkout &lt;API&gt;"));
        assert!(html.contains("#monitor"));
        assert!(html.contains("probe timed out after 5s"));
    }

    #[tokio::test]
    async fn test_webhook_posts_alert() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({
                "subject": "Pulsetrail alert for: Checkout <API>",
                "monitorId": "m-1",
                "status": "failed",
                "failures": 3,
                "link": "http://localhost:3000/#monitor/m-1",
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.uri())).unwrap();
        notifier.notify(&alert()).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("nope"))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri()).unwrap();
        let err = notifier.notify(&alert()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Rejected(ref msg) if msg.contains("nope")));
    }
}
