use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

const ALERT_COLOR: &str = "#D00000";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Delivery to {endpoint} failed: {msg}")]
    Delivery { endpoint: String, msg: String },
    #[error("Endpoint {endpoint} rejected notification: HTTP {status}")]
    Rejected { endpoint: String, status: u16 },
}

/// How a notification is laid out when rendered for Slack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One coloured attachment per section.
    Attachments,
    /// A header block followed by one text block per field.
    Blocks,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectionField {
    pub title: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub title: String,
    pub fields: Vec<SectionField>,
}

impl Section {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, title: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(SectionField {
            title: title.into(),
            value: value.into(),
        });
        self
    }
}

/// An operator-facing message: header text plus a list of sections.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub header: String,
    pub summary: Vec<String>,
    pub sections: Vec<Section>,
    pub layout: Layout,
}

impl Notification {
    pub fn new(header: impl Into<String>, layout: Layout) -> Self {
        Self {
            header: header.into(),
            summary: Vec::new(),
            sections: Vec::new(),
            layout,
        }
    }

    pub fn with_summary(mut self, line: impl Into<String>) -> Self {
        self.summary.push(line.into());
        self
    }

    pub fn with_section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }

    pub fn to_slack_body(&self) -> Value {
        match self.layout {
            Layout::Attachments => {
                let attachments: Vec<Value> = self
                    .sections
                    .iter()
                    .map(|section| {
                        let fields: Vec<Value> = section
                            .fields
                            .iter()
                            .map(|f| json!({"title": f.title, "value": f.value, "short": false}))
                            .collect();
                        json!({
                            "fallback": section.title,
                            "pretext": section.title,
                            "color": ALERT_COLOR,
                            "fields": fields,
                        })
                    })
                    .collect();
                json!({"text": self.header, "attachments": attachments})
            }
            Layout::Blocks => {
                let mut blocks = vec![json!({
                    "type": "header",
                    "text": {"type": "plain_text", "text": self.header},
                })];
                for line in &self.summary {
                    blocks.push(mrkdwn(line));
                }
                blocks.push(json!({"type": "divider"}));
                for section in &self.sections {
                    blocks.push(mrkdwn(&format!("*{}*", section.title)));
                    for field in &section.fields {
                        blocks.push(mrkdwn(&format!("{}\t{}", field.title, field.value)));
                    }
                    blocks.push(json!({"type": "divider"}));
                }
                json!({"blocks": blocks})
            }
        }
    }
}

fn mrkdwn(text: &str) -> Value {
    json!({"type": "section", "text": {"type": "mrkdwn", "text": text}})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookKind {
    Slack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub name: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: WebhookKind,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_kind() -> WebhookKind {
    WebhookKind::Slack
}

fn default_timeout_secs() -> u64 {
    10
}

impl WebhookEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: WebhookKind::Slack,
            url: url.into(),
            headers: BTreeMap::new(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), WebhookError> {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(WebhookError::InvalidUrl(self.url.clone()));
        }
        Ok(())
    }

    pub fn render(&self, notification: &Notification) -> Value {
        match self.kind {
            WebhookKind::Slack => notification.to_slack_body(),
        }
    }
}

/// Somewhere notifications are delivered. Delivery is attempted once.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<(), WebhookError>;
}

pub struct HttpWebhookSink {
    client: reqwest::Client,
    endpoint: WebhookEndpoint,
}

impl HttpWebhookSink {
    pub fn new(endpoint: WebhookEndpoint) -> Result<Self, WebhookError> {
        endpoint.validate()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .build()
            .unwrap_or_default();
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl NotificationSink for HttpWebhookSink {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    async fn send(&self, notification: &Notification) -> Result<(), WebhookError> {
        let body = self.endpoint.render(notification);
        let mut request = self
            .client
            .post(&self.endpoint.url)
            .header("Accept-Charset", "UTF-8")
            .json(&body);
        for (key, value) in &self.endpoint.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| WebhookError::Delivery {
            endpoint: self.endpoint.name.clone(),
            msg: e.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(WebhookError::Rejected {
                endpoint: self.endpoint.name.clone(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Logs rendered bodies instead of posting them. Used by `run --dry-run`.
pub struct LogSink {
    endpoint: WebhookEndpoint,
    sent: Mutex<Vec<Value>>,
}

impl LogSink {
    pub fn new(endpoint: WebhookEndpoint) -> Self {
        Self {
            endpoint,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    async fn send(&self, notification: &Notification) -> Result<(), WebhookError> {
        let body = self.endpoint.render(notification);
        tracing::info!(webhook = %self.endpoint.name, "Would post: {}", body);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(body);
        }
        Ok(())
    }
}

/// Deliver to every sink. Failures are logged; returns how many succeeded.
pub async fn broadcast(
    sinks: &[std::sync::Arc<dyn NotificationSink>],
    notification: &Notification,
) -> usize {
    let mut delivered = 0;
    for sink in sinks {
        match sink.send(notification).await {
            Ok(()) => delivered += 1,
            Err(e) => tracing::warn!(webhook = sink.name(), "Failed to send notification: {}", e),
        }
    }
    delivered
}
