use crate::webhook::{Layout, Notification, Section};
use crate::window::SearchWindow;
use rulewatch_sync::{Document, Filter, RecordStore, StoreError};
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, Span};

/// One stuck rule, as reported to operators.
#[derive(Debug, Clone, PartialEq)]
pub struct StuckAlert {
    pub rule_id: String,
    pub did: String,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub created_at: Option<String>,
    pub error: Option<String>,
}

impl StuckAlert {
    pub fn from_document(doc: &Document) -> Self {
        let text = |key: &str| match doc.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        Self {
            rule_id: text("rule_id").unwrap_or_default(),
            did: format!(
                "{}:{}",
                text("scope").unwrap_or_default(),
                text("name").unwrap_or_default()
            ),
            source: text("from_rse"),
            destination: text("to_rse"),
            created_at: text("created_at"),
            error: text("error"),
        }
    }

    pub fn headline(&self) -> String {
        format!(
            "STUCK: {} to {} @ {}",
            show(&self.source),
            show(&self.destination),
            show(&self.created_at)
        )
    }

    pub fn to_section(&self) -> Section {
        let description = format!(
            "rule id:    {}\ndid:        {}\nerror:      {}\n",
            self.rule_id,
            self.did,
            show(&self.error)
        );
        Section::new(self.headline()).field("Description", description)
    }
}

fn show(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("None")
}

/// Batch all alerts of one scan into a single notification. `None` when
/// there is nothing to report.
pub fn alarm_notification(alerts: &[StuckAlert]) -> Option<Notification> {
    if alerts.is_empty() {
        return None;
    }
    let header = format!("{} stuck replication rule(s)", alerts.len());
    Some(
        alerts
            .iter()
            .fold(Notification::new(header, Layout::Attachments), |n, alert| {
                n.with_section(alert.to_section())
            }),
    )
}

/// Searches the record store for stuck rules.
pub struct AlarmScan {
    store: Arc<dyn RecordStore>,
    index: String,
    span: Span,
}

impl AlarmScan {
    pub fn new(store: Arc<dyn RecordStore>, index: impl Into<String>, span: Span) -> Self {
        Self {
            store,
            index: index.into(),
            span,
        }
    }

    pub fn filter(window: &SearchWindow) -> Filter {
        window.restrict(Filter::new().term("is_stuck", 1))
    }

    pub async fn scan(
        &self,
        window: &SearchWindow,
        max_rows: usize,
    ) -> Result<Vec<StuckAlert>, StoreError> {
        async move {
            let hits = self
                .store
                .search(&self.index, &Self::filter(window), max_rows)
                .await?;
            let total = hits.len();
            Ok::<_, StoreError>(hits
                .iter()
                .enumerate()
                .map(|(idx, doc)| {
                    tracing::info!("Processing document {} of {}", idx + 1, total);
                    StuckAlert::from_document(doc)
                })
                .collect())
        }
        .instrument(self.span.clone())
        .await
    }
}
