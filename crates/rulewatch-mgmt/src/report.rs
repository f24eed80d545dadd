use crate::webhook::{Layout, Notification, Section, SectionField};
use crate::window::SearchWindow;
use rulewatch_sync::{Filter, RecordStore, StoreError};
use std::fmt;
use std::sync::Arc;
use tracing::{Instrument, Span};

/// Whether a storage element is counted as the source or the destination of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Destination,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Source, Role::Destination];

    pub fn field(&self) -> &'static str {
        match self {
            Role::Source => "from_rse",
            Role::Destination => "to_rse",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::Source => "src",
            Role::Destination => "dst",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "As {}", self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Warning,
}

impl Health {
    pub fn symbol(&self) -> &'static str {
        match self {
            Health::Healthy => ":ok:",
            Health::Warning => ":warning:",
        }
    }
}

/// Record counts for one storage element in one role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleCounts {
    pub submitted: usize,
    pub stuck: usize,
    pub replicating: usize,
    pub done: usize,
}

impl RoleCounts {
    pub const FLAGS: [&'static str; 4] = ["is_submitted", "is_stuck", "is_replicating", "is_done"];

    fn set(&mut self, flag: &str, count: usize) {
        match flag {
            "is_submitted" => self.submitted = count,
            "is_stuck" => self.stuck = count,
            "is_replicating" => self.replicating = count,
            "is_done" => self.done = count,
            _ => {}
        }
    }

    /// `done / submitted`, or `0.0` when nothing was submitted.
    pub fn success_rate(&self) -> f64 {
        if self.submitted == 0 {
            return 0.0;
        }
        self.done as f64 / self.submitted as f64
    }

    pub fn health(&self, stuck_threshold: f64) -> Health {
        if self.stuck as f64 > stuck_threshold || self.submitted == 0 {
            Health::Warning
        } else {
            Health::Healthy
        }
    }

    pub fn summary_line(&self) -> String {
        format!(
            ":arrow_up: {:4}\t:heavy_check_mark: {:4}\t:x: {:4}\t:arrow_forward: {:4}\t({:.1}%)",
            self.submitted,
            self.done,
            self.stuck,
            self.replicating,
            self.success_rate() * 100.0
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementReport {
    pub element: String,
    pub role: Role,
    pub counts: RoleCounts,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportQuery {
    pub elements: Vec<String>,
    pub task_name: String,
    pub window: SearchWindow,
    pub max_rows: usize,
}

impl ReportQuery {
    pub fn filter(&self, flag: &str, element: &str, role: Role) -> Filter {
        let filter = Filter::new()
            .term(flag, 1)
            .term("task_name", self.task_name.as_str())
            .term(role.field(), element);
        self.window.restrict(filter)
    }
}

/// Bucketed counts over the record store.
pub struct ReportBuilder {
    store: Arc<dyn RecordStore>,
    index: String,
    span: Span,
}

impl ReportBuilder {
    pub fn new(store: Arc<dyn RecordStore>, index: impl Into<String>, span: Span) -> Self {
        Self {
            store,
            index: index.into(),
            span,
        }
    }

    /// Count every flag for every element in both roles. Any failed count
    /// fails the whole report.
    pub async fn collect(&self, query: &ReportQuery) -> Result<Vec<ElementReport>, StoreError> {
        async move {
            let mut reports = Vec::with_capacity(query.elements.len() * 2);
            for element in &query.elements {
                for role in Role::ALL {
                    let mut counts = RoleCounts::default();
                    for flag in RoleCounts::FLAGS {
                        let filter = query.filter(flag, element, role);
                        let count = self.store.count(&self.index, &filter, query.max_rows).await?;
                        counts.set(flag, count);
                    }
                    tracing::debug!(element = %element, role = role.label(), ?counts, "Counted");
                    reports.push(ElementReport {
                        element: element.clone(),
                        role,
                        counts,
                    });
                }
            }
            Ok::<_, StoreError>(reports)
        }
        .instrument(self.span.clone())
        .await
    }
}

/// Render element reports as one notification, one section per element with
/// a line per role.
pub fn report_notification(
    title: &str,
    date: &str,
    stuck_threshold: f64,
    reports: &[ElementReport],
) -> Notification {
    let mut notification = Notification::new(format!("{title} ({date})"), Layout::Blocks)
        .with_summary(format!("Stuck Threshold (%): {stuck_threshold}"));
    let mut sections: Vec<Section> = Vec::new();
    for report in reports {
        let field = SectionField {
            title: format!("{}\t{}", report.counts.health(stuck_threshold).symbol(), report.role),
            value: report.counts.summary_line(),
        };
        match sections.last_mut() {
            Some(section) if section.title == report.element => section.fields.push(field),
            _ => sections.push(Section {
                title: report.element.clone(),
                fields: vec![field],
            }),
        }
    }
    for section in sections {
        notification = notification.with_section(section);
    }
    notification
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulewatch_sync::MemoryRecordStore;
    use serde_json::{json, Value};

    #[test]
    fn test_success_rate_zero_without_submissions() {
        let counts = RoleCounts {
            done: 3,
            ..RoleCounts::default()
        };
        assert_eq!(counts.success_rate(), 0.0);
        assert_eq!(counts.health(10.0), Health::Warning);
    }

    #[test]
    fn test_success_rate_and_health() {
        let counts = RoleCounts {
            submitted: 10,
            stuck: 2,
            replicating: 1,
            done: 7,
        };
        assert!((counts.success_rate() - 0.7).abs() < 1e-9);
        assert_eq!(counts.health(2.0), Health::Healthy);
        assert_eq!(counts.health(1.0), Health::Warning);
    }

    #[test]
    fn test_filter_targets_role_field() {
        let query = ReportQuery {
            elements: vec!["SITE_A".to_string()],
            task_name: "nightly".to_string(),
            window: SearchWindow::default(),
            max_rows: 1000,
        };
        let fields: Vec<_> = query
            .filter("is_done", "SITE_A", Role::Destination)
            .predicates()
            .iter()
            .map(|p| p.field().to_string())
            .collect();
        assert_eq!(fields, vec!["is_done", "task_name", "to_rse"]);
    }

    async fn put(store: &MemoryRecordStore, id: &str, from: &str, to: &str, state_flag: &str) {
        let mut doc = json!({
            "rule_id": id,
            "task_name": "nightly",
            "from_rse": from,
            "to_rse": to,
            "created_at": "2024-03-14T09:00:00",
            "is_submitted": 1,
            "is_done": 0,
            "is_stuck": 0,
            "is_replicating": 0,
        });
        doc[state_flag] = json!(1);
        let Value::Object(doc) = doc else {
            unreachable!()
        };
        store.upsert("rules", id, doc).await.unwrap();
    }

    #[tokio::test]
    async fn test_collect_counts_both_roles() {
        let store = Arc::new(MemoryRecordStore::new());
        put(&store, "r1", "SITE_A", "SITE_B", "is_done").await;
        put(&store, "r2", "SITE_A", "SITE_B", "is_stuck").await;
        put(&store, "r3", "SITE_A", "SITE_C", "is_done").await;
        put(&store, "r4", "SITE_B", "SITE_A", "is_replicating").await;

        let query = ReportQuery {
            elements: vec!["SITE_A".to_string(), "SITE_B".to_string()],
            task_name: "nightly".to_string(),
            window: SearchWindow::new(Some(json!("2024-03-14T00:00:00")), None),
            max_rows: 1000,
        };
        let reports = ReportBuilder::new(store, "rules", Span::none())
            .collect(&query)
            .await
            .unwrap();

        assert_eq!(reports.len(), 4);
        let site_a_src = &reports[0];
        assert_eq!((site_a_src.element.as_str(), site_a_src.role), ("SITE_A", Role::Source));
        assert_eq!(
            site_a_src.counts,
            RoleCounts {
                submitted: 3,
                stuck: 1,
                replicating: 0,
                done: 2
            }
        );
        assert_eq!(reports[1].counts.replicating, 1);
        assert_eq!(reports[3].counts.submitted, 2);
        assert_eq!(reports[3].counts.done, 1);
    }

    #[test]
    fn test_notification_has_one_field_per_role() {
        let reports = vec![
            ElementReport {
                element: "SITE_A".to_string(),
                role: Role::Source,
                counts: RoleCounts {
                    submitted: 4,
                    stuck: 0,
                    replicating: 0,
                    done: 4,
                },
            },
            ElementReport {
                element: "SITE_A".to_string(),
                role: Role::Destination,
                counts: RoleCounts::default(),
            },
        ];
        let notification = report_notification("Daily report", "14-03-2024", 5.0, &reports);
        assert_eq!(notification.header, "Daily report (14-03-2024)");
        assert_eq!(notification.sections.len(), 1);
        let fields = &notification.sections[0].fields;
        assert_eq!(fields[0].title, ":ok:\tAs src");
        assert_eq!(fields[1].title, ":warning:\tAs dst");
        assert!(fields[0].value.contains("(100.0%)"));
    }
}
