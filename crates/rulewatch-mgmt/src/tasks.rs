use crate::alarm::{alarm_notification, AlarmScan};
use crate::report::{report_notification, ReportBuilder, ReportQuery};
use crate::webhook::{broadcast, NotificationSink};
use crate::window::SearchWindow;
use rulewatch_sync::{
    GridClient, ReconcileSummary, ReconciliationEngine, RecordStore, Selection, StoreError,
    SyncError, ThroughputSource,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::Instrument;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Unknown task kind '{kind}' for task {task}")]
    UnknownKind { task: String, kind: String },
    #[error("Invalid parameters for task {task}: {source}")]
    InvalidParams {
        task: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Task {task} requires a {service} connection")]
    MissingConnection { task: String, service: &'static str },
    #[error("No task named {0}")]
    NotFound(String),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    SyncDatabase,
    AlarmStuck,
    ReportDaily,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [
        TaskKind::SyncDatabase,
        TaskKind::AlarmStuck,
        TaskKind::ReportDaily,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::SyncDatabase => "sync-database",
            TaskKind::AlarmStuck => "alarm-stuck",
            TaskKind::ReportDaily => "report-daily",
        }
    }

    /// Decode and check the parameters this kind needs.
    pub fn parse_params(&self, task: &str, params: &Value) -> Result<TaskParams, TaskError> {
        let params = match params {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        let invalid = |source| TaskError::InvalidParams {
            task: task.to_string(),
            source,
        };
        Ok(match self {
            TaskKind::SyncDatabase => {
                TaskParams::SyncDatabase(serde_json::from_value(params).map_err(invalid)?)
            }
            TaskKind::AlarmStuck => {
                TaskParams::AlarmStuck(serde_json::from_value(params).map_err(invalid)?)
            }
            TaskKind::ReportDaily => {
                TaskParams::ReportDaily(serde_json::from_value(params).map_err(invalid)?)
            }
        })
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// A task as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub params: Value,
}

fn default_enabled() -> bool {
    true
}

impl TaskDefinition {
    pub fn validate(&self) -> Result<ValidatedTask, TaskError> {
        let kind = TaskKind::from_str(&self.kind).map_err(|kind| TaskError::UnknownKind {
            task: self.name.clone(),
            kind,
        })?;
        Ok(ValidatedTask {
            name: self.name.clone(),
            description: self.description.clone(),
            enabled: self.enabled,
            params: kind.parse_params(&self.name, &self.params)?,
        })
    }
}

/// Validate every definition. The first failure is logged as critical and returned.
pub fn validate_all(definitions: &[TaskDefinition]) -> Result<Vec<ValidatedTask>, TaskError> {
    definitions
        .iter()
        .map(|definition| {
            definition.validate().map_err(|e| {
                tracing::error!(critical = true, task = %definition.name, "{}", e);
                e
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncDatabaseParams {
    pub task_name_to_update: String,
    pub n_workers: usize,
    #[serde(default)]
    pub refresh_all: bool,
    #[serde(default)]
    pub search_range_gte: Option<Value>,
    #[serde(default)]
    pub search_range_lte: Option<Value>,
    pub max_rows: usize,
    #[serde(default)]
    pub index: Option<String>,
}

impl SyncDatabaseParams {
    pub fn selection(&self) -> Selection {
        Selection::for_task(self.task_name_to_update.as_str())
            .created_between(self.search_range_gte.clone(), self.search_range_lte.clone())
            .refresh_all(self.refresh_all)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlarmStuckParams {
    #[serde(default)]
    pub search_range_gte: Option<Value>,
    #[serde(default)]
    pub search_range_lte: Option<Value>,
    pub max_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportDailyParams {
    pub report_title: String,
    pub rses: Vec<String>,
    pub using_task_name: String,
    pub percentage_stuck_warning_threshold: f64,
    #[serde(default)]
    pub search_range_gte: Option<Value>,
    #[serde(default)]
    pub search_range_lte: Option<Value>,
    pub max_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskParams {
    SyncDatabase(SyncDatabaseParams),
    AlarmStuck(AlarmStuckParams),
    ReportDaily(ReportDailyParams),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedTask {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub params: TaskParams,
}

impl ValidatedTask {
    pub fn kind(&self) -> TaskKind {
        match self.params {
            TaskParams::SyncDatabase(_) => TaskKind::SyncDatabase,
            TaskParams::AlarmStuck(_) => TaskKind::AlarmStuck,
            TaskParams::ReportDaily(_) => TaskKind::ReportDaily,
        }
    }
}

/// Collaborators shared by all tasks of one invocation.
#[derive(Clone)]
pub struct TaskContext {
    pub grid: Option<Arc<dyn GridClient>>,
    pub throughput: Option<Arc<dyn ThroughputSource>>,
    pub store: Arc<dyn RecordStore>,
    pub index: String,
    pub sinks: Vec<Arc<dyn NotificationSink>>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Synced(ReconcileSummary),
    Alarmed { alerts: usize, delivered: usize },
    Reported { sections: usize, delivered: usize },
}

pub struct TaskRunner {
    ctx: TaskContext,
}

impl TaskRunner {
    pub fn new(ctx: TaskContext) -> Self {
        Self { ctx }
    }

    /// Check that every collaborator the task needs is configured.
    pub fn check(&self, task: &ValidatedTask) -> Result<(), TaskError> {
        if task.kind() == TaskKind::SyncDatabase && self.ctx.grid.is_none() {
            return Err(TaskError::MissingConnection {
                task: task.name.clone(),
                service: "rucio",
            });
        }
        Ok(())
    }

    pub async fn run(&self, task: &ValidatedTask) -> Result<TaskOutcome, TaskError> {
        let span = tracing::info_span!("task", name = %task.name, kind = %task.kind());
        if let Err(e) = self.check(task) {
            tracing::error!(parent: &span, critical = true, "{}", e);
            return Err(e);
        }

        let started = Instant::now();
        let outcome = match &task.params {
            TaskParams::SyncDatabase(params) => self.sync_database(params, span.clone()).await,
            TaskParams::AlarmStuck(params) => {
                self.alarm_stuck(params, span.clone()).instrument(span.clone()).await
            }
            TaskParams::ReportDaily(params) => {
                self.report_daily(params, span.clone()).instrument(span.clone()).await
            }
        }?;
        tracing::info!(parent: &span, "Finished in {}s", started.elapsed().as_secs());
        Ok(outcome)
    }

    async fn sync_database(
        &self,
        params: &SyncDatabaseParams,
        span: tracing::Span,
    ) -> Result<TaskOutcome, TaskError> {
        let Some(grid) = self.ctx.grid.clone() else {
            return Err(TaskError::MissingConnection {
                task: params.task_name_to_update.clone(),
                service: "rucio",
            });
        };
        let index = params.index.clone().unwrap_or_else(|| self.ctx.index.clone());
        let mut engine = ReconciliationEngine::new(grid, self.ctx.store.clone(), index, span);
        if let Some(source) = &self.ctx.throughput {
            engine = engine.with_throughput_source(source.clone());
        }
        let summary = engine
            .reconcile(&params.selection().to_filter(), params.max_rows, params.n_workers)
            .await?;
        Ok(TaskOutcome::Synced(summary))
    }

    async fn alarm_stuck(
        &self,
        params: &AlarmStuckParams,
        span: tracing::Span,
    ) -> Result<TaskOutcome, TaskError> {
        let window = SearchWindow::new(
            params.search_range_gte.clone(),
            params.search_range_lte.clone(),
        );
        let alerts = AlarmScan::new(self.ctx.store.clone(), self.ctx.index.clone(), span)
            .scan(&window, params.max_rows)
            .await?;
        let delivered = match alarm_notification(&alerts) {
            Some(notification) => broadcast(&self.ctx.sinks, &notification).await,
            None => {
                tracing::info!("No stuck rules found");
                0
            }
        };
        Ok(TaskOutcome::Alarmed {
            alerts: alerts.len(),
            delivered,
        })
    }

    async fn report_daily(
        &self,
        params: &ReportDailyParams,
        span: tracing::Span,
    ) -> Result<TaskOutcome, TaskError> {
        let query = ReportQuery {
            elements: params.rses.clone(),
            task_name: params.using_task_name.clone(),
            window: SearchWindow::new(
                params.search_range_gte.clone(),
                params.search_range_lte.clone(),
            ),
            max_rows: params.max_rows,
        };
        let reports = ReportBuilder::new(self.ctx.store.clone(), self.ctx.index.clone(), span)
            .collect(&query)
            .await?;
        let date = chrono::Local::now().format("%d-%m-%Y").to_string();
        let notification = report_notification(
            &params.report_title,
            &date,
            params.percentage_stuck_warning_threshold,
            &reports,
        );
        let delivered = broadcast(&self.ctx.sinks, &notification).await;
        Ok(TaskOutcome::Reported {
            sections: notification.sections.len(),
            delivered,
        })
    }
}
