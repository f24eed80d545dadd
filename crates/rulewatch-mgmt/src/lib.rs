#![warn(missing_docs)]

//! Rulewatch management subsystem: task runner, Elasticsearch/Rucio/FTS adapters,
//! alarms, reports, webhooks and the CLI.

pub mod alarm;
pub mod cli;
pub mod config;
pub mod elastic;
pub mod fts;
pub mod report;
pub mod rucio;
pub mod tasks;
pub mod webhook;
pub mod window;

pub use alarm::{AlarmScan, StuckAlert};
pub use config::{ConfigError, RulewatchConfig};
pub use elastic::ElasticStore;
pub use fts::{FtsClient, FtsError};
pub use report::{ReportBuilder, RoleCounts};
pub use rucio::RucioClient;
pub use tasks::{TaskContext, TaskError, TaskKind, TaskRunner};
pub use webhook::{HttpWebhookSink, Notification, NotificationSink, WebhookError};
