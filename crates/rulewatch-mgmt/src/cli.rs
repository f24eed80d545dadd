use crate::config::{DatabaseKind, RulewatchConfig};
use crate::elastic::ElasticStore;
use crate::fts::{read_identity_pem, FtsClient};
use crate::rucio::RucioClient;
use crate::tasks::{
    validate_all, TaskContext, TaskError, TaskOutcome, TaskRunner, ValidatedTask,
};
use crate::webhook::{HttpWebhookSink, LogSink, NotificationSink};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rulewatch_sync::{GridClient, MemoryRecordStore, RecordStore, ThroughputSource};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rulewatch")]
#[command(
    about = "Replication rule monitoring: database sync, stuck-rule alarms, reports",
    long_about = None
)]
pub struct Cli {
    #[arg(short, long, env = "RULEWATCH_CONFIG", default_value = "/etc/rulewatch/config.yml")]
    pub config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,

    #[arg(long)]
    pub log_json: bool,

    /// Overrides `rucio.auth_token` from the configuration
    #[arg(long, env = "RUCIO_AUTH_TOKEN", hide_env_values = true)]
    pub rucio_token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run every enabled task once, in configuration order
    Run {
        #[arg(short, long)]
        task: Option<String>,
        /// Log notifications instead of posting them
        #[arg(long)]
        dry_run: bool,
    },
    /// Load and validate the configuration, then print the task table
    Validate,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = RulewatchConfig::from_file(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        let tasks = validate_all(&config.tasks)?;

        match self.command {
            Command::Validate => {
                print_task_table(&tasks);
                Ok(())
            }
            Command::Run { ref task, dry_run } => {
                let selected = select_tasks(tasks, task.as_deref())?;
                let ctx = self.build_context(&config, dry_run)?;
                run_tasks(TaskRunner::new(ctx), &selected).await
            }
        }
    }

    fn build_context(&self, config: &RulewatchConfig, dry_run: bool) -> Result<TaskContext> {
        let store: Arc<dyn RecordStore> = match config.database.kind {
            DatabaseKind::Es => Arc::new(ElasticStore::new(
                &config.database.uri,
                config.database.timeout_secs,
            )),
            DatabaseKind::Memory => {
                tracing::warn!("Using in-memory record store, nothing will be persisted");
                Arc::new(MemoryRecordStore::new())
            }
        };

        let grid: Option<Arc<dyn GridClient>> = match &config.rucio {
            Some(rucio) => {
                let token = self
                    .rucio_token
                    .clone()
                    .or_else(|| rucio.auth_token.clone())
                    .context("rucio is configured but no auth token was given")?;
                Some(Arc::new(RucioClient::new(&rucio.url, token, rucio.timeout_secs)))
            }
            None => None,
        };

        let throughput: Option<Arc<dyn ThroughputSource>> = match &config.fts {
            Some(fts) => {
                let proxy = std::env::var_os("X509_USER_PROXY").map(PathBuf::from);
                let client = match fts.credentials(proxy) {
                    Some((cert, key)) => {
                        let pem = read_identity_pem(&cert, key.as_deref())?;
                        FtsClient::with_identity(&fts.url, fts.timeout_secs, fts.verify_tls, &pem)
                            .with_context(|| format!("loading FTS identity {}", cert.display()))?
                    }
                    None => {
                        tracing::warn!("No FTS client certificate configured, sending anonymously");
                        FtsClient::new(&fts.url, fts.timeout_secs, fts.verify_tls)
                    }
                };
                Some(Arc::new(client))
            }
            None => None,
        };

        let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::with_capacity(config.webhooks.len());
        for endpoint in &config.webhooks {
            if dry_run {
                sinks.push(Arc::new(LogSink::new(endpoint.clone())));
            } else {
                sinks.push(Arc::new(HttpWebhookSink::new(endpoint.clone())?));
            }
        }

        Ok(TaskContext {
            grid,
            throughput,
            store,
            index: config.database.index.clone(),
            sinks,
        })
    }
}

fn select_tasks(
    tasks: Vec<ValidatedTask>,
    name: Option<&str>,
) -> Result<Vec<ValidatedTask>, TaskError> {
    match name {
        Some(name) => tasks
            .into_iter()
            .find(|t| t.name == name)
            .map(|t| vec![t])
            .ok_or_else(|| TaskError::NotFound(name.to_string())),
        None => Ok(tasks.into_iter().filter(|t| t.enabled).collect()),
    }
}

async fn run_tasks(runner: TaskRunner, tasks: &[ValidatedTask]) -> Result<()> {
    for task in tasks {
        runner.check(task).map_err(|e| {
            tracing::error!(critical = true, task = %task.name, "{}", e);
            e
        })?;
    }

    let mut failed = 0;
    for task in tasks {
        tracing::info!(task = %task.name, "Running task");
        match runner.run(task).await {
            Ok(outcome) => print_outcome(&task.name, &outcome),
            Err(e) => {
                tracing::error!(task = %task.name, "Task failed: {}", e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} tasks failed", failed, tasks.len());
    }
    Ok(())
}

fn print_outcome(name: &str, outcome: &TaskOutcome) {
    match outcome {
        TaskOutcome::Synced(summary) => println!(
            "{name}: {} selected, {} updated, {} skipped",
            summary.selected, summary.updated, summary.skipped
        ),
        TaskOutcome::Alarmed { alerts, delivered } => {
            println!("{name}: {alerts} stuck rules, sent to {delivered} webhook(s)")
        }
        TaskOutcome::Reported { sections, delivered } => {
            println!("{name}: {sections} report sections, sent to {delivered} webhook(s)")
        }
    }
}

fn print_task_table(tasks: &[ValidatedTask]) {
    println!("{:<24} {:<16} {:<8} DESCRIPTION", "NAME", "KIND", "ENABLED");
    for task in tasks {
        println!(
            "{:<24} {:<16} {:<8} {}",
            task.name,
            task.kind().as_str(),
            task.enabled,
            task.description
        );
    }
}
