use async_trait::async_trait;
use reqwest::StatusCode;
use rulewatch_sync::grid_time::parse_grid_time;
use rulewatch_sync::{
    DataId, GridClient, GridError, GridResult, ReplicaLocation, RuleState, RuleStatus,
    TransferRequest,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

const AUTH_HEADER: &str = "X-Rucio-Auth-Token";
const STREAM_CONTENT_TYPE: &str = "application/x-json-stream";

/// Grid client speaking the Rucio REST API.
pub struct RucioClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    id: String,
    scope: String,
    name: String,
    rse_expression: String,
    #[serde(default)]
    source_replica_expression: Option<String>,
    created_at: String,
    updated_at: String,
    #[serde(default)]
    expires_at: Option<String>,
    state: String,
    #[serde(default)]
    error: Option<String>,
}

impl TryFrom<RawRule> for RuleStatus {
    type Error = GridError;

    fn try_from(raw: RawRule) -> GridResult<Self> {
        let state: RuleState = raw
            .state
            .parse()
            .map_err(|e: rulewatch_sync::state::UnknownState| malformed(e.to_string()))?;
        if state.is_upload_phase() {
            return Err(malformed(format!("grid reported local state {state}")));
        }
        let time = |raw: &str| parse_grid_time(raw).map_err(|e| malformed(e.to_string()));
        Ok(RuleStatus {
            id: raw.id,
            scope: raw.scope,
            name: raw.name,
            rse_expression: raw.rse_expression,
            source_replica_expression: raw.source_replica_expression,
            created_at: time(&raw.created_at)?,
            updated_at: time(&raw.updated_at)?,
            expires_at: raw.expires_at.as_deref().map(time).transpose()?,
            state,
            error: raw.error,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawReplica {
    #[serde(default)]
    rses: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawRequest {
    external_id: Option<String>,
}

fn malformed(msg: impl Into<String>) -> GridError {
    GridError::Malformed { msg: msg.into() }
}

fn transport(e: reqwest::Error) -> GridError {
    GridError::Transport { msg: e.to_string() }
}

/// Parse a newline-delimited JSON body, skipping blank lines.
pub fn parse_json_stream<T: DeserializeOwned>(body: &str) -> GridResult<Vec<T>> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).map_err(|e| malformed(e.to_string())))
        .collect()
}

fn did_path(did: &DataId) -> String {
    format!(
        "{}/{}",
        urlencoding::encode(&did.scope),
        urlencoding::encode(&did.name)
    )
}

/// Replicas at `dest_expr` first, in the order the grid listed them.
fn replicas_at(raw: Vec<RawReplica>, dest_expr: &str) -> Vec<ReplicaLocation> {
    let mut matching = Vec::new();
    let mut others = Vec::new();
    for replica in raw {
        for (rse, pfns) in replica.rses {
            let bucket = if rse == dest_expr { &mut matching } else { &mut others };
            bucket.extend(pfns.iter().map(|pfn| ReplicaLocation::from_pfn(pfn)));
        }
    }
    matching.extend(others);
    matching
}

impl RucioClient {
    pub fn new(base_url: &str, token: impl Into<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    async fn fetch(&self, request: reqwest::RequestBuilder) -> GridResult<Option<String>> {
        let response = request
            .header(AUTH_HEADER, &self.token)
            .header("Accept", STREAM_CONTENT_TYPE)
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(GridError::Transport {
                msg: format!("HTTP {}", response.status()),
            });
        }
        response.text().await.map(Some).map_err(transport)
    }

    async fn get(&self, path: &str) -> GridResult<Option<String>> {
        let url = format!("{}/{}", self.base_url, path);
        self.fetch(self.client.get(url)).await
    }
}

#[async_trait]
impl GridClient for RucioClient {
    async fn rule_status(&self, rule_id: &str) -> GridResult<RuleStatus> {
        let body = self
            .get(&format!("rules/{}", urlencoding::encode(rule_id)))
            .await?
            .ok_or_else(|| GridError::NotFound {
                rule_id: rule_id.to_string(),
            })?;
        let raw: RawRule = serde_json::from_str(&body).map_err(|e| malformed(e.to_string()))?;
        raw.try_into()
    }

    async fn list_rules(&self, did: &DataId) -> GridResult<Vec<RuleStatus>> {
        let Some(body) = self.get(&format!("dids/{}/rules", did_path(did))).await? else {
            return Ok(Vec::new());
        };
        parse_json_stream::<RawRule>(&body)?
            .into_iter()
            .map(RuleStatus::try_from)
            .collect()
    }

    async fn list_replicas(
        &self,
        did: &DataId,
        dest_expr: &str,
    ) -> GridResult<Vec<ReplicaLocation>> {
        let url = format!("{}/replicas/list", self.base_url);
        let body = json!({
            "dids": [{"scope": did.scope, "name": did.name}],
            "rse_expression": dest_expr,
        });
        let Some(text) = self.fetch(self.client.post(url).json(&body)).await? else {
            return Ok(Vec::new());
        };
        Ok(replicas_at(parse_json_stream(&text)?, dest_expr))
    }

    async fn list_child_items(&self, did: &DataId) -> GridResult<Vec<DataId>> {
        let Some(body) = self.get(&format!("dids/{}/dids", did_path(did))).await? else {
            return Ok(Vec::new());
        };
        parse_json_stream::<Value>(&body)?
            .into_iter()
            .map(|child| {
                match (
                    child.get("scope").and_then(Value::as_str),
                    child.get("name").and_then(Value::as_str),
                ) {
                    (Some(scope), Some(name)) => Ok(DataId::new(scope, name)),
                    _ => Err(malformed(format!("child entry without scope/name: {child}"))),
                }
            })
            .collect()
    }

    async fn transfer_request(
        &self,
        did: &DataId,
        dest_expr: &str,
    ) -> GridResult<TransferRequest> {
        let path = format!(
            "requests/history/{}/{}",
            did_path(did),
            urlencoding::encode(dest_expr)
        );
        let body = self.get(&path).await?.ok_or_else(|| GridError::NotFound {
            rule_id: did.to_string(),
        })?;
        let raw: RawRequest = serde_json::from_str(&body).map_err(|e| malformed(e.to_string()))?;
        raw.external_id
            .map(|external_job_id| TransferRequest { external_job_id })
            .ok_or_else(|| malformed(format!("request for {did} has no external id")))
    }
}
