use async_trait::async_trait;
use reqwest::StatusCode;
use rulewatch_sync::{Document, Filter, Predicate, RecordStore, StoreError, StoreResult};
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Record store backed by an Elasticsearch cluster.
pub struct ElasticStore {
    client: reqwest::Client,
    base_url: String,
}

impl ElasticStore {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, index: &str, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, urlencoding::encode(index), path)
    }

    async fn post_json(&self, url: &str, body: &Value) -> StoreResult<Value> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(unavailable)?;
        if !response.status().is_success() {
            return Err(StoreError::Unavailable {
                msg: format!("HTTP {} from {}", response.status(), url),
            });
        }
        response.json().await.map_err(unavailable)
    }
}

fn unavailable(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable { msg: e.to_string() }
}

/// Translate a filter into a `bool.filter` query. String terms match the
/// `.keyword` sub-field so that analysed text fields compare exactly.
pub fn filter_to_query(filter: &Filter) -> Value {
    let clauses: Vec<Value> = filter
        .predicates()
        .iter()
        .map(|predicate| match predicate {
            Predicate::Term { field, value } => {
                let field = match value {
                    Value::String(_) => format!("{field}.keyword"),
                    _ => field.clone(),
                };
                json!({"term": {field: value}})
            }
            Predicate::Range { field, gte, lte } => {
                let mut bounds = Map::new();
                if let Some(gte) = gte {
                    bounds.insert("gte".to_string(), gte.clone());
                }
                if let Some(lte) = lte {
                    bounds.insert("lte".to_string(), lte.clone());
                }
                json!({"range": {field.clone(): bounds}})
            }
        })
        .collect();
    json!({"bool": {"filter": clauses}})
}

fn hit_sources(body: Value) -> StoreResult<Vec<Document>> {
    let hits = body
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| StoreError::Unavailable {
            msg: "search response has no hits".to_string(),
        })?;
    Ok(hits
        .iter()
        .filter_map(|hit| hit.get("_source").and_then(Value::as_object).cloned())
        .collect())
}

#[async_trait]
impl RecordStore for ElasticStore {
    async fn get(&self, index: &str, id: &str) -> StoreResult<Document> {
        let url = self.url(index, &format!("_doc/{}", urlencoding::encode(id)));
        let response = self.client.get(&url).send().await.map_err(unavailable)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound {
                index: index.to_string(),
                id: id.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(StoreError::Unavailable {
                msg: format!("HTTP {} from {}", response.status(), url),
            });
        }
        let body: Value = response.json().await.map_err(unavailable)?;
        match body.get("_source") {
            Some(Value::Object(source)) => Ok(source.clone()),
            _ => Err(StoreError::NotFound {
                index: index.to_string(),
                id: id.to_string(),
            }),
        }
    }

    async fn upsert(&self, index: &str, id: &str, doc: Document) -> StoreResult<()> {
        let url = self.url(index, &format!("_update/{}", urlencoding::encode(id)));
        let body = json!({"doc": doc, "doc_as_upsert": true});
        self.post_json(&url, &body).await.map(|_| ())
    }

    async fn search(
        &self,
        index: &str,
        filter: &Filter,
        max_rows: usize,
    ) -> StoreResult<Vec<Document>> {
        let body = json!({"size": max_rows, "query": filter_to_query(filter)});
        let response = self.post_json(&self.url(index, "_search"), &body).await?;
        hit_sources(response)
    }

    async fn count(&self, index: &str, filter: &Filter, max_rows: usize) -> StoreResult<usize> {
        let body = json!({"query": filter_to_query(filter)});
        let response = self.post_json(&self.url(index, "_count"), &body).await?;
        let count = response
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| StoreError::Unavailable {
                msg: "count response has no count".to_string(),
            })?;
        Ok((count as usize).min(max_rows))
    }
}
