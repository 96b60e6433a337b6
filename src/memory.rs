//! Boundary to the external vector memory collaborator.
//!
//! The store itself (embeddings, compaction) lives outside this process; we
//! speak to it over HTTP. When it is down, lookups degrade to empty results
//! unless strict mode makes memory failures fatal to the request.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{CoreError, CoreResult};

const MEMORY_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub id: String,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, thiserror::Error)]
#[error("memory store unavailable: {0}")]
pub struct MemoryUnavailable(pub String);

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn add(&self, user_id: &str, text: &str, metadata: Value) -> Result<(), MemoryUnavailable>;
    async fn search(&self, user_id: &str, query: &str, k: usize)
        -> Result<Vec<MemoryHit>, MemoryUnavailable>;
    async fn delete(&self, user_id: &str, id: &str) -> Result<(), MemoryUnavailable>;
}

/// Search with the degradation policy applied: strict mode surfaces the
/// failure, otherwise it logs and behaves as an empty result.
pub async fn search_degraded(
    store: &dyn MemoryStore,
    user_id: &str,
    query: &str,
    k: usize,
    strict_mode: bool,
) -> CoreResult<Vec<MemoryHit>> {
    match store.search(user_id, query, k).await {
        Ok(hits) => Ok(hits),
        Err(e) if strict_mode => Err(CoreError::transient(format!("memory search failed: {}", e))),
        Err(e) => {
            warn!(user_id, error = %e, "Memory unavailable, continuing without recall");
            Ok(Vec::new())
        }
    }
}

/// REST client for the memory service.
pub struct HttpMemoryStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpMemoryStore {
    pub fn new(base_url: &str, api_key: Option<&str>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(MEMORY_HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(|s| s.to_string()),
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }
}

#[async_trait]
impl MemoryStore for HttpMemoryStore {
    async fn add(&self, user_id: &str, text: &str, metadata: Value) -> Result<(), MemoryUnavailable> {
        let response = self
            .request(self.client.post(format!("{}/memories", self.base_url)))
            .json(&json!({ "user_id": user_id, "text": text, "metadata": metadata }))
            .send()
            .await
            .map_err(|e| MemoryUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MemoryUnavailable(format!("add returned {}", response.status())));
        }
        Ok(())
    }

    async fn search(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<MemoryHit>, MemoryUnavailable> {
        let response = self
            .request(self.client.post(format!("{}/search", self.base_url)))
            .json(&json!({ "user_id": user_id, "query": query, "limit": k }))
            .send()
            .await
            .map_err(|e| MemoryUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MemoryUnavailable(format!("search returned {}", response.status())));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| MemoryUnavailable(format!("malformed search response: {}", e)))?;

        let hits = payload["results"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        Some(MemoryHit {
                            id: row["id"].as_str()?.to_string(),
                            text: row
                                .get("memory")
                                .or_else(|| row.get("text"))
                                .and_then(Value::as_str)?
                                .to_string(),
                            score: row["score"].as_f64().unwrap_or(0.0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(hits)
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<(), MemoryUnavailable> {
        let response = self
            .request(
                self.client
                    .delete(format!("{}/memories/{}", self.base_url, id))
                    .query(&[("user_id", user_id)]),
            )
            .send()
            .await
            .map_err(|e| MemoryUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MemoryUnavailable(format!("delete returned {}", response.status())));
        }
        Ok(())
    }
}

/// Stand-in when no memory service is configured: remembers nothing and
/// always answers with an empty result.
pub struct NullMemoryStore;

#[async_trait]
impl MemoryStore for NullMemoryStore {
    async fn add(&self, _: &str, _: &str, _: Value) -> Result<(), MemoryUnavailable> {
        Ok(())
    }

    async fn search(&self, _: &str, _: &str, _: usize) -> Result<Vec<MemoryHit>, MemoryUnavailable> {
        Ok(Vec::new())
    }

    async fn delete(&self, _: &str, _: &str) -> Result<(), MemoryUnavailable> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DownStore;

    #[async_trait]
    impl MemoryStore for DownStore {
        async fn add(&self, _: &str, _: &str, _: Value) -> Result<(), MemoryUnavailable> {
            Err(MemoryUnavailable("connection refused".into()))
        }
        async fn search(
            &self,
            _: &str,
            _: &str,
            _: usize,
        ) -> Result<Vec<MemoryHit>, MemoryUnavailable> {
            Err(MemoryUnavailable("connection refused".into()))
        }
        async fn delete(&self, _: &str, _: &str) -> Result<(), MemoryUnavailable> {
            Err(MemoryUnavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn lenient_mode_degrades_to_empty() {
        let hits = search_degraded(&DownStore, "u1", "coffee", 5, false).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn strict_mode_surfaces_the_failure() {
        let err = search_degraded(&DownStore, "u1", "coffee", 5, true).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn null_store_is_silent() {
        let store = NullMemoryStore;
        store.add("u1", "likes tea", json!({})).await.unwrap();
        assert!(store.search("u1", "tea", 3).await.unwrap().is_empty());
    }
}
