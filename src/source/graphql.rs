// ABOUTME: HTTP GraphQL client for the subgraph endpoint
// ABOUTME: Bearer-token auth, bounded timeout, and surfacing of status and GraphQL errors

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::{EventSource, FetchRequest};
use crate::error::IngestError;

pub struct GraphqlSource {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl GraphqlSource {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(endpoint)
            .with_context(|| format!("Invalid subgraph endpoint '{}'", endpoint))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!(
                "Subgraph endpoint must use http or https, got '{}'",
                parsed.scheme()
            );
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
        })
    }

    async fn post(&self, document: &str) -> Result<Value> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "query": document, "variables": {} }));

        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("Failed to reach the subgraph endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            if status == StatusCode::UNAUTHORIZED {
                anyhow::bail!(
                    "Authentication failed. The subgraph API key may be invalid or expired.\n\
                    Set it with --api-key, SUBGRAPH_API_KEY or [source].api_key"
                );
            }

            anyhow::bail!("Subgraph query failed with status {}: {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse subgraph response as JSON")
    }
}

#[async_trait]
impl EventSource for GraphqlSource {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Map<String, Value>>, IngestError> {
        let body = self
            .post(&request.document)
            .await
            .map_err(|e| IngestError::source(&request.list_field, format!("{:#}", e)))?;
        parse_page(&request.list_field, body)
            .map_err(|reason| IngestError::source(&request.list_field, reason))
    }
}

/// Extract `data.<list_field>` from a GraphQL response body.
fn parse_page(list_field: &str, mut body: Value) -> Result<Vec<Map<String, Value>>, String> {
    if let Some(errors) = body.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let messages: Vec<String> = errors
                .iter()
                .map(|e| {
                    e.get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| e.to_string())
                })
                .collect();
            return Err(format!("GraphQL errors: {}", messages.join("; ")));
        }
    }

    let items = match body.get_mut("data").and_then(|d| d.get_mut(list_field)) {
        Some(Value::Array(items)) => std::mem::take(items),
        Some(Value::Null) | None => {
            return Err(format!("response has no data.{} list", list_field));
        }
        Some(other) => {
            return Err(format!("data.{} is not a list: {}", list_field, other));
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map),
            other => Err(format!("element {} of data.{} is not an object: {}", i, list_field, other)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let source = GraphqlSource::new("https://gateway.example.com/api/subgraphs/id/x", None, Duration::from_secs(30));
        assert!(source.is_ok());

        let source = GraphqlSource::new("ftp://example.com", Some("key".to_string()), Duration::from_secs(30));
        assert!(source.is_err());
        assert!(GraphqlSource::new("not a url", None, Duration::from_secs(30)).is_err());
    }

    #[test]
    fn test_parse_page() {
        let body = json!({"data": {"deposits": [{"id": "a"}, {"id": "b"}]}});
        let page = parse_page("deposits", body).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[1]["id"], json!("b"));

        let empty = parse_page("deposits", json!({"data": {"deposits": []}})).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_graphql_errors_are_surfaced() {
        let body = json!({
            "data": null,
            "errors": [{"message": "Type `Query` has no field `nope`"}, {"locations": []}]
        });
        let err = parse_page("nope", body).unwrap_err();
        assert!(err.contains("has no field `nope`"));
        assert!(err.contains("locations"));
    }

    #[test]
    fn test_malformed_shapes() {
        assert!(parse_page("deposits", json!({"data": {}})).unwrap_err().contains("no data.deposits"));
        assert!(parse_page("deposits", json!({"data": {"deposits": 3}})).is_err());
        assert!(parse_page("deposits", json!({"data": {"deposits": [1]}}))
            .unwrap_err()
            .contains("element 0"));
    }
}
