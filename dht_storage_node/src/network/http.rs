// JSON-over-HTTP implementation of the DHT transport

use super::DhtTransport;
use crate::error::{DhtError, Result};
use crate::types::wire::{BoolReply, CountReply, DumpEntry, GetPage, GetRequest, PutRequest};
use crate::types::{NodeInfo, MAX_VALUE_BYTES};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Transport that talks to the `/dht/*` routes of remote nodes
pub struct HttpTransport {
    /// HTTP client
    client: reqwest::Client,
    /// Per-request timeout
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(rpc_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(rpc_timeout).build()?;
        Ok(Self {
            client,
            timeout: rpc_timeout,
        })
    }

    fn url(node: &NodeInfo, path: &str) -> String {
        format!("{}{}", node.endpoint.trim_end_matches('/'), path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        node: &NodeInfo,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = timeout(self.timeout, request.send())
            .await
            .map_err(|_| DhtError::Timeout)??;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or_default();
        let err = remote_error(status, &body["error"]);
        debug!("Node {} answered HTTP {}: {}", node.id, status, err);
        Err(err)
    }

    async fn post_put(&self, node: &NodeInfo, path: &str, body: PutRequest) -> Result<bool> {
        let request = self.client.post(Self::url(node, path)).json(&body);
        let reply: BoolReply = self.send(node, request).await?;
        Ok(reply.result)
    }
}

// Rebuild the error a remote node reported from its status code and the
// `error` object of its JSON body.
fn remote_error(status: StatusCode, error: &serde_json::Value) -> DhtError {
    let message = error["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string());
    let field = |name: &str| error[name].as_u64().unwrap_or(0) as usize;
    match status {
        StatusCode::PAYLOAD_TOO_LARGE => DhtError::ValueTooLarge {
            size: field("size"),
            max: error["max"]
                .as_u64()
                .map_or(MAX_VALUE_BYTES, |max| max as usize),
        },
        StatusCode::CONFLICT if error.get("total").is_some() => DhtError::PutFailed {
            total: field("total"),
            positive: field("positive"),
            negative: field("negative"),
        },
        StatusCode::CONFLICT => DhtError::Conflict,
        StatusCode::SERVICE_UNAVAILABLE => DhtError::Offline,
        StatusCode::GATEWAY_TIMEOUT => DhtError::Timeout,
        StatusCode::BAD_REQUEST => match message.strip_prefix("Invalid continuation token: ") {
            Some(reason) => DhtError::InvalidToken(reason.to_string()),
            None => DhtError::InvalidRequest(
                message
                    .strip_prefix("Invalid request: ")
                    .unwrap_or(&message)
                    .to_string(),
            ),
        },
        StatusCode::NOT_FOUND => DhtError::NotFound(
            message
                .strip_prefix("Not found: ")
                .unwrap_or(&message)
                .to_string(),
        ),
        _ => DhtError::Network(format!("HTTP {}: {}", status, message)),
    }
}

#[async_trait]
impl DhtTransport for HttpTransport {
    async fn put(
        &self,
        node: &NodeInfo,
        key: Bytes,
        value: Bytes,
        ttl: u64,
        unique: bool,
    ) -> Result<bool> {
        debug!("Put to {} ({} bytes)", node.id, value.len());
        let body = PutRequest {
            key,
            value,
            ttl,
            unique,
        };
        self.post_put(node, "/dht/put", body).await
    }

    async fn put_apply(
        &self,
        node: &NodeInfo,
        key: Bytes,
        value: Bytes,
        ttl: u64,
        unique: bool,
    ) -> Result<bool> {
        debug!("PutApply to {} ({} bytes)", node.id, value.len());
        let body = PutRequest {
            key,
            value,
            ttl,
            unique,
        };
        self.post_put(node, "/dht/put_apply", body).await
    }

    async fn get(&self, node: &NodeInfo, key: Bytes, token: Option<Bytes>) -> Result<GetPage> {
        let request = self
            .client
            .post(Self::url(node, "/dht/get"))
            .json(&GetRequest { key, token });
        self.send(node, request).await
    }

    async fn dump(&self, node: &NodeInfo) -> Result<Vec<DumpEntry>> {
        let request = self.client.get(Self::url(node, "/dht/dump"));
        self.send(node, request).await
    }

    async fn count(&self, node: &NodeInfo) -> Result<usize> {
        let request = self.client.get(Self::url(node, "/dht/count"));
        let reply: CountReply = self.send(node, request).await?;
        Ok(reply.count)
    }
}
