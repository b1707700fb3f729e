//! HTTP long-polling proxy client: a thin peer that never binds its own
//! UDP sockets, instead issuing the same observable `put`/`get`/`listen`
//! operations through an HTTP gateway run by a full node. Built on the
//! same `reqwest` + `serde_json` client stack as the rest of this
//! workspace's HTTP-facing code.

use crate::dht::ListenEvent;
use crate::error::DhtError;
use crate::id::IdHash;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Long-poll requests wait at most this long for a gateway response
/// before the client retries.
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct PutBody {
    key: String,
    value_hex: String,
    permanent: bool,
    ttl_secs: Option<u64>,
}

#[derive(Deserialize)]
struct PutResponse {
    accepted: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct GetResponse {
    values_hex: Vec<String>,
}

#[derive(Deserialize)]
struct ListenResponse {
    values_hex: Vec<String>,
    cursor: String,
}

/// Client for the HTTP proxy surface a full node exposes to constrained
/// peers. Every call maps to exactly one DHT operation on
/// the gateway node, so a `ProxyClient` and a direct `SecureDht` present
/// the same operation set to an embedding application.
pub struct ProxyClient {
    base_url: String,
    http: reqwest::Client,
}

impl ProxyClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(LONG_POLL_TIMEOUT + Duration::from_secs(5)).build()?;
        Ok(ProxyClient { base_url: base_url.into(), http })
    }

    pub async fn put(&self, key: IdHash, value: &Value, ttl: Option<Duration>) -> Result<(), DhtError> {
        let body = PutBody {
            key: key.to_hex(),
            value_hex: hex::encode(bincode::serialize(value).map_err(|e| DhtError::ValueRejected { reason: e.to_string() })?),
            permanent: ttl.is_none(),
            ttl_secs: ttl.map(|d| d.as_secs()),
        };

        let resp = self
            .http
            .post(format!("{}/v1/put", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| DhtError::ValueRejected { reason: format!("proxy request failed: {e}") })?;

        let parsed: PutResponse = resp
            .json()
            .await
            .map_err(|e| DhtError::ValueRejected { reason: format!("malformed proxy response: {e}") })?;

        if parsed.accepted {
            Ok(())
        } else {
            Err(DhtError::ValueRejected { reason: parsed.reason.unwrap_or_else(|| "gateway rejected put".into()) })
        }
    }

    pub async fn get(&self, key: IdHash) -> Result<Vec<Value>, DhtError> {
        let resp = self
            .http
            .get(format!("{}/v1/get/{}", self.base_url, key.to_hex()))
            .send()
            .await
            .map_err(|_| DhtError::SearchFailed { target: key })?;

        let parsed: GetResponse = resp.json().await.map_err(|_| DhtError::SearchFailed { target: key })?;
        let values: Vec<Value> = parsed
            .values_hex
            .iter()
            .filter_map(|h| hex::decode(h).ok())
            .filter_map(|bytes| bincode::deserialize(&bytes).ok())
            .collect();

        if values.is_empty() {
            return Err(DhtError::SearchFailed { target: key });
        }
        Ok(values)
    }

    /// Spawn a background long-polling loop that forwards newly observed
    /// values under `key` to the returned channel, until the returned
    /// handle is dropped or the gateway is unreachable for too long.
    pub fn listen(&self, key: IdHash) -> tokio::sync::mpsc::UnboundedReceiver<ListenEvent> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let base_url = self.base_url.clone();
        let http = self.http.clone();

        tokio::spawn(async move {
            let mut cursor = String::new();
            loop {
                let url = format!("{}/v1/listen/{}?cursor={}", base_url, key.to_hex(), cursor);
                let resp = match http.get(&url).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "proxy listen request failed, retrying");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        continue;
                    }
                };
                let parsed: ListenResponse = match resp.json().await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "malformed proxy listen response, retrying");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        continue;
                    }
                };
                cursor = parsed.cursor;
                for hex_value in parsed.values_hex {
                    let decoded = hex::decode(&hex_value).ok().and_then(|b| bincode::deserialize::<Value>(&b).ok());
                    if let Some(value) = decoded {
                        // The gateway's long-poll response has no concept of
                        // expiry, only newly observed values, so proxy
                        // listeners never see `ListenEvent::Expired`.
                        if tx.send(ListenEvent::New(value)).is_err() {
                            return; // receiver dropped
                        }
                    }
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_client_construction_rejects_nothing_unexpected() {
        let client = ProxyClient::new("http://127.0.0.1:8080");
        assert!(client.is_ok());
    }
}
