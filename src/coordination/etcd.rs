//! etcd coordinator (v3 JSON gateway)
//!
//! Maps the lock contract onto etcd primitives:
//!
//! ```text
//! acquire  →  POST /v3/lease/grant      {TTL}
//!             POST /v3/kv/txn           if create_revision(key) == 0
//!                                        then put(key, owner, lease)
//!                                        else range(key)
//! renew    →  POST /v3/lease/keepalive  {ID}
//! release  →  POST /v3/lease/revoke     {ID}   (deletes the attached key)
//! ```
//!
//! The lock token is the etcd lease id. Expiry is enforced by etcd itself, so
//! a crashed owner's key disappears when its lease TTL runs out. Keys and
//! values travel base64 encoded; 64-bit integers travel as JSON strings.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, instrument, trace, warn};

use super::backend::{Acquire, Coordinator, LockHandle, LockRecord, Renewal, lease_expiry};
use super::error::{CoordinationError, CoordinationResult};

pub struct EtcdCoordinator {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct GrantResponse {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "TTL", default)]
    ttl: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KeyValue {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    lease: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseOp {
    #[serde(default)]
    response_range: Option<RangeResponse>,
}

#[derive(Debug, Default, Deserialize)]
struct TxnResponse {
    #[serde(default)]
    succeeded: bool,
    #[serde(default)]
    responses: Vec<ResponseOp>,
}

#[derive(Debug, Default, Deserialize)]
struct KeepAliveResult {
    #[serde(rename = "TTL", default)]
    ttl: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KeepAliveResponse {
    #[serde(default)]
    result: Option<KeepAliveResult>,
}

fn encode(s: &str) -> String {
    BASE64.encode(s.as_bytes())
}

fn decode(s: &str) -> CoordinationResult<String> {
    let bytes = BASE64
        .decode(s)
        .map_err(|e| CoordinationError::Backend(format!("invalid base64 from etcd: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| CoordinationError::Backend(format!("non utf-8 value from etcd: {e}")))
}

fn ttl_secs(lease: Duration) -> u64 {
    // etcd leases have second granularity; round up so we never hand out
    // less than requested.
    let secs = lease.as_secs() + u64::from(lease.subsec_nanos() > 0);
    secs.max(1)
}

impl EtcdCoordinator {
    /// `base_url` is the gateway root, e.g. `http://coordination:2379`
    pub fn new(base_url: impl Into<String>) -> CoordinationResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CoordinationError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> CoordinationResult<T> {
        let url = format!("{}{}", self.base_url, path);
        trace!("POST {url}");

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                CoordinationError::Unavailable(format!("{path}: HTTP {status}: {text}"))
            } else {
                CoordinationError::Backend(format!("{path}: HTTP {status}: {text}"))
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| CoordinationError::Backend(format!("{path}: invalid response: {e}")))
    }

    async fn grant(&self, lease: Duration) -> CoordinationResult<String> {
        let grant: GrantResponse = self
            .post("/v3/lease/grant", json!({ "TTL": ttl_secs(lease) }))
            .await?;
        trace!("granted lease {} (ttl {:?})", grant.id, grant.ttl);
        Ok(grant.id)
    }

    async fn revoke(&self, lease_id: &str) -> CoordinationResult<()> {
        let url = format!("{}/v3/lease/revoke", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "ID": lease_id }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        if text.contains("lease not found") {
            // Already expired or revoked.
            return Ok(());
        }

        Err(if status.is_server_error() {
            CoordinationError::Unavailable(format!("revoke: HTTP {status}: {text}"))
        } else {
            CoordinationError::Backend(format!("revoke: HTTP {status}: {text}"))
        })
    }

    async fn keepalive(&self, lease_id: &str) -> CoordinationResult<bool> {
        let response: KeepAliveResponse = self
            .post("/v3/lease/keepalive", json!({ "ID": lease_id }))
            .await?;

        let ttl = response
            .result
            .and_then(|r| r.ttl)
            .and_then(|ttl| ttl.parse::<i64>().ok())
            .unwrap_or(0);

        Ok(ttl > 0)
    }
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    #[instrument(skip(self))]
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> CoordinationResult<Acquire> {
        let lease_id = self.grant(lease).await?;
        let encoded_key = encode(key);

        let txn: TxnResponse = self
            .post(
                "/v3/kv/txn",
                json!({
                    "compare": [{
                        "key": encoded_key,
                        "result": "EQUAL",
                        "target": "CREATE",
                        "create_revision": "0"
                    }],
                    "success": [{
                        "request_put": { "key": encoded_key, "value": encode(owner), "lease": lease_id }
                    }],
                    "failure": [{
                        "request_range": { "key": encoded_key }
                    }]
                }),
            )
            .await?;

        if txn.succeeded {
            debug!("acquired {key} with lease {lease_id}");
            return Ok(Acquire::Acquired(LockHandle {
                key: key.to_string(),
                owner: owner.to_string(),
                token: lease_id,
                expires_at: lease_expiry(lease),
            }));
        }

        // Unused lease; let it go right away instead of waiting for its TTL.
        if let Err(e) = self.revoke(&lease_id).await {
            warn!("failed to revoke unused lease {lease_id}: {e}");
        }

        let existing = txn
            .responses
            .into_iter()
            .filter_map(|op| op.response_range)
            .flat_map(|range| range.kvs)
            .next()
            .unwrap_or_default();

        let holder = existing.value.as_deref().map(decode).transpose()?;

        if holder.as_deref() == Some(owner)
            && let Some(existing_lease) = existing.lease
            && self.keepalive(&existing_lease).await?
        {
            debug!("re-entered {key} with lease {existing_lease}");
            return Ok(Acquire::Acquired(LockHandle {
                key: key.to_string(),
                owner: owner.to_string(),
                token: existing_lease,
                expires_at: lease_expiry(lease),
            }));
        }

        trace!("{key} busy, held by {holder:?}");
        Ok(Acquire::Busy { holder })
    }

    /// Keeps the etcd lease alive; etcd resets it to the TTL it was granted
    /// with, so `lease` only affects the reported expiry.
    #[instrument(skip(self, handle), fields(key = %handle.key))]
    async fn renew(&self, handle: &LockHandle, lease: Duration) -> CoordinationResult<Renewal> {
        if self.keepalive(&handle.token).await? {
            Ok(Renewal::Renewed {
                expires_at: lease_expiry(lease),
            })
        } else {
            Ok(Renewal::Lost)
        }
    }

    #[instrument(skip(self, handle), fields(key = %handle.key))]
    async fn release(&self, handle: &LockHandle) -> CoordinationResult<()> {
        self.revoke(&handle.token).await
    }

    async fn holder(&self, key: &str) -> CoordinationResult<Option<LockRecord>> {
        let range: RangeResponse = self
            .post("/v3/kv/range", json!({ "key": encode(key) }))
            .await?;

        let Some(kv) = range.kvs.into_iter().next() else {
            return Ok(None);
        };

        let owner = kv.value.as_deref().map(decode).transpose()?.unwrap_or_default();

        // The gateway does not report remaining TTL on range; ask the lease.
        let expires_at = match kv.lease {
            Some(lease_id) => {
                let ttl: KeepAliveResult = self
                    .post("/v3/lease/timetolive", json!({ "ID": lease_id }))
                    .await
                    .unwrap_or_default();
                let secs = ttl.ttl.and_then(|t| t.parse::<u64>().ok()).unwrap_or(0);
                lease_expiry(Duration::from_secs(secs))
            }
            None => lease_expiry(Duration::ZERO),
        };

        Ok(Some(LockRecord {
            key: key.to_string(),
            owner,
            expires_at,
        }))
    }

    fn name(&self) -> &'static str {
        "etcd"
    }
}
