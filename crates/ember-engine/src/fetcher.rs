//! Etherscan-compatible explorer client.

use async_trait::async_trait;
use chrono::Utc;
use ember_core::cache::CacheType;
use ember_core::fetch::{FetchMeta, FetchRequest, FetchedSource};
use ember_core::ports::SourceFetcher;
use ember_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use url::Url;

/// One explorer API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorerEndpoint {
    /// Full API URL, e.g. `https://api.etherscan.io/api`.
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Explorer endpoints keyed by network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorerConfig {
    pub networks: BTreeMap<String, ExplorerEndpoint>,
    /// Transport-level timeout; the warmer applies its own per-call timeout
    /// on top.
    pub request_timeout_secs: u64,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        let networks = [
            ("ethereum", "https://api.etherscan.io/api"),
            ("bsc", "https://api.bscscan.com/api"),
            ("polygon", "https://api.polygonscan.com/api"),
        ]
        .into_iter()
        .map(|(network, base_url)| {
            (
                network.to_string(),
                ExplorerEndpoint {
                    base_url: base_url.to_string(),
                    api_key: None,
                },
            )
        })
        .collect();

        Self {
            networks,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SourceRecord {
    #[serde(default)]
    source_code: String,
    #[serde(rename = "ABI", default)]
    abi: String,
    #[serde(default)]
    contract_name: String,
    #[serde(default)]
    compiler_version: String,
    #[serde(default)]
    optimization_used: String,
    #[serde(default)]
    runs: String,
    #[serde(rename = "EVMVersion", default)]
    evm_version: String,
    #[serde(default)]
    license_type: String,
    #[serde(default)]
    proxy: String,
    #[serde(default)]
    implementation: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreationRecord {
    contract_creator: String,
    tx_hash: String,
}

struct Endpoint {
    url: Url,
    api_key: Option<String>,
}

/// Fetches contract data from Etherscan-style explorers.
pub struct HttpExplorerFetcher {
    client: reqwest::Client,
    endpoints: BTreeMap<String, Endpoint>,
}

impl HttpExplorerFetcher {
    pub fn new(config: &ExplorerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;

        let mut endpoints = BTreeMap::new();
        for (network, endpoint) in &config.networks {
            let url = Url::parse(&endpoint.base_url)
                .map_err(|e| Error::Config(format!("explorer url for {network}: {e}")))?;
            endpoints.insert(
                network.clone(),
                Endpoint {
                    url,
                    api_key: endpoint.api_key.clone().filter(|k| !k.is_empty()),
                },
            );
        }

        Ok(Self { client, endpoints })
    }

    pub fn networks(&self) -> Vec<&str> {
        self.endpoints.keys().map(String::as_str).collect()
    }

    async fn call(&self, endpoint: &Endpoint, action: &str, address: &str) -> Result<Value> {
        let address_param = if action == "getcontractcreation" {
            "contractaddresses"
        } else {
            "address"
        };

        let mut url = endpoint.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("module", "contract")
                .append_pair("action", action)
                .append_pair(address_param, address);
            if let Some(key) = &endpoint.api_key {
                query.append_pair("apikey", key);
            }
        }

        tracing::debug!(host = ?endpoint.url.host_str(), action, address, "explorer request");

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout(e.to_string())
            } else {
                Error::transient(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::transient(format!("explorer returned {status}")));
        }
        if !status.is_success() {
            return Err(Error::permanent(format!("explorer returned {status}")));
        }

        let body: ExplorerResponse = response
            .json()
            .await
            .map_err(|e| Error::transient(format!("malformed explorer response: {e}")))?;

        if body.status != "1" {
            let detail = body.result.as_str().unwrap_or(&body.message).to_string();
            return Err(classify(&detail));
        }

        Ok(body.result)
    }

    async fn fetch_source(&self, endpoint: &Endpoint, address: &str) -> Result<(Value, bool)> {
        let result = self.call(endpoint, "getsourcecode", address).await?;
        let record: SourceRecord = first_record(result)?;

        if record.source_code.trim().is_empty() {
            return Err(Error::permanent("Contract source code not verified"));
        }

        let abi = serde_json::from_str::<Value>(&record.abi).unwrap_or(Value::Null);
        let payload = json!({
            "source_code": record.source_code,
            "abi": abi,
            "contract_name": record.contract_name,
            "compiler_version": record.compiler_version,
            "optimization_used": record.optimization_used == "1",
            "optimization_runs": record.runs.parse::<u64>().unwrap_or(0),
            "evm_version": record.evm_version,
            "license_type": record.license_type,
            "proxy": record.proxy == "1",
            "implementation": (!record.implementation.is_empty()).then_some(record.implementation),
        });
        Ok((payload, true))
    }

    async fn fetch_abi(&self, endpoint: &Endpoint, address: &str) -> Result<(Value, bool)> {
        let result = self.call(endpoint, "getabi", address).await?;
        let abi = match result {
            Value::String(raw) => serde_json::from_str::<Value>(&raw)
                .map_err(|e| Error::permanent(format!("unparseable abi: {e}")))?,
            other => other,
        };
        Ok((json!({ "abi": abi }), true))
    }

    async fn fetch_creation(&self, endpoint: &Endpoint, address: &str) -> Result<(Value, bool)> {
        let result = self.call(endpoint, "getcontractcreation", address).await?;
        let record: CreationRecord = first_record(result)?;
        let payload = json!({
            "creator_address": record.contract_creator.to_lowercase(),
            "creation_tx_hash": record.tx_hash,
        });
        Ok((payload, true))
    }
}

#[async_trait]
impl SourceFetcher for HttpExplorerFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedSource> {
        if !is_valid_address(&request.address) {
            return Err(Error::permanent(format!(
                "Invalid contract address format: {}",
                request.address
            )));
        }
        let endpoint = self.endpoints.get(&request.network).ok_or_else(|| {
            Error::permanent(format!("no explorer configured for network {}", request.network))
        })?;

        let started = Instant::now();
        let (payload, verified) = match request.cache_type {
            CacheType::Source => self.fetch_source(endpoint, &request.address).await?,
            CacheType::Abi => self.fetch_abi(endpoint, &request.address).await?,
            CacheType::Creation => self.fetch_creation(endpoint, &request.address).await?,
        };

        Ok(FetchedSource {
            payload,
            meta: FetchMeta {
                provider: endpoint.url.host_str().unwrap_or("explorer").to_string(),
                verified,
                fetched_at: Utc::now(),
                response_time_ms: Some(started.elapsed().as_millis() as u64),
            },
        })
    }
}

/// `0x` followed by 40 hex digits.
pub fn is_valid_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .is_some_and(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Map an explorer error message to a fetch error.
fn classify(detail: &str) -> Error {
    let lower = detail.to_lowercase();
    if lower.contains("rate limit") {
        Error::transient(detail.to_string())
    } else if lower.contains("not verified")
        || lower.contains("invalid address")
        || lower.contains("invalid api key")
    {
        Error::permanent(detail.to_string())
    } else {
        Error::transient(detail.to_string())
    }
}

fn first_record<T: serde::de::DeserializeOwned>(result: Value) -> Result<T> {
    let first = match result {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        _ => return Err(Error::permanent("explorer returned no records")),
    };
    serde_json::from_value(first).map_err(|e| Error::transient(format!("unexpected record shape: {e}")))
}
