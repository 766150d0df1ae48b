//! Test doubles shared by the engine's unit tests.

use async_trait::async_trait;
use chrono::Utc;
use ember_core::fetch::{FetchMeta, FetchRequest, FetchedSource};
use ember_core::ports::SourceFetcher;
use ember_core::{Error, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// How the scripted fetcher answers for one address.
#[derive(Debug, Clone)]
pub enum Script {
    Verified,
    Transient,
    Permanent,
    Hang,
}

/// A fetcher that answers from a script and counts calls. Unscripted
/// addresses succeed with a complete, verified payload.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, address: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(ember_core::normalize_address(address), script);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn complete_source(address: &str) -> serde_json::Value {
    json!({
        "source_code": format!("// {address}\ncontract Token {{}}"),
        "abi": [{"type": "function", "name": "totalSupply"}],
        "compiler_version": "v0.8.19+commit.7dd6d404",
        "contract_name": "Token"
    })
}

#[async_trait]
impl SourceFetcher for ScriptedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedSource> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.address)
            .cloned()
            .unwrap_or(Script::Verified);

        match script {
            Script::Verified => Ok(FetchedSource {
                payload: complete_source(&request.address),
                meta: FetchMeta {
                    provider: "scripted".to_string(),
                    verified: true,
                    fetched_at: Utc::now(),
                    response_time_ms: Some(1),
                },
            }),
            Script::Transient => Err(Error::transient("502 Bad Gateway")),
            Script::Permanent => Err(Error::permanent("Contract source code not verified")),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(Error::transient("unreachable"))
            }
        }
    }
}
