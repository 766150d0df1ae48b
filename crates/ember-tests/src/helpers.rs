//! Test helper functions and utilities.

use crate::fixtures::complete_source;
use async_trait::async_trait;
use chrono::Utc;
use ember_core::fetch::{FetchMeta, FetchRequest, FetchedSource};
use ember_core::ports::SourceFetcher;
use ember_core::{Error, Result, normalize_address};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// A fetcher that fails for chosen addresses and records every call.
#[derive(Default)]
pub struct StubFetcher {
    transient: HashSet<String>,
    permanent: HashSet<String>,
    calls: Mutex<HashMap<String, usize>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_transiently(mut self, address: &str) -> Self {
        self.transient.insert(normalize_address(address));
        self
    }

    pub fn failing_permanently(mut self, address: &str) -> Self {
        self.permanent.insert(normalize_address(address));
        self
    }

    /// Total calls across all addresses.
    pub fn calls(&self) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.values().sum())
            .unwrap_or_default()
    }

    /// Calls made for one address.
    pub fn calls_for(&self, address: &str) -> usize {
        self.calls
            .lock()
            .ok()
            .and_then(|calls| calls.get(&normalize_address(address)).copied())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SourceFetcher for StubFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedSource> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(request.address.clone()).or_default() += 1;
        }

        if self.permanent.contains(&request.address) {
            return Err(Error::permanent("Contract source code not verified"));
        }
        if self.transient.contains(&request.address) {
            return Err(Error::transient("503 Service Unavailable"));
        }

        Ok(FetchedSource {
            payload: complete_source(&request.address),
            meta: FetchMeta {
                provider: "stub".to_string(),
                verified: true,
                fetched_at: Utc::now(),
                response_time_ms: Some(5),
            },
        })
    }
}
