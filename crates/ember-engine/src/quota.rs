//! Per-network API quota tracking.

use chrono::{DateTime, Utc};
use ember_core::Result;
use ember_core::config::{QuotaPolicy, bounded_days, bounded_secs};
use ember_core::ids::ReservationId;
use ember_core::ports::UsageLog;
use ember_core::quota::{QuotaWindow, UsageEvent, start_of_day};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Calls granted to one warming run. Hand it back with
/// [`QuotaTracker::release`] once the run is over.
#[derive(Debug, Clone, Default)]
pub struct Allowance {
    pub granted: u64,
    reservation: Option<ReservationId>,
}

impl Allowance {
    /// Reservation that usage events of this run are recorded under.
    pub fn reservation(&self) -> Option<ReservationId> {
        self.reservation
    }
}

/// Tracks external API usage and hands out call allowances.
///
/// Usage windows are computed on read from the append-only usage log, so
/// there is no reset job and `used_today` can only grow within a day.
pub struct QuotaTracker {
    usage: Arc<dyn UsageLog>,
    policy: QuotaPolicy,
}

impl QuotaTracker {
    pub fn new(usage: Arc<dyn UsageLog>, policy: QuotaPolicy) -> Self {
        Self { usage, policy }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// The provider that serves `network`.
    pub fn provider_for(&self, network: &str) -> String {
        self.policy.provider_for(network)
    }

    /// Append one usage event. Called exactly once per attempted external
    /// call, whatever its outcome.
    pub async fn record_call(&self, event: &UsageEvent) -> Result<()> {
        self.usage.append(event).await?;
        tracing::trace!(
            network = %event.network,
            provider = %event.provider,
            success = event.success,
            "recorded api call"
        );
        Ok(())
    }

    /// Current quota window for `(network, provider)`.
    pub async fn status(&self, network: &str, provider: &str) -> Result<QuotaWindow> {
        self.status_at(network, provider, Utc::now()).await
    }

    pub async fn status_at(
        &self,
        network: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<QuotaWindow> {
        let counts = self.usage.counts(network, provider, now).await?;
        let daily_limit = self.policy.limit_for(network).daily_limit;
        Ok(QuotaWindow::from_counts(network, provider, daily_limit, counts))
    }

    /// Reserve up to `requested` calls for a run lasting at most `hold`.
    ///
    /// Concurrent runs, in this process or another, draw from the same
    /// budget: the sum of their grants never exceeds what is left of the
    /// warming limit. A grant that is never released lapses after `hold`.
    /// Returns an empty allowance when usage cannot be read.
    pub async fn reserve(
        &self,
        network: &str,
        provider: &str,
        requested: u64,
        hold: std::time::Duration,
    ) -> Allowance {
        let daily_limit = self.policy.limit_for(network).daily_limit;
        let budget = self.policy.warming_limit(daily_limit);
        let expires_at = Utc::now() + bounded_secs(hold.as_secs().saturating_add(1));

        match self
            .usage
            .reserve(network, provider, requested, budget, expires_at)
            .await
        {
            Ok(reservation) => {
                if reservation.granted < requested {
                    tracing::info!(
                        network,
                        provider,
                        requested,
                        granted = reservation.granted,
                        daily_limit,
                        "warming allowance capped by quota"
                    );
                }
                Allowance {
                    granted: reservation.granted,
                    reservation: (reservation.granted > 0).then_some(reservation.id),
                }
            }
            Err(e) => {
                tracing::warn!(
                    network,
                    provider,
                    error = %e,
                    "quota reservation failed, refusing api calls"
                );
                Allowance::default()
            }
        }
    }

    /// Return the unused part of `allowance` to the budget.
    pub async fn release(&self, allowance: &Allowance) {
        if let Some(id) = allowance.reservation {
            if let Err(e) = self.usage.release(id).await {
                tracing::warn!(reservation = %id, error = %e, "quota release failed, reservation lapses at expiry");
            }
        }
    }

    /// How many of `requested` calls may be made now, not counting calls
    /// held by running reservations. Never exceeds the remaining daily
    /// budget; returns 0 when usage cannot be read.
    pub async fn allowance(&self, network: &str, provider: &str, requested: u64) -> u64 {
        match self.usage.counts(network, provider, Utc::now()).await {
            Ok(counts) => {
                let daily_limit = self.policy.limit_for(network).daily_limit;
                let budget = self.policy.warming_limit(daily_limit);
                let remaining = budget.saturating_sub(counts.used_today);
                let allowed = requested.min(remaining);
                if allowed < requested {
                    tracing::info!(
                        network,
                        provider,
                        requested,
                        allowed,
                        used_today = counts.used_today,
                        daily_limit,
                        "warming allowance capped by quota"
                    );
                }
                allowed
            }
            Err(e) => {
                tracing::warn!(
                    network,
                    provider,
                    error = %e,
                    "usage history unavailable, refusing api calls"
                );
                0
            }
        }
    }

    /// Quota windows for `network`, or for every configured network plus any
    /// network that saw traffic today.
    pub async fn windows(&self, network: Option<&str>) -> Result<Vec<QuotaWindow>> {
        let now = Utc::now();
        let mut pairs: BTreeSet<(String, String)> = BTreeSet::new();

        match network {
            Some(network) => {
                pairs.insert((network.to_string(), self.provider_for(network)));
            }
            None => {
                for (network, limit) in &self.policy.networks {
                    pairs.insert((network.clone(), limit.provider.clone()));
                }
                pairs.extend(self.usage.active_pairs(start_of_day(now)).await?);
            }
        }

        let mut windows = Vec::with_capacity(pairs.len());
        for (network, provider) in pairs {
            windows.push(self.status_at(&network, &provider, now).await?);
        }
        Ok(windows)
    }

    /// Drop usage events older than the retention window.
    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = Utc::now() - bounded_days(self.policy.usage_retention_days);
        let purged = self.usage.purge_before(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, "purged old api usage events");
        }
        Ok(purged)
    }
}
