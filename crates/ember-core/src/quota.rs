//! API quota accounting types.

use crate::error::FetchErrorKind;
use crate::ids::ReservationId;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One external API call, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub network: String,
    pub provider: String,
    pub success: bool,
    pub contract_address: Option<String>,
    pub response_time_ms: Option<u64>,
    pub error_kind: Option<FetchErrorKind>,
    /// Reservation the call was made under, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<ReservationId>,
    pub occurred_at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(network: impl Into<String>, provider: impl Into<String>, success: bool) -> Self {
        Self {
            network: network.into(),
            provider: provider.into(),
            success,
            contract_address: None,
            response_time_ms: None,
            error_kind: None,
            reservation_id: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.contract_address = Some(crate::ids::normalize_address(&address.into()));
        self
    }

    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    pub fn with_error_kind(mut self, kind: FetchErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    pub fn under(mut self, reservation: Option<ReservationId>) -> Self {
        self.reservation_id = reservation;
        self
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// Calls set aside for one warming run.
///
/// While a reservation is live, its `granted` calls minus the events recorded
/// under it count against the daily budget, so concurrent runs can never be
/// handed the same remaining calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaReservation {
    pub id: ReservationId,
    pub network: String,
    pub provider: String,
    pub granted: u64,
    pub expires_at: DateTime<Utc>,
}

/// Calls a new reservation may take: `requested`, capped by what is left of
/// `budget` after today's usage and calls still held by live reservations.
pub fn grantable(requested: u64, budget: u64, used_today: u64, held: u64) -> u64 {
    requested.min(budget.saturating_sub(used_today.saturating_add(held)))
}

/// Raw sliding-window counts read from the usage log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounts {
    pub requests_last_minute: u64,
    pub requests_last_hour: u64,
    pub errors_last_hour: u64,
    pub used_today: u64,
}

/// Health bucket derived from the share of the daily limit used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    Healthy,
    Moderate,
    Warning,
    Critical,
}

impl QuotaStatus {
    /// Healthy below 60%, moderate to 80%, warning to 95%, critical beyond.
    pub fn from_percent(percent_used: f64) -> Self {
        match percent_used {
            p if p >= 95.0 => QuotaStatus::Critical,
            p if p >= 80.0 => QuotaStatus::Warning,
            p if p >= 60.0 => QuotaStatus::Moderate,
            _ => QuotaStatus::Healthy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaStatus::Healthy => "healthy",
            QuotaStatus::Moderate => "moderate",
            QuotaStatus::Warning => "warning",
            QuotaStatus::Critical => "critical",
        }
    }
}

impl fmt::Display for QuotaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota view for one `(network, provider)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaWindow {
    pub network: String,
    pub provider: String,
    pub requests_last_minute: u64,
    pub requests_last_hour: u64,
    pub errors_last_hour: u64,
    pub daily_limit: u64,
    pub used_today: u64,
    pub remaining: u64,
    /// `used_today / daily_limit`, expressed in percent.
    pub percent_used: f64,
    pub status: QuotaStatus,
    /// `remaining / requests_last_hour`; `None` when nothing was called in
    /// the last hour.
    pub estimated_hours_remaining: Option<f64>,
}

impl QuotaWindow {
    pub fn from_counts(
        network: impl Into<String>,
        provider: impl Into<String>,
        daily_limit: u64,
        counts: UsageCounts,
    ) -> Self {
        let remaining = daily_limit.saturating_sub(counts.used_today);
        let percent_used = if daily_limit == 0 {
            100.0
        } else {
            counts.used_today as f64 / daily_limit as f64 * 100.0
        };
        let estimated_hours_remaining = if counts.requests_last_hour == 0 {
            None
        } else {
            Some(remaining as f64 / counts.requests_last_hour as f64)
        };

        Self {
            network: network.into(),
            provider: provider.into(),
            requests_last_minute: counts.requests_last_minute,
            requests_last_hour: counts.requests_last_hour,
            errors_last_hour: counts.errors_last_hour,
            daily_limit,
            used_today: counts.used_today,
            remaining,
            percent_used,
            status: QuotaStatus::from_percent(percent_used),
            estimated_hours_remaining,
        }
    }
}

/// Midnight UTC of the day containing `now`; quota days roll over here.
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Lower bounds of the sliding windows as of `now`.
pub fn window_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>, DateTime<Utc>) {
    (
        now - Duration::minutes(1),
        now - Duration::hours(1),
        start_of_day(now),
    )
}
