//! Leaderboard aggregation over the tracking ledger.
//!
//! Windows are calendar-aligned in UTC: `week` starts Monday 00:00 of the
//! current ISO week, `month` at the first instant of the month, `year` on
//! January 1st. The actor of a row is the owner of the code that was used.

use crate::error::ReferralResult;
use crate::storage::{ProfileStore, ReferralStorage, TrackingStore};
use crate::types::{Profile, ProfileRole, ReferralTracking, TrackingStatus};
use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderboardScope {
    /// Code owners whose profile role is trainer.
    #[default]
    Trainer,
    /// Every other code owner, including owners without a profile.
    User,
}

impl LeaderboardScope {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "trainer" => Some(Self::Trainer),
            "user" => Some(Self::User),
            _ => None,
        }
    }

    fn admits(self, profile: Option<&Profile>) -> bool {
        let is_trainer = profile
            .map(|p| p.role == ProfileRole::Trainer)
            .unwrap_or(false);
        match self {
            Self::Trainer => is_trainer,
            Self::User => !is_trainer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderboardPeriod {
    #[default]
    All,
    Week,
    Month,
    Year,
}

impl LeaderboardPeriod {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(Self::All),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            "year" => Some(Self::Year),
            _ => None,
        }
    }

    /// First instant included in the window, or `None` when unbounded.
    pub fn window_start(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = now.date_naive();
        let first_day = match self {
            Self::All => return None,
            Self::Week => {
                Some(today - Duration::days(i64::from(today.weekday().num_days_from_monday())))
            }
            Self::Month => today.with_day(1),
            Self::Year => today.with_ordinal(1),
        }?;
        first_day.and_hms_opt(0, 0, 0).map(|start| start.and_utc())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardStat {
    pub rank: u32,
    pub actor_id: Uuid,
    pub actor_name: String,
    pub total_referrals: u64,
    pub confirmed_referrals: u64,
    pub pending_referrals: u64,
    pub cancelled_referrals: u64,
    pub total_commission_earned: i64,
    pub confirmed_commission: i64,
    pub total_discount_given: i64,
    /// Percentage of confirmed over total, two decimals; zero when total is zero.
    pub conversion_rate: f64,
    pub last_referral_date: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Tally {
    total: u64,
    confirmed: u64,
    pending: u64,
    cancelled: u64,
    commission: i64,
    confirmed_commission: i64,
    discount: i64,
    last: Option<DateTime<Utc>>,
}

impl Tally {
    fn add(&mut self, row: &ReferralTracking) {
        self.total += 1;
        self.commission += row.commission_earned;
        self.discount += row.discount_applied;
        match row.status {
            TrackingStatus::Confirmed => {
                self.confirmed += 1;
                self.confirmed_commission += row.commission_earned;
            }
            TrackingStatus::Pending => self.pending += 1,
            TrackingStatus::Cancelled => self.cancelled += 1,
        }
        if self.last.map(|last| row.created_at > last).unwrap_or(true) {
            self.last = Some(row.created_at);
        }
    }
}

pub fn conversion_rate(confirmed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    confirmed as f64 / total as f64 * 100.0
}

/// Group rows by code owner, filter to `scope`, order and rank.
pub fn aggregate(
    rows: &[ReferralTracking],
    profiles: &HashMap<Uuid, Profile>,
    scope: LeaderboardScope,
    limit: Option<usize>,
) -> Vec<LeaderboardStat> {
    let mut tallies: BTreeMap<Uuid, Tally> = BTreeMap::new();
    for row in rows {
        tallies.entry(row.trainer_id).or_default().add(row);
    }

    let mut stats = tallies
        .into_iter()
        .filter(|(actor, _)| scope.admits(profiles.get(actor)))
        .map(|(actor_id, tally)| LeaderboardStat {
            rank: 0,
            actor_id,
            actor_name: profiles
                .get(&actor_id)
                .map(|p| p.full_name.clone())
                .unwrap_or_else(|| actor_id.to_string()),
            total_referrals: tally.total,
            confirmed_referrals: tally.confirmed,
            pending_referrals: tally.pending,
            cancelled_referrals: tally.cancelled,
            total_commission_earned: tally.commission,
            confirmed_commission: tally.confirmed_commission,
            total_discount_given: tally.discount,
            conversion_rate: conversion_rate(tally.confirmed, tally.total),
            last_referral_date: tally.last,
        })
        .collect::<Vec<_>>();

    stats.sort_by(compare_stats);
    if let Some(limit) = limit {
        stats.truncate(limit);
    }
    for (idx, stat) in stats.iter_mut().enumerate() {
        stat.rank = idx as u32 + 1;
    }
    stats
}

fn compare_stats(a: &LeaderboardStat, b: &LeaderboardStat) -> Ordering {
    b.confirmed_referrals
        .cmp(&a.confirmed_referrals)
        .then(b.confirmed_commission.cmp(&a.confirmed_commission))
        .then_with(|| a.actor_name.cmp(&b.actor_name))
        .then(a.actor_id.cmp(&b.actor_id))
}

/// Read-only leaderboard queries.
#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<dyn ReferralStorage>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn ReferralStorage>) -> Self {
        Self { store }
    }

    pub async fn leaderboard(
        &self,
        scope: LeaderboardScope,
        period: LeaderboardPeriod,
        limit: Option<usize>,
    ) -> ReferralResult<Vec<LeaderboardStat>> {
        self.leaderboard_at(scope, period, limit, Utc::now()).await
    }

    pub async fn leaderboard_at(
        &self,
        scope: LeaderboardScope,
        period: LeaderboardPeriod,
        limit: Option<usize>,
        now: DateTime<Utc>,
    ) -> ReferralResult<Vec<LeaderboardStat>> {
        let since = period.window_start(now);
        let rows = self.store.list_tracking(since).await?;

        let mut owners = rows.iter().map(|row| row.trainer_id).collect::<Vec<_>>();
        owners.sort();
        owners.dedup();
        let profiles = self
            .store
            .profiles_by_ids(&owners)
            .await?
            .into_iter()
            .map(|profile| (profile.id, profile))
            .collect::<HashMap<_, _>>();

        let stats = aggregate(&rows, &profiles, scope, limit);
        debug!(
            rows = rows.len(),
            actors = stats.len(),
            ?scope,
            ?period,
            "leaderboard aggregated"
        );
        Ok(stats)
    }
}
