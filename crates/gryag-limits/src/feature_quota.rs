//! Per-feature windowed quotas, durable in the `quota_ledger` table.
//!
//! Hourly and daily counts per (user, feature). The effective quota scales
//! with a per-user reputation multiplier clamped to [0.5, 2.0]; consumption
//! is explicit so features like image generation can charge only on success.

use rusqlite::{params, OptionalExtension};

use gryag_core::Result;
use gryag_store::Storage;

const MIN_MULTIPLIER: f64 = 0.5;
const MAX_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub hourly_remaining: u32,
    pub daily_remaining: u32,
    pub retry_after_secs: u64,
}

#[derive(Clone)]
pub struct FeatureQuota {
    storage: Storage,
    feature: String,
    hourly_limit: u32,
    daily_limit: u32,
}

impl FeatureQuota {
    pub fn new(storage: Storage, feature: &str, hourly_limit: u32, daily_limit: u32) -> Self {
        Self {
            storage,
            feature: feature.to_string(),
            hourly_limit,
            daily_limit,
        }
    }

    /// Would a use be allowed right now? Does not consume.
    pub fn check(&self, user_id: i64, now_ts: i64) -> Result<QuotaDecision> {
        let multiplier = self.multiplier(user_id)?;
        let hourly_limit = scale(self.hourly_limit, multiplier);
        let daily_limit = scale(self.daily_limit, multiplier);

        let hour_start = now_ts - now_ts % 3600;
        let day_start = now_ts - now_ts % 86400;
        let hourly_used = self.window_count(user_id, "hour", hour_start)?;
        let daily_used = self.window_count(user_id, "day", day_start)?;

        let allowed = hourly_used < hourly_limit && daily_used < daily_limit;
        let retry_after_secs = if allowed {
            0
        } else if hourly_used >= hourly_limit && daily_used < daily_limit {
            (hour_start + 3600 - now_ts).max(1) as u64
        } else {
            (day_start + 86400 - now_ts).max(1) as u64
        };
        Ok(QuotaDecision {
            allowed,
            hourly_remaining: hourly_limit.saturating_sub(hourly_used),
            daily_remaining: daily_limit.saturating_sub(daily_used),
            retry_after_secs,
        })
    }

    /// Charge one use against both windows. Call only after the feature
    /// actually succeeded.
    pub fn consume(&self, user_id: i64, now_ts: i64) -> Result<()> {
        let hour_start = now_ts - now_ts % 3600;
        let day_start = now_ts - now_ts % 86400;
        for (kind, start) in [("hour", hour_start), ("day", day_start)] {
            self.storage.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO quota_ledger (user_id, feature, window_kind, window_start, count, last_request)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)
                     ON CONFLICT(user_id, feature, window_kind, window_start) DO UPDATE SET
                        count = count + 1, last_request = excluded.last_request",
                    params![user_id, self.feature, kind, start, now_ts],
                )?;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Clear a user's ledger rows for this feature (admin reset).
    pub fn reset_user(&self, user_id: i64) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.execute(
                "DELETE FROM quota_ledger WHERE user_id = ?1 AND feature = ?2",
                params![user_id, self.feature],
            )?;
            Ok(())
        })
    }

    /// Adjust a user's reputation score; the effective quota multiplier is
    /// the score clamped to [0.5, 2.0].
    pub fn set_reputation(&self, user_id: i64, score: f64, now_ts: i64) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_reputation (user_id, score, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET score = excluded.score, updated_at = excluded.updated_at",
                params![user_id, score, now_ts],
            )?;
            Ok(())
        })
    }

    fn multiplier(&self, user_id: i64) -> Result<f64> {
        let score: Option<f64> = self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT score FROM user_reputation WHERE user_id = ?1",
                [user_id],
                |r| r.get(0),
            )
            .optional()
        })?;
        Ok(score.unwrap_or(1.0).clamp(MIN_MULTIPLIER, MAX_MULTIPLIER))
    }

    fn window_count(&self, user_id: i64, kind: &str, start: i64) -> Result<u32> {
        self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(count), 0) FROM quota_ledger
                 WHERE user_id = ?1 AND feature = ?2 AND window_kind = ?3 AND window_start = ?4",
                params![user_id, self.feature, kind, start],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n as u32)
        })
    }
}

fn scale(limit: u32, multiplier: f64) -> u32 {
    ((limit as f64 * multiplier).round() as u32).max(1)
}
