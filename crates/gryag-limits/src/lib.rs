//! Rate limiting and serialization primitives: the per-user/hour limiter,
//! feature quotas with adaptive multipliers, the bot-command cooldown with
//! warning debounce, and the per-chat serialization lock map.

pub mod cooldown;
pub mod feature_quota;
pub mod locks;
pub mod user_limiter;

pub use cooldown::{CommandCooldown, CooldownVerdict};
pub use feature_quota::{FeatureQuota, QuotaDecision};
pub use locks::ChatLocks;
pub use user_limiter::{RateDecision, UserRateLimiter};
