//! Referral types.

use serde::{Deserialize, Serialize};

use crate::UserId;

/// Default number of extra hourly free generations granted per referral.
pub const DEFAULT_REFERRAL_BONUS_GENERATIONS: u32 = 5;

/// Summary of a user's referral standing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralInfo {
    /// The user.
    pub user_id: UserId,
    /// Who referred this user, if anyone.
    pub referred_by: Option<UserId>,
    /// Number of users this user referred.
    pub referrals_count: u32,
    /// Accumulated bonus generations.
    pub bonus_generations: u32,
    /// Effective hourly free limit (base plus bonus).
    pub hourly_limit: u32,
}
