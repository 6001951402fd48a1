//! User profiles as seen by the pipeline (read-mostly).

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::UserId;

/// Subscription class; decides whether results are moved to the cold tier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Premium,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Premium => "premium",
        }
    }

    /// Free-tier results are archived after the eligibility delay.
    pub fn archives_results(&self) -> bool {
        matches!(self, SubscriptionTier::Free)
    }
}

impl core::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionTier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" | "free_user" => Ok(SubscriptionTier::Free),
            "premium" | "premium_user" => Ok(SubscriptionTier::Premium),
            other => Err(DomainError::validation(format!("unknown subscription tier: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub tier: SubscriptionTier,
    pub email: String,
}

impl UserProfile {
    pub fn new(user_id: UserId, tier: SubscriptionTier, email: impl Into<String>) -> Self {
        Self {
            user_id,
            tier,
            email: email.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_role_names_parse() {
        assert_eq!("free_user".parse::<SubscriptionTier>().unwrap(), SubscriptionTier::Free);
        assert_eq!(
            "premium_user".parse::<SubscriptionTier>().unwrap(),
            SubscriptionTier::Premium
        );
        assert!("gold".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn only_free_tier_archives() {
        assert!(SubscriptionTier::Free.archives_results());
        assert!(!SubscriptionTier::Premium.archives_results());
    }
}
