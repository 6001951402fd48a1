//! User profiles and subscription upgrades.
//!
//! The pipeline only reads profiles, except for the upgrade operation that
//! flips a user to premium and announces it on the tier-upgrade topic.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use annoflow_core::{SubscriptionTier, UserId, UserProfile};
use annoflow_events::{BusError, NotificationBus, NotificationBusExt, TierUpgraded};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProfileError {
    #[error("profile not found: {0}")]
    NotFound(UserId),

    #[error("profile storage error: {0}")]
    Storage(String),
}

pub trait ProfileStore: Send + Sync {
    fn get_profile(&self, user_id: &UserId) -> Result<Option<UserProfile>, ProfileError>;

    /// Set the user's tier; returns the updated profile.
    fn set_tier(&self, user_id: &UserId, tier: SubscriptionTier) -> Result<UserProfile, ProfileError>;

    fn require_profile(&self, user_id: &UserId) -> Result<UserProfile, ProfileError> {
        self.get_profile(user_id)?
            .ok_or_else(|| ProfileError::NotFound(user_id.clone()))
    }
}

impl<S> ProfileStore for Arc<S>
where
    S: ProfileStore + ?Sized,
{
    fn get_profile(&self, user_id: &UserId) -> Result<Option<UserProfile>, ProfileError> {
        (**self).get_profile(user_id)
    }

    fn set_tier(&self, user_id: &UserId, tier: SubscriptionTier) -> Result<UserProfile, ProfileError> {
        (**self).set_tier(user_id, tier)
    }
}

/// In-memory profile store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<HashMap<UserId, UserProfile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert or replace a profile.
    pub fn upsert(&self, profile: UserProfile) {
        if let Ok(mut p) = self.profiles.write() {
            p.insert(profile.user_id.clone(), profile);
        }
    }
}

impl ProfileStore for InMemoryProfileStore {
    fn get_profile(&self, user_id: &UserId) -> Result<Option<UserProfile>, ProfileError> {
        let p = self
            .profiles
            .read()
            .map_err(|_| ProfileError::Storage("profile store lock poisoned".to_string()))?;
        Ok(p.get(user_id).cloned())
    }

    fn set_tier(&self, user_id: &UserId, tier: SubscriptionTier) -> Result<UserProfile, ProfileError> {
        let mut p = self
            .profiles
            .write()
            .map_err(|_| ProfileError::Storage("profile store lock poisoned".to_string()))?;
        let profile = p
            .get_mut(user_id)
            .ok_or_else(|| ProfileError::NotFound(user_id.clone()))?;
        profile.tier = tier;
        Ok(profile.clone())
    }
}

pub const PROFILE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS user_profiles (
    user_id TEXT PRIMARY KEY,
    role    TEXT NOT NULL,
    email   TEXT NOT NULL
);
"#;

/// Postgres-backed profile store (`user_profiles` table).
#[derive(Debug, Clone)]
pub struct PostgresProfileStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresProfileStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    pub fn ensure_schema(&self) -> Result<(), ProfileError> {
        self.handle.block_on(async {
            sqlx::raw_sql(PROFILE_SCHEMA)
                .execute(&self.pool)
                .await
                .map_err(|e| ProfileError::Storage(format!("ensure_schema: {e}")))?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    pub async fn load_profile(&self, user_id: &UserId) -> Result<Option<UserProfile>, ProfileError> {
        let row = sqlx::query("SELECT user_id, role, email FROM user_profiles WHERE user_id = $1")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProfileError::Storage(format!("load_profile: {e}")))?;
        row.map(|r| decode_profile(&r)).transpose()
    }

    #[instrument(skip(self), fields(user_id = %user_id, tier = tier.as_str()), err)]
    pub async fn store_tier(&self, user_id: &UserId, tier: SubscriptionTier) -> Result<UserProfile, ProfileError> {
        let row = sqlx::query(
            "UPDATE user_profiles SET role = $2 WHERE user_id = $1 RETURNING user_id, role, email",
        )
        .bind(user_id.as_str())
        .bind(tier.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ProfileError::Storage(format!("store_tier: {e}")))?;
        match row {
            Some(r) => decode_profile(&r),
            None => Err(ProfileError::NotFound(user_id.clone())),
        }
    }
}

impl ProfileStore for PostgresProfileStore {
    fn get_profile(&self, user_id: &UserId) -> Result<Option<UserProfile>, ProfileError> {
        self.handle.block_on(self.load_profile(user_id))
    }

    fn set_tier(&self, user_id: &UserId, tier: SubscriptionTier) -> Result<UserProfile, ProfileError> {
        self.handle.block_on(self.store_tier(user_id, tier))
    }
}

fn decode_profile(row: &PgRow) -> Result<UserProfile, ProfileError> {
    let get = |col: &str| -> Result<String, ProfileError> {
        row.try_get(col)
            .map_err(|e| ProfileError::Storage(format!("profile row column {col}: {e}")))
    };
    let user_id = UserId::parse(get("user_id")?).map_err(|e| ProfileError::Storage(e.to_string()))?;
    let tier: SubscriptionTier = get("role")?
        .parse()
        .map_err(|e: annoflow_core::DomainError| ProfileError::Storage(e.to_string()))?;
    Ok(UserProfile::new(user_id, tier, get("email")?))
}

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error("failed to announce upgrade: {0}")]
    Publish(#[from] BusError),
}

/// Move a user to the premium tier and announce it.
///
/// The announcement is published even when the user already was premium, so
/// retrying after a failed publish still triggers the thaw.
pub fn upgrade_to_premium<P, B>(profiles: &P, bus: &B, user_id: &UserId) -> Result<UserProfile, UpgradeError>
where
    P: ProfileStore + ?Sized,
    B: NotificationBus + ?Sized,
{
    let before = profiles.require_profile(user_id)?;
    let profile = profiles.set_tier(user_id, SubscriptionTier::Premium)?;
    let message_id = bus.publish_event(&TierUpgraded {
        user_id: user_id.clone(),
    })?;

    tracing::info!(
        user_id = %user_id,
        previous_tier = before.tier.as_str(),
        message_id = %message_id,
        "user upgraded to premium"
    );
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use annoflow_events::{FanoutBus, InMemoryQueue, MessageQueue, Notification, topics};

    use super::*;

    fn user() -> UserId {
        UserId::parse("U1").unwrap()
    }

    #[test]
    fn upgrade_sets_tier_and_publishes() {
        let profiles = InMemoryProfileStore::new();
        profiles.upsert(UserProfile::new(user(), SubscriptionTier::Free, "u1@example.com"));

        let bus = FanoutBus::new();
        let thaw = InMemoryQueue::arc("thaw", Duration::from_secs(30));
        bus.subscribe(topics::TIER_UPGRADES, thaw.clone());

        let profile = upgrade_to_premium(&profiles, &bus, &user()).unwrap();
        assert_eq!(profile.tier, SubscriptionTier::Premium);
        assert_eq!(profiles.require_profile(&user()).unwrap().tier, SubscriptionTier::Premium);

        let got = thaw.receive(1, Duration::ZERO).unwrap();
        let ev: TierUpgraded = Notification::from_body(&got[0].body).unwrap().decode().unwrap();
        assert_eq!(ev.user_id, user());
    }

    #[test]
    fn upgrade_of_unknown_user_publishes_nothing() {
        let profiles = InMemoryProfileStore::new();
        let bus = FanoutBus::new();
        let thaw = InMemoryQueue::arc("thaw", Duration::from_secs(30));
        bus.subscribe(topics::TIER_UPGRADES, thaw.clone());

        let err = upgrade_to_premium(&profiles, &bus, &user()).unwrap_err();
        assert!(matches!(err, UpgradeError::Profile(ProfileError::NotFound(_))));
        assert_eq!(thaw.depth(), (0, 0));
    }
}
