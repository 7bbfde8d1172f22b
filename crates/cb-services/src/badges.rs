//! # Badge award evaluator
//!
//! Runs once per registration. Early registrants get a pioneer badge: one
//! platform-wide, one per community. Award failures are logged and
//! swallowed; a badge problem never blocks an account from being created.

use std::sync::Arc;

use cb_core::{
    decode_row, decode_rows, encode_row, AppError, Badge, Clock, DataGateway, Filter, NewBadge, Profile, Result,
    Select, Table, UserBadge,
};
use chrono::Duration;
use tracing::{info, warn};

/// A badge the evaluator knows how to create.
#[derive(Debug, Clone, PartialEq)]
pub struct BadgeSpec {
    pub name: String,
    pub description: String,
    pub is_permanent: bool,
    pub level: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BadgePolicy {
    /// Inclusive: the registrant whose profile brings the total to this
    /// number still qualifies.
    pub global_limit: u64,
    pub community_limit: u64,
    pub global: BadgeSpec,
    pub community: BadgeSpec,
    /// Lifetime of a non-permanent award.
    pub temporary_days: i64,
}

impl Default for BadgePolicy {
    fn default() -> Self {
        Self {
            global_limit: 100,
            community_limit: 20,
            global: BadgeSpec {
                name: "Platform Pioneer".into(),
                description: "One of the first 100 members of the platform".into(),
                is_permanent: true,
                level: 1,
            },
            community: BadgeSpec {
                name: "Campus Pioneer".into(),
                description: "One of the first 20 members of their school".into(),
                is_permanent: true,
                level: 1,
            },
            temporary_days: 30,
        }
    }
}

/// Deterministic placeholder icon keyed on the badge name's first character.
pub fn icon_for(name: &str) -> String {
    let seed = name.chars().next().map(u32::from).unwrap_or(0);
    format!("https://picsum.photos/id/{seed}/40/40")
}

pub struct BadgeEvaluator {
    gateway: Arc<dyn DataGateway>,
    clock: Arc<dyn Clock>,
    policy: BadgePolicy,
}

impl BadgeEvaluator {
    pub fn new(gateway: Arc<dyn DataGateway>, clock: Arc<dyn Clock>, policy: BadgePolicy) -> Self {
        Self { gateway, clock, policy }
    }

    pub fn policy(&self) -> &BadgePolicy {
        &self.policy
    }

    /// Awards whatever `new_user` qualifies for. Expects the user's profile
    /// row to exist already, so the counts include them.
    pub async fn evaluate_on_registration(&self, new_user: &Profile) -> Vec<Badge> {
        let mut awarded = Vec::new();

        match self.gateway.count(Table::Profiles, &Filter::All).await {
            Ok(total) if total <= self.policy.global_limit => {
                if let Some(badge) = self.grant(new_user, &self.policy.global).await {
                    awarded.push(badge);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(user_id = %new_user.id, error = %e, "could not count registrants"),
        }

        let in_community = Filter::eq("community", new_user.community.as_str());
        match self.gateway.count(Table::Profiles, &in_community).await {
            Ok(total) if total <= self.policy.community_limit => {
                if let Some(badge) = self.grant(new_user, &self.policy.community).await {
                    awarded.push(badge);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(
                user_id = %new_user.id,
                community = %new_user.community,
                error = %e,
                "could not count community registrants"
            ),
        }

        awarded
    }

    async fn grant(&self, user: &Profile, spec: &BadgeSpec) -> Option<Badge> {
        let result = async {
            let badge = self.ensure_badge(spec).await?;
            self.link(user, &badge).await?;
            Ok::<_, AppError>(badge)
        }
        .await;

        match result {
            Ok(badge) => {
                info!(user_id = %user.id, badge = %badge.name, "badge awarded");
                Some(badge)
            }
            Err(e) => {
                warn!(user_id = %user.id, badge = %spec.name, error = %e, "badge award failed");
                None
            }
        }
    }

    /// Finds the badge by name or creates it. If the create loses a race
    /// against another registration, the winner's row is fetched once.
    pub async fn ensure_badge(&self, spec: &BadgeSpec) -> Result<Badge> {
        if let Some(badge) = self.find_badge(&spec.name).await? {
            return Ok(badge);
        }

        let row = encode_row(&NewBadge {
            name: spec.name.clone(),
            description: spec.description.clone(),
            is_permanent: spec.is_permanent,
            level: spec.level,
            icon_url: icon_for(&spec.name),
        })?;

        match self.gateway.insert(Table::Badges, vec![row]).await {
            Ok(rows) => match rows.into_iter().next() {
                Some(row) => decode_row(row),
                None => self.refetch(spec).await,
            },
            Err(e) => {
                warn!(badge = %spec.name, error = %e, "badge create failed, re-fetching");
                self.refetch(spec).await
            }
        }
    }

    async fn refetch(&self, spec: &BadgeSpec) -> Result<Badge> {
        self.find_badge(&spec.name)
            .await?
            .ok_or_else(|| AppError::NotFound("Badge".into(), spec.name.clone()))
    }

    async fn find_badge(&self, name: &str) -> Result<Option<Badge>> {
        let page = self
            .gateway
            .select(Table::Badges, &Select::new(Filter::eq("name", name)).range(0, 1))
            .await
            .map_err(|e| AppError::remote("find badge", e))?;
        Ok(decode_rows::<Badge>(page.rows)?.into_iter().next())
    }

    async fn link(&self, user: &Profile, badge: &Badge) -> Result<()> {
        let now = self.clock.now();
        let expires_at = (!badge.is_permanent).then(|| now + Duration::days(self.policy.temporary_days));
        let row = encode_row(&UserBadge {
            user_id: user.id,
            badge_id: badge.id,
            obtained_at: now,
            expires_at,
            badge: None,
        })?;
        self.gateway
            .insert(Table::UserBadges, vec![row])
            .await
            .map_err(|e| AppError::remote("link badge", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cb_core::{MockDataGateway, RowPage};
    use cb_gateway_memory::{ManualClock, MemoryGateway};
    use serde_json::json;
    use uuid::Uuid;

    async fn register(gateway: &MemoryGateway, community: &str) -> Profile {
        let profile = Profile {
            id: Uuid::now_v7(),
            username: "member".into(),
            community: community.into(),
            grade: None,
            avatar_url: None,
            badges: vec![],
        };
        gateway.seed(Table::Profiles, json!(profile)).await;
        profile
    }

    fn evaluator(gateway: Arc<MemoryGateway>) -> BadgeEvaluator {
        BadgeEvaluator::new(gateway, Arc::new(ManualClock::starting_now()), BadgePolicy::default())
    }

    fn names(badges: &[Badge]) -> Vec<&str> {
        badges.iter().map(|b| b.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_hundredth_registrant_is_a_pioneer_but_not_the_next() {
        let gateway = Arc::new(MemoryGateway::new());
        // Spread across communities so only the global rule is in play.
        for i in 0..99 {
            register(&gateway, &format!("school-{i}")).await;
        }
        let evaluator = evaluator(gateway.clone());

        let hundredth = register(&gateway, "late-a").await;
        let awarded = evaluator.evaluate_on_registration(&hundredth).await;
        assert!(names(&awarded).contains(&"Platform Pioneer"));

        let next = register(&gateway, "late-b").await;
        let awarded = evaluator.evaluate_on_registration(&next).await;
        assert!(!names(&awarded).contains(&"Platform Pioneer"));
        assert!(names(&awarded).contains(&"Campus Pioneer"));

        // Both awards reuse the same badge rows.
        assert_eq!(gateway.rows(Table::Badges).await.len(), 2);
    }

    #[tokio::test]
    async fn test_community_cutoff_is_per_community() {
        let gateway = Arc::new(MemoryGateway::new());
        for _ in 0..19 {
            register(&gateway, "north").await;
        }
        let evaluator = evaluator(gateway.clone());

        let twentieth = register(&gateway, "north").await;
        assert!(names(&evaluator.evaluate_on_registration(&twentieth).await).contains(&"Campus Pioneer"));

        let twenty_first = register(&gateway, "north").await;
        assert!(!names(&evaluator.evaluate_on_registration(&twenty_first).await).contains(&"Campus Pioneer"));

        for _ in 0..19 {
            register(&gateway, "south").await;
        }
        let south_twentieth = register(&gateway, "south").await;
        assert!(names(&evaluator.evaluate_on_registration(&south_twentieth).await).contains(&"Campus Pioneer"));
    }

    #[tokio::test]
    async fn test_permanent_badges_never_expire() {
        let gateway = Arc::new(MemoryGateway::new());
        let first = register(&gateway, "north").await;
        evaluator(gateway.clone()).evaluate_on_registration(&first).await;

        let links: Vec<UserBadge> = decode_rows(gateway.rows(Table::UserBadges).await).unwrap();
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|l| l.user_id == first.id && l.expires_at.is_none()));
    }

    #[tokio::test]
    async fn test_temporary_badge_expires_after_thirty_days() {
        let gateway = Arc::new(MemoryGateway::new());
        let clock = Arc::new(ManualClock::starting_now());
        let mut policy = BadgePolicy::default();
        policy.global.is_permanent = false;
        let evaluator = BadgeEvaluator::new(gateway.clone(), clock.clone(), policy);

        let first = register(&gateway, "north").await;
        evaluator.evaluate_on_registration(&first).await;

        let links: Vec<UserBadge> = decode_rows(gateway.rows(Table::UserBadges).await).unwrap();
        let expiring: Vec<_> = links.iter().filter_map(|l| l.expires_at).collect();
        assert_eq!(expiring, vec![clock.now() + Duration::days(30)]);
    }

    #[tokio::test]
    async fn test_backend_outage_is_swallowed() {
        let gateway = Arc::new(MemoryGateway::new());
        let first = register(&gateway, "north").await;
        gateway.set_unavailable(Table::Badges, true);

        let awarded = evaluator(gateway.clone()).evaluate_on_registration(&first).await;
        assert!(awarded.is_empty());
        assert!(gateway.rows(Table::UserBadges).await.is_empty());
    }

    #[test]
    fn test_icon_is_derived_from_first_character() {
        assert_eq!(icon_for("Platform Pioneer"), "https://picsum.photos/id/80/40/40");
        assert_eq!(icon_for("Platform Pioneer"), icon_for("Pathfinder"));
        assert_eq!(icon_for(""), "https://picsum.photos/id/0/40/40");
    }

    #[tokio::test]
    async fn test_lost_create_race_uses_winning_row() {
        let winner = Badge {
            id: Uuid::now_v7(),
            name: "Platform Pioneer".into(),
            description: "One of the first 100 members of the platform".into(),
            is_permanent: true,
            level: 1,
            icon_url: icon_for("Platform Pioneer"),
        };
        let winner_row = json!(winner).as_object().cloned().unwrap();

        let lookups = Arc::new(AtomicUsize::new(0));
        let mut gateway = MockDataGateway::new();
        let seen = lookups.clone();
        gateway.expect_select().returning(move |table, _| {
            assert_eq!(table, Table::Badges);
            // Absent on the first lookup; the concurrent registration's row afterwards.
            let rows = if seen.fetch_add(1, Ordering::SeqCst) == 0 { vec![] } else { vec![winner_row.clone()] };
            Ok(RowPage { total: rows.len() as u64, rows })
        });
        gateway.expect_insert().returning(|table, rows| match table {
            Table::Badges => Err(anyhow::anyhow!("duplicate key value violates unique constraint")),
            _ => Ok(rows),
        });

        let evaluator =
            BadgeEvaluator::new(Arc::new(gateway), Arc::new(ManualClock::starting_now()), BadgePolicy::default());
        let badge = evaluator.ensure_badge(&evaluator.policy().global.clone()).await.unwrap();
        assert_eq!(badge, winner);
        assert_eq!(lookups.load(Ordering::SeqCst), 2);
    }
}
