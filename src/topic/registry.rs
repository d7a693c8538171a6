use chrono::Utc;
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

use crate::config::MatchConfig;
use crate::db::Database;
use crate::error::{ConflictError, DataIntegrityError, RegistryError};
use crate::locks::KeyedLocks;
use crate::model::{Topic, TopicId};
use crate::normalize::NameNormalizer;
use crate::TARGET_TOPIC;

/// Where a candidate topic name came from, for logging.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub article_id: Option<String>,
}

impl ResolveContext {
    pub fn for_article(article_id: impl Into<String>) -> Self {
        Self {
            article_id: Some(article_id.into()),
        }
    }
}

/// Canonical store of topics and their aliases.
#[derive(Clone)]
pub struct TopicRegistry {
    db: Database,
    normalizer: NameNormalizer,
    threshold: f64,
    locks: KeyedLocks,
}

impl TopicRegistry {
    pub fn new(db: Database, matching: &MatchConfig, locks: KeyedLocks) -> Self {
        Self {
            db,
            normalizer: NameNormalizer::new(matching.max_edit_distance),
            threshold: matching.topic_threshold,
            locks,
        }
    }

    pub fn normalizer(&self) -> &NameNormalizer {
        &self.normalizer
    }

    /// Best canonical topic for a name: an exact normalized alias first, then
    /// the highest fuzzy score above the threshold. Ties go to the
    /// earlier-created topic.
    async fn best_match(
        &self,
        name: &str,
        normalized: &str,
    ) -> Result<Option<(TopicId, f64)>, RegistryError> {
        let aliases = self.db.active_aliases().await?;

        if let Some(row) = aliases.iter().find(|row| row.normalized_alias == normalized) {
            return Ok(Some((row.topic_id.clone(), 1.0)));
        }

        let mut best: Option<(TopicId, f64)> = None;
        for row in &aliases {
            let score = self.normalizer.similarity(name, &row.alias);
            if score <= self.threshold {
                continue;
            }
            // rows arrive oldest topic first, so only a strictly better score wins
            if best.as_ref().map_or(true, |(_, current)| score > *current) {
                best = Some((row.topic_id.clone(), score));
            }
        }
        Ok(best)
    }

    /// Returns the topic `name` refers to, creating it if nothing matches.
    /// Resolution of one normalized name is serialized, so concurrent calls
    /// with the same new name create a single topic.
    #[instrument(target = "topic", level = "debug", skip(self, context), fields(article_id = ?context.article_id))]
    pub async fn resolve_or_create(
        &self,
        name: &str,
        context: &ResolveContext,
    ) -> Result<TopicId, RegistryError> {
        let normalized = self.normalizer.normalize(name);
        if normalized.is_empty() {
            return Err(RegistryError::EmptyName(name.to_string()));
        }
        let display_name = name.trim();

        let _name_guard = self.locks.lock_name(&normalized).await;

        if let Some((matched, score)) = self.best_match(display_name, &normalized).await? {
            // a merge may redirect the match while we wait for its lock
            let mut current = matched;
            loop {
                let guard = self.locks.lock_topic(&current).await;
                let canonical = self.canonical(&current).await?;
                if canonical != current {
                    drop(guard);
                    current = canonical;
                    continue;
                }
                if self
                    .db
                    .add_topic_alias(&current, display_name, &normalized)
                    .await?
                {
                    info!(
                        target: TARGET_TOPIC,
                        "Added alias '{}' to topic {} (score {:.3})", display_name, current, score
                    );
                }
                return Ok(current);
            }
        }

        let topic = Topic {
            id: TopicId::generate(),
            name: display_name.to_string(),
            aliases: vec![display_name.to_string()],
            created_at: Utc::now(),
            redirect_to: None,
        };
        self.db.insert_topic(&topic, &normalized).await?;
        info!(
            target: TARGET_TOPIC,
            "New topic '{}' ({}) from article {:?}", topic.name, topic.id, context.article_id
        );
        Ok(topic.id)
    }

    /// Read-only resolution; never creates or modifies a topic.
    pub async fn lookup(&self, name: &str) -> Result<Option<TopicId>, RegistryError> {
        let normalized = self.normalizer.normalize(name);
        if normalized.is_empty() {
            return Ok(None);
        }
        match self.best_match(name.trim(), &normalized).await? {
            Some((topic_id, _)) => Ok(Some(self.canonical(&topic_id).await?)),
            None => Ok(None),
        }
    }

    /// Follows redirects to the surviving topic.
    pub async fn canonical(&self, topic_id: &TopicId) -> Result<TopicId, RegistryError> {
        let mut current = topic_id.clone();
        let mut seen = HashSet::new();

        loop {
            if !seen.insert(current.clone()) {
                return Err(DataIntegrityError {
                    topic_id: topic_id.clone(),
                    detail: format!("redirect cycle through {}", current),
                }
                .into());
            }
            match self.db.topic_redirect(&current).await? {
                None => return Err(RegistryError::UnknownTopic(current)),
                Some(None) => return Ok(current),
                Some(Some(next)) => current = next,
            }
        }
    }

    pub async fn get_topic(&self, topic_id: &TopicId) -> Result<Option<Topic>, RegistryError> {
        Ok(self.db.get_topic(topic_id).await?)
    }

    pub async fn list_topics(&self) -> Result<Vec<Topic>, RegistryError> {
        Ok(self.db.list_topics().await?)
    }

    /// Unions two topics into the earlier-created one (lexically smaller id
    /// on a tie) and returns the survivor. The other id becomes a redirect.
    #[instrument(target = "topic", level = "info", skip(self))]
    pub async fn merge(&self, topic_a: &TopicId, topic_b: &TopicId) -> Result<TopicId, RegistryError> {
        loop {
            let canonical_a = self.canonical(topic_a).await?;
            let canonical_b = self.canonical(topic_b).await?;

            if &canonical_a != topic_a && &canonical_b != topic_b && canonical_a != canonical_b {
                warn!(
                    target: TARGET_TOPIC,
                    "Refusing to merge {} and {}: already redirected to {} and {}",
                    topic_a, topic_b, canonical_a, canonical_b
                );
                return Err(ConflictError {
                    topic_a: topic_a.clone(),
                    topic_b: topic_b.clone(),
                    survivor_a: canonical_a,
                    survivor_b: canonical_b,
                }
                .into());
            }
            if canonical_a == canonical_b {
                debug!(target: TARGET_TOPIC, "{} and {} are already one topic", topic_a, topic_b);
                return Ok(canonical_a);
            }

            let _guard = self.locks.lock_topics(&[&canonical_a, &canonical_b]).await;
            // another merge may have won the race for the locks
            if self.canonical(&canonical_a).await? != canonical_a
                || self.canonical(&canonical_b).await? != canonical_b
            {
                continue;
            }

            let a = self
                .db
                .get_topic(&canonical_a)
                .await?
                .ok_or_else(|| RegistryError::UnknownTopic(canonical_a.clone()))?;
            let b = self
                .db
                .get_topic(&canonical_b)
                .await?
                .ok_or_else(|| RegistryError::UnknownTopic(canonical_b.clone()))?;
            let (survivor, loser) = if a.precedes(&b) { (a, b) } else { (b, a) };

            let counts = self.db.merge_topics(&survivor.id, &loser.id).await?;
            info!(
                target: TARGET_TOPIC,
                "Merged '{}' ({}) into '{}' ({}): {} events, {} statements moved, {} superseded",
                loser.name, loser.id, survivor.name, survivor.id,
                counts.events_moved, counts.statements_moved, counts.statements_superseded
            );
            return Ok(survivor.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Speaker, Stance, Statement, StatementId};
    use std::sync::Arc;

    async fn registry() -> TopicRegistry {
        let db = Database::in_memory().await.unwrap();
        TopicRegistry::new(db, &MatchConfig::default(), KeyedLocks::new())
    }

    fn ctx() -> ResolveContext {
        ResolveContext::for_article("a-1")
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent_and_collects_aliases() {
        let registry = registry().await;
        let first = registry.resolve_or_create("City Council", &ctx()).await.unwrap();
        let again = registry.resolve_or_create("city council", &ctx()).await.unwrap();
        let variant = registry
            .resolve_or_create("The Springfield City Council", &ctx())
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(first, variant);

        let topic = registry.get_topic(&first).await.unwrap().unwrap();
        assert_eq!(topic.name, "City Council");
        assert_eq!(
            topic.aliases,
            vec!["City Council".to_string(), "The Springfield City Council".to_string()]
        );

        let other = registry.resolve_or_create("School Board", &ctx()).await.unwrap();
        assert_ne!(first, other);
        assert_eq!(registry.list_topics().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_name_is_rejected() {
        let registry = registry().await;
        let err = registry.resolve_or_create(" ?! ", &ctx()).await.unwrap_err();
        assert!(matches!(err, RegistryError::EmptyName(_)));
        assert_eq!(registry.lookup("").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_resolution_creates_one_topic() {
        let registry = Arc::new(registry().await);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .resolve_or_create("Harbor Bridge Project", &ResolveContext::default())
                    .await
                    .unwrap()
            }));
        }
        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.list_topics().await.unwrap().len(), 1);
        // name locks do not outlive the resolutions that took them
        assert!(registry.locks.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_is_read_only() {
        let registry = registry().await;
        assert_eq!(registry.lookup("Mayor Lee").await.unwrap(), None);
        assert!(registry.list_topics().await.unwrap().is_empty());

        let id = registry.resolve_or_create("Mayor Lee", &ctx()).await.unwrap();
        assert_eq!(registry.lookup("mayor lee").await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_merge_keeps_everything_and_redirects() {
        let registry = registry().await;
        let older = registry.resolve_or_create("Harbor Bridge", &ctx()).await.unwrap();
        let newer = registry.resolve_or_create("Bay Crossing", &ctx()).await.unwrap();

        let statement = |topic: &TopicId| Statement {
            id: StatementId::generate(),
            topic_id: topic.clone(),
            speaker: Speaker::named("Engineer Diaz"),
            speaker_role: None,
            quote: "It will open in May.".into(),
            stance: Stance::Neutral,
            article_id: "a-9".into(),
            report_time: Utc::now(),
            seq: 0,
            merged_into: None,
        };
        registry.db.insert_statement(&statement(&older)).await.unwrap();
        registry.db.insert_statement(&statement(&newer)).await.unwrap();

        // argument order does not decide the survivor
        let survivor = registry.merge(&newer, &older).await.unwrap();
        assert_eq!(survivor, older);
        assert_eq!(registry.canonical(&newer).await.unwrap(), older);

        let topic = registry.get_topic(&older).await.unwrap().unwrap();
        assert!(topic.aliases.contains(&"Harbor Bridge".to_string()));
        assert!(topic.aliases.contains(&"Bay Crossing".to_string()));
        assert_eq!(registry.list_topics().await.unwrap().len(), 1);

        // the colliding statement is superseded, not deleted
        assert_eq!(registry.db.active_statements(&older).await.unwrap().len(), 1);
        let superseded: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM statements WHERE merged_into IS NOT NULL")
                .fetch_one(registry.db.pool())
                .await
                .unwrap();
        assert_eq!(superseded, 1);

        // a name that matched the loser now resolves to the survivor
        let resolved = registry.resolve_or_create("Bay Crossing", &ctx()).await.unwrap();
        assert_eq!(resolved, older);
        assert_eq!(registry.merge(&older, &newer).await.unwrap(), older);
    }

    #[tokio::test]
    async fn test_merge_conflict() {
        let registry = registry().await;
        let a = registry.resolve_or_create("Harbor Bridge", &ctx()).await.unwrap();
        let b = registry.resolve_or_create("Bay Crossing", &ctx()).await.unwrap();
        let c = registry.resolve_or_create("School Board", &ctx()).await.unwrap();
        let d = registry.resolve_or_create("Teachers Union", &ctx()).await.unwrap();
        registry.merge(&a, &b).await.unwrap();
        registry.merge(&c, &d).await.unwrap();

        let err = registry.merge(&b, &d).await.unwrap_err();
        match err {
            RegistryError::Conflict(conflict) => {
                assert_eq!(conflict.survivor_a, a);
                assert_eq!(conflict.survivor_b, c);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_canonical_of_unknown_topic() {
        let registry = registry().await;
        let err = registry.canonical(&TopicId::from("missing")).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownTopic(_)));
    }
}
