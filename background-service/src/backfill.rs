use database::Database;
use llm_interface::EmbeddingProvider;
use memefeed_core::{
    CoreError, EmbeddingError, ErrorExt, ErrorRecovery, ErrorReporter, Post, PostId,
    RecoveryResult, WorkerConfig,
};
use preference_engine::ReactionHook;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one backfill pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub embedded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Recomputations requested for users who had reacted to a newly embedded post.
    pub triggered: usize,
    /// Recomputation requests the hook refused. The post stays pending and its
    /// users are handed to the hook again on the next pass.
    pub trigger_failures: usize,
}

/// Embeds posts that do not have a content embedding yet.
///
/// A reaction to a post without an embedding contributes nothing to the
/// reacting user's preference vector, so once a post gains its embedding every
/// user who reacted to it is handed to the hook for recomputation. The post
/// stays flagged in the database until every one of those hook calls succeeded.
pub struct EmbeddingBackfill<P, H> {
    database: Database,
    provider: P,
    hook: H,
    batch_size: u32,
    max_attempts: u32,
    interval: Duration,
}

impl<P, H> EmbeddingBackfill<P, H>
where
    P: EmbeddingProvider,
    H: ReactionHook,
{
    pub fn new(database: Database, provider: P, hook: H, config: &WorkerConfig) -> Self {
        Self {
            database,
            provider,
            hook,
            batch_size: config.backfill_batch_size.max(1),
            max_attempts: config.max_embedding_attempts.max(1),
            interval: Duration::from_secs(config.backfill_interval_minutes.max(1) * 60),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn hook(&self) -> &H {
        &self.hook
    }

    /// Processes one batch of posts missing an embedding, then refreshes the
    /// users of every post still waiting for a preference refresh.
    pub async fn run_once(&self) -> Result<BackfillReport, CoreError> {
        let mut report = BackfillReport::default();
        let mut failures = ErrorReporter::new("embedding-backfill");

        let posts = self
            .database
            .posts_missing_embedding(self.batch_size, self.max_attempts)
            .await?;

        if posts.is_empty() {
            debug!("No posts waiting for an embedding");
        } else {
            info!("Backfilling embeddings for {} posts", posts.len());
        }

        for post in posts {
            match self.embed_post(&post).await {
                RecoveryResult::Recovered(()) => report.embedded += 1,
                RecoveryResult::Skipped => {
                    warn!("Skipped embedding of post {}", post.id);
                    report.skipped += 1;
                    self.count_failed_attempt(post.id).await?;
                }
                RecoveryResult::Failed(e) => {
                    failures.report(format_args!("embedding post {}", post.id), &e);
                    report.failed += 1;
                    self.count_failed_attempt(post.id).await?;
                }
            }
        }

        self.refresh_reacting_users(&mut report, &mut failures).await?;

        if report != BackfillReport::default() {
            info!(
                "Backfill pass done: {} embedded, {} skipped, {} failed, {} recomputations ({} refused)",
                report.embedded, report.skipped, report.failed, report.triggered, report.trigger_failures
            );
            failures.log_summary();
        }
        Ok(report)
    }

    /// Runs a pass every interval until `shutdown` resolves. A failing pass is
    /// logged and retried on the next tick.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        tokio::pin!(shutdown);

        info!("Embedding backfill running every {:?}", self.interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        e.log_error();
                    }
                }
            }
        }
        info!("Embedding backfill stopped");
    }

    async fn embed_post(&self, post: &Post) -> RecoveryResult<()> {
        match self.try_embed_post(post).await {
            Ok(()) => RecoveryResult::Recovered(()),
            Err(e) => {
                e.log_warn();
                let strategy = ErrorRecovery::determine_strategy(&e);
                ErrorRecovery::apply_strategy(strategy, move || self.try_embed_post(post)).await
            }
        }
    }

    async fn try_embed_post(&self, post: &Post) -> Result<(), CoreError> {
        let description = post
            .description
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| EmbeddingError::EmptyInput {
                post_id: post.id.to_string(),
            })?;

        let embedding = self.provider.embed(description).await?;
        self.database.set_post_embedding(post.id, &embedding).await
    }

    async fn count_failed_attempt(&self, post: PostId) -> Result<(), CoreError> {
        let attempts = self.database.record_embedding_failure(post).await?;
        if attempts >= self.max_attempts {
            warn!(
                "Giving up on post {} after {} failed embedding attempts",
                post, attempts
            );
        }
        Ok(())
    }

    async fn refresh_reacting_users(
        &self,
        report: &mut BackfillReport,
        failures: &mut ErrorReporter,
    ) -> Result<(), CoreError> {
        let posts = self
            .database
            .posts_pending_preference_refresh(self.batch_size)
            .await?;

        for post in posts {
            let mut refused = 0;
            for user in self.database.users_reacting_to(post).await? {
                match self.hook.on_reactions_changed(user).await {
                    Ok(()) => report.triggered += 1,
                    Err(e) => {
                        failures.report(
                            format_args!("refreshing user {} after post {}", user, post),
                            &e,
                        );
                        refused += 1;
                    }
                }
            }

            if refused == 0 {
                self.database.clear_preference_refresh(post).await?;
            } else {
                debug!("Post {} stays pending: {} users not refreshed", post, refused);
                report.trigger_failures += refused;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memefeed_core::{DatabaseError, Embedding, LlmError, NewPost, ReactionKind, UserId};
    use preference_engine::{PreferenceAggregator, WeightTable};
    use std::collections::HashMap;
    use std::env;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct FakeProvider {
        vectors: HashMap<String, Embedding>,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(vectors: &[(&str, Embedding)]) -> Self {
            Self {
                vectors: vectors
                    .iter()
                    .map(|(text, vector)| (text.to_string(), vector.clone()))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl EmbeddingProvider for FakeProvider {
        async fn embed(&self, text: &str) -> Result<Embedding, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.vectors.get(text).cloned().ok_or_else(|| {
                CoreError::Llm(LlmError::RequestRejected {
                    provider: "fake".to_string(),
                    status_code: 400,
                })
            })
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        users: Mutex<Vec<UserId>>,
    }

    impl ReactionHook for RecordingHook {
        async fn on_reactions_changed(&self, user: UserId) -> Result<(), CoreError> {
            self.users.lock().unwrap().push(user);
            Ok(())
        }
    }

    /// Refuses the first call, then forwards to the aggregator.
    struct FlakyHook {
        aggregator: Arc<PreferenceAggregator<Database>>,
        refuse_next: AtomicBool,
    }

    impl ReactionHook for FlakyHook {
        async fn on_reactions_changed(&self, user: UserId) -> Result<(), CoreError> {
            if self.refuse_next.swap(false, Ordering::SeqCst) {
                return Err(DatabaseError::DatabaseLocked.into());
            }
            self.aggregator.on_reactions_changed(user).await
        }
    }

    async fn setup_test_db() -> Database {
        let db_path = env::temp_dir().join(format!("test_backfill_{}.db", uuid::Uuid::new_v4()));
        let db_url = format!("sqlite://{}", db_path.display());

        let mut db = Database::new(db_url).with_embedding_dimension(3);
        db.connect()
            .await
            .expect("Failed to connect to test database");
        db.run_migrations().await.expect("Failed to run migrations");

        db
    }

    async fn post_with_description(db: &Database, description: Option<&str>) -> Post {
        db.create_post(NewPost {
            description: description.map(str::to_string),
            ..NewPost::default()
        })
        .await
        .expect("Failed to create post")
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            backfill_batch_size: 10,
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_backfill_embeds_and_triggers_reacting_users() {
        let db = setup_test_db().await;
        let post = post_with_description(&db, Some("dog on a skateboard")).await;
        let user = db.get_or_create_user("auth0|backfill").await.unwrap();

        // Reacting before the embedding exists leaves the preference absent
        let aggregator = Arc::new(
            PreferenceAggregator::new(db.clone(), Arc::new(WeightTable::default()))
                .with_dimension(3),
        );
        db.set_reaction(user.id, post.id, Some(ReactionKind::Like), &aggregator)
            .await
            .unwrap();
        assert_eq!(db.get_user_preference(user.id).await.unwrap(), None);

        let provider = FakeProvider::new(&[("dog on a skateboard", vec![0.0, 2.0, 0.0])]);
        let backfill = EmbeddingBackfill::new(db.clone(), provider, aggregator, &config());

        let report = backfill.run_once().await.unwrap();
        assert_eq!(report.embedded, 1);
        assert_eq!(report.triggered, 1);

        let stored = db.get_post(post.id).await.unwrap().unwrap();
        assert_eq!(stored.embedding, Some(vec![0.0, 2.0, 0.0]));
        assert_eq!(
            db.get_user_preference(user.id).await.unwrap(),
            Some(vec![0.0, 1.0, 0.0])
        );

        // Nothing left to do on the next pass
        let report = backfill.run_once().await.unwrap();
        assert_eq!(report, BackfillReport::default());
    }

    #[tokio::test]
    async fn test_posts_without_description_are_not_selected() {
        let db = setup_test_db().await;
        post_with_description(&db, None).await;
        post_with_description(&db, Some("   ")).await;

        let provider = FakeProvider::new(&[]);
        let backfill = EmbeddingBackfill::new(db, provider, RecordingHook::default(), &config());

        let report = backfill.run_once().await.unwrap();
        assert_eq!(report, BackfillReport::default());
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_skipped() {
        let db = setup_test_db().await;
        let post = post_with_description(&db, Some("too short")).await;
        let user = db.get_or_create_user("auth0|dim").await.unwrap();
        db.set_reaction(user.id, post.id, Some(ReactionKind::Love), &RecordingHook::default())
            .await
            .unwrap();

        let provider = FakeProvider::new(&[("too short", vec![1.0, 0.0])]);
        let backfill = EmbeddingBackfill::new(db.clone(), provider, RecordingHook::default(), &config());

        let report = backfill.run_once().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.embedded, 0);
        assert!(backfill.hook().users.lock().unwrap().is_empty());
        assert_eq!(db.get_post(post.id).await.unwrap().unwrap().embedding, None);
    }

    #[tokio::test]
    async fn test_rejected_request_fails_the_post_only() {
        let db = setup_test_db().await;
        post_with_description(&db, Some("unknown text")).await;
        let known = post_with_description(&db, Some("known text")).await;

        let provider = FakeProvider::new(&[("known text", vec![1.0, 0.0, 0.0])]);
        let backfill = EmbeddingBackfill::new(db.clone(), provider, RecordingHook::default(), &config());

        let report = backfill.run_once().await.unwrap();
        assert_eq!(report.embedded, 1);
        assert_eq!(report.failed, 1);
        assert!(db.get_post(known.id).await.unwrap().unwrap().embedding.is_some());
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let db = setup_test_db().await;
        let post = post_with_description(&db, Some("loop")).await;

        let provider = FakeProvider::new(&[("loop", vec![0.0, 0.0, 1.0])]);
        let backfill = EmbeddingBackfill::new(db.clone(), provider, RecordingHook::default(), &config())
            .with_interval(Duration::from_millis(10));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(());
        });

        backfill
            .run_until(async {
                let _ = rx.await;
            })
            .await;
        stopper.await.unwrap();

        assert!(db.get_post(post.id).await.unwrap().unwrap().embedding.is_some());
    }

    #[tokio::test]
    async fn test_refused_refresh_is_retried_next_pass() {
        let db = setup_test_db().await;
        let post = post_with_description(&db, Some("cat in a box")).await;
        let user = db.get_or_create_user("auth0|flaky").await.unwrap();
        let aggregator = Arc::new(
            PreferenceAggregator::new(db.clone(), Arc::new(WeightTable::default()))
                .with_dimension(3),
        );
        db.set_reaction(user.id, post.id, Some(ReactionKind::Like), &aggregator)
            .await
            .unwrap();

        let hook = FlakyHook {
            aggregator,
            refuse_next: AtomicBool::new(true),
        };
        let provider = FakeProvider::new(&[("cat in a box", vec![0.0, 3.0, 0.0])]);
        let backfill = EmbeddingBackfill::new(db.clone(), provider, hook, &config());

        let report = backfill.run_once().await.unwrap();
        assert_eq!(report.embedded, 1);
        assert_eq!(report.triggered, 0);
        assert_eq!(report.trigger_failures, 1);
        assert_eq!(db.get_user_preference(user.id).await.unwrap(), None);
        assert_eq!(
            db.posts_pending_preference_refresh(10).await.unwrap(),
            vec![post.id]
        );

        // The post is not embedded again, only its users are refreshed
        let report = backfill.run_once().await.unwrap();
        assert_eq!(report.embedded, 0);
        assert_eq!(report.triggered, 1);
        assert_eq!(report.trigger_failures, 0);
        assert_eq!(
            db.get_user_preference(user.id).await.unwrap(),
            Some(vec![0.0, 1.0, 0.0])
        );

        let report = backfill.run_once().await.unwrap();
        assert_eq!(report, BackfillReport::default());
    }

    #[tokio::test]
    async fn test_failing_post_does_not_block_newer_posts() {
        let db = setup_test_db().await;
        let bad = post_with_description(&db, Some("unembeddable")).await;
        let good = post_with_description(&db, Some("embeddable")).await;

        let provider = FakeProvider::new(&[("embeddable", vec![1.0, 0.0, 0.0])]);
        let config = WorkerConfig {
            backfill_batch_size: 1,
            max_embedding_attempts: 2,
            ..WorkerConfig::default()
        };
        let backfill = EmbeddingBackfill::new(db.clone(), provider, RecordingHook::default(), &config);

        let report = backfill.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(db.get_post(good.id).await.unwrap().unwrap().embedding, None);

        let report = backfill.run_once().await.unwrap();
        assert_eq!(report.embedded, 1);
        assert!(db.get_post(good.id).await.unwrap().unwrap().embedding.is_some());

        // Second failure exhausts the attempts, after which the post is left alone
        let report = backfill.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        let report = backfill.run_once().await.unwrap();
        assert_eq!(report, BackfillReport::default());
        assert_eq!(db.get_post(bad.id).await.unwrap().unwrap().embedding, None);
        assert!(db.posts_missing_embedding(10, 2).await.unwrap().is_empty());
    }
}
