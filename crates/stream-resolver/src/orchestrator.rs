//! Task orchestrator.
//!
//! Accepts validated queries, runs the dispatcher pipeline in the
//! background under a hard timeout, and answers poll requests from the
//! in-memory task table. Each task's status moves Pending → Done or
//! Pending → Error exactly once and never regresses.
//!
//! A periodic reclamation pass purges expired terminal tasks and tells
//! the crawling substrate to drop its per-batch storage. Reclamation
//! only runs while no task is pending, and submissions arriving during
//! a pass wait for it to finish, so substrate storage is never torn
//! down under an active pipeline.

use chrono::{DateTime, Utc};
use shared::config::TaskConfig;
use shared::models::{AnimeQuery, QueryError, SourceStreams};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::fetch::Fetcher;

/// Terminal-or-not state of one task.
#[derive(Debug, Clone)]
enum TaskState {
    Pending,
    Done(Vec<SourceStreams>),
    Error(String),
}

#[derive(Debug, Clone)]
struct TaskEntry {
    state: TaskState,
    created_at: DateTime<Utc>,
}

impl TaskEntry {
    fn is_pending(&self) -> bool {
        matches!(self.state, TaskState::Pending)
    }
}

/// Answer to a poll request.
#[derive(Debug, Clone)]
pub enum PollStatus {
    NotFound,
    Pending,
    Done(Vec<SourceStreams>),
    Error(String),
}

pub struct Orchestrator {
    dispatcher: Arc<Dispatcher>,
    substrate: Arc<dyn Fetcher>,
    tasks: Arc<RwLock<HashMap<Uuid, TaskEntry>>>,
    reclaiming: Arc<AtomicBool>,
    config: TaskConfig,
}

impl Orchestrator {
    pub fn new(dispatcher: Dispatcher, substrate: Arc<dyn Fetcher>, config: TaskConfig) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            substrate,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            reclaiming: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Validate the query, create a pending task and start the
    /// pipeline without blocking the caller.
    ///
    /// Validation failures are returned synchronously; no task is
    /// created for them.
    pub async fn submit(&self, query: AnimeQuery) -> Result<Uuid, QueryError> {
        query.validate()?;

        // Wait out any reclamation pass currently tearing down
        // substrate storage.
        while self.reclaiming.load(Ordering::Acquire) {
            sleep(Duration::from_millis(20)).await;
        }

        let id = Uuid::new_v4();
        {
            let mut tasks = self.tasks.write().await;
            evict_overflow(&mut tasks, self.config.max_tasks);
            tasks.insert(
                id,
                TaskEntry {
                    state: TaskState::Pending,
                    created_at: Utc::now(),
                },
            );
        }
        info!(task_id = %id, episode = query.episode_number, "Task created");

        let dispatcher = self.dispatcher.clone();
        let tasks = self.tasks.clone();
        let run_timeout = Duration::from_secs(self.config.pipeline_timeout_secs);

        tokio::spawn(async move {
            // The pipeline runs in its own task so a panic inside it
            // surfaces as a JoinError instead of wedging the entry.
            let pipeline =
                tokio::spawn(async move { dispatcher.find_streams(&query).await });

            let state = match timeout(run_timeout, pipeline).await {
                Ok(Ok(streams)) => TaskState::Done(streams),
                Ok(Err(join_err)) => {
                    error!(task_id = %id, error = %join_err, "Resolution pipeline crashed");
                    TaskState::Error("internal resolution failure".to_string())
                }
                Err(_) => {
                    warn!(task_id = %id, "Resolution timed out");
                    TaskState::Error("resolution timed out".to_string())
                }
            };

            finish_task(&tasks, id, state).await;
        });

        Ok(id)
    }

    /// Current status of a task; idempotent, never consumes the
    /// result.
    pub async fn poll(&self, id: Uuid) -> PollStatus {
        match self.tasks.read().await.get(&id) {
            None => PollStatus::NotFound,
            Some(entry) => match &entry.state {
                TaskState::Pending => PollStatus::Pending,
                TaskState::Done(streams) => PollStatus::Done(streams.clone()),
                TaskState::Error(message) => PollStatus::Error(message.clone()),
            },
        }
    }

    /// Number of tasks currently retained.
    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// One reclamation pass: skipped entirely while any task is
    /// pending.
    pub async fn run_reclamation_once(&self) {
        self.reclaiming.store(true, Ordering::Release);

        let has_pending = self.tasks.read().await.values().any(TaskEntry::is_pending);
        if has_pending {
            debug!("Reclamation skipped, tasks in flight");
            self.reclaiming.store(false, Ordering::Release);
            return;
        }

        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.task_ttl_secs as i64);
        let purged = {
            let mut tasks = self.tasks.write().await;
            let before = tasks.len();
            tasks.retain(|_, entry| entry.is_pending() || entry.created_at > cutoff);
            before - tasks.len()
        };

        self.substrate.reclaim().await;
        self.reclaiming.store(false, Ordering::Release);

        if purged > 0 {
            info!(purged = purged, "Reclamation pass complete");
        }
    }

    /// Spawn the periodic reclamation loop.
    pub fn spawn_reclamation(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.clone();
        let period = Duration::from_secs(orchestrator.config.reclaim_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                orchestrator.run_reclamation_once().await;
            }
        })
    }
}

/// Record the terminal state. Only a pending entry is written, so a
/// late writer can never regress a terminal task.
async fn finish_task(tasks: &RwLock<HashMap<Uuid, TaskEntry>>, id: Uuid, state: TaskState) {
    let mut tasks = tasks.write().await;
    match tasks.get_mut(&id) {
        Some(entry) if entry.is_pending() => {
            entry.state = state;
            info!(task_id = %id, "Task finished");
        }
        Some(_) => warn!(task_id = %id, "Task already terminal, ignoring late result"),
        None => warn!(task_id = %id, "Task evicted before completion"),
    }
}

/// Make room for one new task by evicting the oldest terminal entries.
/// Pending tasks are never evicted.
fn evict_overflow(tasks: &mut HashMap<Uuid, TaskEntry>, max_tasks: usize) {
    while tasks.len() >= max_tasks.max(1) {
        let oldest = tasks
            .iter()
            .filter(|(_, entry)| !entry.is_pending())
            .min_by_key(|(_, entry)| entry.created_at)
            .map(|(id, _)| *id);
        match oldest {
            Some(id) => {
                tasks.remove(&id);
                debug!(task_id = %id, "Evicted terminal task");
            }
            // Table full of pending tasks; let it grow rather than
            // drop live work.
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchHeaders, FetchedPage};
    use crate::sources::{SourceResolution, StreamSource};
    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    struct NullFetcher;

    #[async_trait]
    impl Fetcher for NullFetcher {
        async fn fetch_batch(
            &self,
            _urls: &[String],
            _headers: &FetchHeaders,
            _max_retries: u32,
        ) -> Vec<FetchedPage> {
            Vec::new()
        }
    }

    /// Resolves empty immediately.
    struct InstantSource;

    #[async_trait]
    impl StreamSource for InstantSource {
        fn name(&self) -> &str {
            "instant"
        }

        async fn resolve(&self, _query: &AnimeQuery) -> Result<Option<SourceResolution>> {
            Ok(None)
        }
    }

    /// Blocks until released.
    struct GatedSource {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl StreamSource for GatedSource {
        fn name(&self) -> &str {
            "gated"
        }

        async fn resolve(&self, _query: &AnimeQuery) -> Result<Option<SourceResolution>> {
            self.gate.notified().await;
            Ok(None)
        }
    }

    fn query() -> AnimeQuery {
        AnimeQuery {
            title: Some("Shangri-La Frontier".to_string()),
            english_title: None,
            japanese_title: None,
            episode_number: 3,
            mal_id: None,
            anilist_id: None,
        }
    }

    fn orchestrator_with(sources: Vec<Arc<dyn StreamSource>>, config: TaskConfig) -> Orchestrator {
        Orchestrator::new(Dispatcher::new(sources), Arc::new(NullFetcher), config)
    }

    async fn poll_until_terminal(orchestrator: &Orchestrator, id: Uuid) -> PollStatus {
        for _ in 0..200 {
            match orchestrator.poll(id).await {
                PollStatus::Pending => sleep(Duration::from_millis(5)).await,
                terminal => return terminal,
            }
        }
        panic!("task never reached a terminal state");
    }

    #[tokio::test]
    async fn test_poll_unknown_task_is_not_found() {
        let orchestrator = orchestrator_with(vec![Arc::new(InstantSource)], TaskConfig::default());
        assert!(matches!(
            orchestrator.poll(Uuid::new_v4()).await,
            PollStatus::NotFound
        ));
    }

    #[tokio::test]
    async fn test_invalid_query_creates_no_task() {
        let orchestrator = orchestrator_with(vec![Arc::new(InstantSource)], TaskConfig::default());

        let mut bad = query();
        bad.title = None;
        assert_eq!(
            orchestrator.submit(bad).await,
            Err(QueryError::MissingTitle)
        );

        let mut bad = query();
        bad.episode_number = 0;
        assert_eq!(
            orchestrator.submit(bad).await,
            Err(QueryError::InvalidEpisode)
        );

        assert_eq!(orchestrator.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_poll_is_pending_then_terminal_and_idempotent() {
        let gate = Arc::new(Notify::new());
        let orchestrator = orchestrator_with(
            vec![Arc::new(GatedSource { gate: gate.clone() })],
            TaskConfig::default(),
        );

        let id = orchestrator.submit(query()).await.unwrap();
        assert!(matches!(orchestrator.poll(id).await, PollStatus::Pending));

        gate.notify_waiters();
        gate.notify_one();

        let first = poll_until_terminal(&orchestrator, id).await;
        let PollStatus::Done(streams) = first else {
            panic!("expected Done, got {:?}", first);
        };
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].source, "gated");

        // Repeated polls keep returning the same terminal payload.
        let again = orchestrator.poll(id).await;
        let PollStatus::Done(streams_again) = again else {
            panic!("terminal state regressed");
        };
        assert_eq!(streams_again.len(), streams.len());
    }

    #[tokio::test]
    async fn test_timed_out_run_resolves_to_error() {
        let gate = Arc::new(Notify::new());
        let config = TaskConfig {
            pipeline_timeout_secs: 0,
            ..Default::default()
        };
        let orchestrator = orchestrator_with(vec![Arc::new(GatedSource { gate })], config);

        let id = orchestrator.submit(query()).await.unwrap();
        let status = poll_until_terminal(&orchestrator, id).await;
        assert!(matches!(status, PollStatus::Error(_)));
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest_terminal_task() {
        let config = TaskConfig {
            max_tasks: 2,
            ..Default::default()
        };
        let orchestrator = orchestrator_with(vec![Arc::new(InstantSource)], config);

        let first = orchestrator.submit(query()).await.unwrap();
        poll_until_terminal(&orchestrator, first).await;
        let second = orchestrator.submit(query()).await.unwrap();
        poll_until_terminal(&orchestrator, second).await;

        let third = orchestrator.submit(query()).await.unwrap();
        poll_until_terminal(&orchestrator, third).await;

        assert_eq!(orchestrator.task_count().await, 2);
        assert!(matches!(orchestrator.poll(first).await, PollStatus::NotFound));
        assert!(matches!(orchestrator.poll(third).await, PollStatus::Done(_)));
    }

    #[tokio::test]
    async fn test_reclamation_purges_expired_terminal_tasks() {
        let config = TaskConfig {
            task_ttl_secs: 0,
            ..Default::default()
        };
        let orchestrator = orchestrator_with(vec![Arc::new(InstantSource)], config);

        let id = orchestrator.submit(query()).await.unwrap();
        poll_until_terminal(&orchestrator, id).await;
        // Entry is terminal and instantly expired under ttl 0.
        sleep(Duration::from_millis(10)).await;

        orchestrator.run_reclamation_once().await;
        assert_eq!(orchestrator.task_count().await, 0);
        assert!(matches!(orchestrator.poll(id).await, PollStatus::NotFound));
    }

    #[tokio::test]
    async fn test_reclamation_skips_while_tasks_pending() {
        let gate = Arc::new(Notify::new());
        let config = TaskConfig {
            task_ttl_secs: 0,
            ..Default::default()
        };
        let orchestrator = orchestrator_with(
            vec![Arc::new(GatedSource { gate: gate.clone() })],
            config,
        );

        let id = orchestrator.submit(query()).await.unwrap();
        assert!(matches!(orchestrator.poll(id).await, PollStatus::Pending));

        orchestrator.run_reclamation_once().await;
        assert_eq!(orchestrator.task_count().await, 1);

        gate.notify_one();
        poll_until_terminal(&orchestrator, id).await;
    }
}
