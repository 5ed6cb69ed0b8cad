//! The encrypted search service.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::budget::{ByteCount, StorageBudget};
use crate::conditions::ConditionMonitor;
use crate::config::IndexingConfig;
use crate::index::{ContentIndexStore, KeyProvider, SearchHit, SearchQuery};
use crate::scheduler::{
    Advisory, Command, IndexingProgress, IndexingState, MessageDecrypter, MessageEvent,
    MessageSource, SpeedMode, Worker, WorkerContext, WorkerHandle,
};
use crate::settings::{IndexingStats, SettingsRepository};
use crate::{Error, MessageId, Result, UserId};

/// Per-user encrypted search, shared by everything that shows or controls it.
///
/// Construct one per process and pass it to consumers. Every operation is
/// scoped to a user registered with [`register_user`](Self::register_user);
/// users never see each other's state or index.
pub struct EncryptedSearchService {
    context: WorkerContext,
    monitor: Arc<ConditionMonitor>,
    workers: RwLock<HashMap<UserId, WorkerHandle>>,
}

impl EncryptedSearchService {
    /// Creates a service over existing repositories.
    #[must_use]
    pub fn new(
        store: Arc<ContentIndexStore>,
        settings: Arc<SettingsRepository>,
        source: Arc<dyn MessageSource>,
        decrypter: Arc<dyn MessageDecrypter>,
        monitor: Arc<ConditionMonitor>,
        config: IndexingConfig,
    ) -> Self {
        let budget = StorageBudget::new(
            Arc::clone(&settings),
            Arc::clone(&store),
            config.default_storage_limit,
        );
        Self {
            context: WorkerContext {
                source,
                decrypter,
                store,
                settings,
                budget,
                config: Arc::new(config),
            },
            monitor,
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Opens the index database named by `config`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be created.
    pub async fn open(
        config: IndexingConfig,
        keys: Arc<dyn KeyProvider>,
        source: Arc<dyn MessageSource>,
        decrypter: Arc<dyn MessageDecrypter>,
        monitor: Arc<ConditionMonitor>,
    ) -> Result<Self> {
        let path = config.database_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path = path.to_string_lossy();

        let store = Arc::new(ContentIndexStore::new(&path, keys).await?);
        let settings = Arc::new(SettingsRepository::new(&path).await?);
        info!("Opened encrypted search index at {}", path);

        Ok(Self::new(store, settings, source, decrypter, monitor, config))
    }

    /// Start tracking `user_id`. Registering twice is a no-op.
    ///
    /// The user's state is [`IndexingState::Undetermined`] until the saved
    /// settings were read.
    pub async fn register_user(&self, user_id: &UserId) {
        let mut workers = self.workers.write().await;
        if workers.contains_key(user_id) {
            return;
        }

        let handle = Worker::spawn(user_id.clone(), self.context.clone(), self.monitor.watch());
        workers.insert(user_id.clone(), handle);
        debug!("Registered user {user_id} for encrypted search");
    }

    /// Stop tracking `user_id`, waiting for its worker to finish. The index
    /// and settings are kept.
    pub async fn unregister_user(&self, user_id: &UserId) {
        let handle = self.workers.write().await.remove(user_id);
        if let Some(handle) = handle {
            drop(handle.commands);
            // A panicked worker has nothing left to clean up.
            let _ = handle.task.await;
            debug!("Unregistered user {user_id} from encrypted search");
        }
    }

    /// The device condition monitor driving this service.
    #[must_use]
    pub fn monitor(&self) -> &ConditionMonitor {
        &self.monitor
    }

    /// Current state, or [`IndexingState::Undetermined`] for unknown users.
    pub async fn state(&self, user_id: &UserId) -> IndexingState {
        self.workers
            .read()
            .await
            .get(user_id)
            .map_or(IndexingState::Undetermined, |h| *h.state.borrow())
    }

    /// Receiver notified on every state change.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownUser`] if the user is not registered.
    pub async fn subscribe_state(
        &self,
        user_id: &UserId,
    ) -> Result<watch::Receiver<IndexingState>> {
        self.workers
            .read()
            .await
            .get(user_id)
            .map(|h| h.state.clone())
            .ok_or_else(|| Error::UnknownUser(user_id.clone()))
    }

    /// Latest progress report.
    pub async fn progress(&self, user_id: &UserId) -> IndexingProgress {
        self.workers
            .read()
            .await
            .get(user_id)
            .map(|h| *h.progress.borrow())
            .unwrap_or_default()
    }

    /// Receiver notified after every batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownUser`] if the user is not registered.
    pub async fn subscribe_progress(
        &self,
        user_id: &UserId,
    ) -> Result<watch::Receiver<IndexingProgress>> {
        self.workers
            .read()
            .await
            .get(user_id)
            .map(|h| h.progress.clone())
            .ok_or_else(|| Error::UnknownUser(user_id.clone()))
    }

    /// Switch encrypted search on and start building the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the user is not registered or its worker stopped.
    pub async fn enable(&self, user_id: &UserId) -> Result<()> {
        self.send(user_id, Command::Enable).await
    }

    /// Switch encrypted search off and delete the user's index. Calling it
    /// again is harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if the user is not registered, its worker stopped, or
    /// clearing the index failed.
    pub async fn disable(&self, user_id: &UserId) -> Result<()> {
        self.request(user_id, |reply| Command::Disable { reply }).await
    }

    /// Delete every downloaded message from the index. Same as
    /// [`disable`](Self::disable).
    ///
    /// # Errors
    ///
    /// See [`disable`](Self::disable).
    pub async fn delete_index(&self, user_id: &UserId) -> Result<()> {
        self.disable(user_id).await
    }

    /// Pause indexing until [`resume_by_user`](Self::resume_by_user).
    ///
    /// # Errors
    ///
    /// Returns an error if the user is not registered or its worker stopped.
    pub async fn pause_by_user(&self, user_id: &UserId) -> Result<()> {
        self.send(user_id, Command::PauseByUser).await
    }

    /// Lift a user pause or an error pause. A partial index is rebuilt.
    ///
    /// # Errors
    ///
    /// Returns an error if the user is not registered or its worker stopped.
    pub async fn resume_by_user(&self, user_id: &UserId) -> Result<()> {
        self.send(user_id, Command::ResumeByUser).await
    }

    /// Allow or forbid indexing over cellular data.
    ///
    /// # Errors
    ///
    /// Returns an error if the user is not registered or its worker stopped.
    pub async fn set_cellular_download_allowed(
        &self,
        user_id: &UserId,
        allowed: bool,
    ) -> Result<()> {
        self.send(user_id, Command::SetCellularAllowed(allowed)).await
    }

    /// Choose foreground or background throughput.
    ///
    /// # Errors
    ///
    /// Returns an error if the user is not registered or its worker stopped.
    pub async fn set_speed(&self, user_id: &UserId, speed: SpeedMode) -> Result<()> {
        self.send(user_id, Command::SetSpeed(speed)).await
    }

    /// Change the storage limit. Returns once usage fits the new limit, with
    /// the evicted messages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLimit`] for a zero limit, or an error if the
    /// user is not registered or eviction failed.
    pub async fn resize(&self, user_id: &UserId, limit: ByteCount) -> Result<Vec<MessageId>> {
        self.request(user_id, |reply| Command::Resize { limit, reply })
            .await
    }

    /// Report a mailbox change.
    ///
    /// # Errors
    ///
    /// Returns an error if the user is not registered or its worker stopped.
    pub async fn notify(&self, user_id: &UserId, event: MessageEvent) -> Result<()> {
        self.send(user_id, Command::Notify(event)).await
    }

    /// Current size of the user's index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn storage_usage(&self, user_id: &UserId) -> Result<ByteCount> {
        self.context.budget.usage(user_id).await
    }

    /// Configured storage limit.
    pub async fn storage_limit(&self, user_id: &UserId) -> ByteCount {
        self.context.budget.limit(user_id).await
    }

    /// Time of the oldest message in the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn oldest_indexed_time(&self, user_id: &UserId) -> Result<Option<DateTime<Utc>>> {
        self.context.store.oldest_entry_time(user_id).await
    }

    /// Banner to show for the current state.
    pub async fn advisory(&self, user_id: &UserId) -> Option<Advisory> {
        self.state(user_id).await.advisory()
    }

    /// Progress and pause counters as last saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn stats(&self, user_id: &UserId) -> Result<IndexingStats> {
        Ok(self.context.settings.get_or_default(user_id).await?.stats)
    }

    /// Search the user's index, newest messages first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn search(
        &self,
        user_id: &UserId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let query = SearchQuery::parse(query);
        self.context.store.search(user_id, &query, limit).await
    }

    async fn commands(&self, user_id: &UserId) -> Result<mpsc::Sender<Command>> {
        self.workers
            .read()
            .await
            .get(user_id)
            .map(|h| h.commands.clone())
            .ok_or_else(|| Error::UnknownUser(user_id.clone()))
    }

    async fn send(&self, user_id: &UserId, command: Command) -> Result<()> {
        self.commands(user_id)
            .await?
            .send(command)
            .await
            .map_err(|_| Error::WorkerGone(user_id.clone()))
    }

    async fn request<T>(
        &self,
        user_id: &UserId,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(user_id, command(reply)).await?;
        response
            .await
            .map_err(|_| Error::WorkerGone(user_id.clone()))?
    }
}

impl std::fmt::Debug for EncryptedSearchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedSearchService")
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}
