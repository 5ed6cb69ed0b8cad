//! Per-user indexing worker.
//!
//! One tokio task per user owns that user's indexing state. Commands from the
//! facade arrive over a channel and are handled between messages. Only
//! disabling and a user pause abandon the message being decrypted. Writes,
//! evictions and clears of one user's partition therefore never race each
//! other.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

use super::progress::{EtaEstimator, IndexingProgress};
use super::source::{MessageDecrypter, MessageEvent, MessageRef, MessageSource};
use super::state::{IndexingState, PauseReason, SpeedMode};
use crate::budget::{ByteCount, StorageBudget};
use crate::conditions::ConditionSnapshot;
use crate::config::{IndexingConfig, Throughput};
use crate::index::{ContentIndexStore, IndexEntry, InsertOutcome, MessageFields};
use crate::settings::{IndexCursor, IndexingStats, SettingsRepository, UserSettings};
use crate::{MessageId, Result, UserId};

/// Queued commands per worker.
const COMMAND_CAPACITY: usize = 64;

/// Requests sent from the facade to a worker.
pub(crate) enum Command {
    Enable,
    /// Stop work, clear the partition and forget progress.
    Disable {
        reply: oneshot::Sender<Result<()>>,
    },
    PauseByUser,
    ResumeByUser,
    SetCellularAllowed(bool),
    SetSpeed(SpeedMode),
    /// Change the storage limit, evicting before replying.
    Resize {
        limit: ByteCount,
        reply: oneshot::Sender<Result<Vec<MessageId>>>,
    },
    Notify(MessageEvent),
}

impl Command {
    /// Whether the command abandons the message being decrypted. Everything
    /// else waits until that message is done.
    const fn interrupts_item(&self) -> bool {
        matches!(self, Self::Disable { .. } | Self::PauseByUser)
    }
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub source: Arc<dyn MessageSource>,
    pub decrypter: Arc<dyn MessageDecrypter>,
    pub store: Arc<ContentIndexStore>,
    pub settings: Arc<SettingsRepository>,
    pub budget: StorageBudget,
    pub config: Arc<IndexingConfig>,
}

/// The facade's side of a running worker.
pub(crate) struct WorkerHandle {
    pub commands: mpsc::Sender<Command>,
    pub state: watch::Receiver<IndexingState>,
    pub progress: watch::Receiver<IndexingProgress>,
    pub task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Walking the mailbox from the cursor.
    Build,
    /// Catching up after new or changed mail.
    Refresh,
    /// Nothing left to do.
    Idle,
}

/// Where the message being processed came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Backlog,
    Pending,
}

enum Next {
    Message(MessageRef, Origin),
    RetryLater,
    Finished,
}

#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Worker {
    user_id: UserId,
    ctx: WorkerContext,
    commands: mpsc::Receiver<Command>,
    conditions: watch::Receiver<ConditionSnapshot>,
    conditions_open: bool,
    state_tx: watch::Sender<IndexingState>,
    progress_tx: watch::Sender<IndexingProgress>,

    enabled: bool,
    allow_cellular: bool,
    paused_by_user: bool,
    halted: Option<PauseReason>,
    low_storage: bool,
    partial: bool,
    phase: Phase,
    speed: SpeedMode,

    cursor: Option<IndexCursor>,
    backlog: VecDeque<MessageRef>,
    pending: VecDeque<MessageRef>,
    /// Commands received while a message was in flight.
    deferred: VecDeque<Command>,
    stats: IndexingStats,
    eta: EtaEstimator,
    consecutive_failures: u32,
    in_batch: usize,
}

impl Worker {
    /// Start the worker of `user_id` on the current runtime.
    pub(crate) fn spawn(
        user_id: UserId,
        ctx: WorkerContext,
        conditions: watch::Receiver<ConditionSnapshot>,
    ) -> WorkerHandle {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state) = watch::channel(IndexingState::Undetermined);
        let (progress_tx, progress) = watch::channel(IndexingProgress::default());
        let eta = EtaEstimator::new(ctx.config.eta_smoothing, ctx.config.eta_warmup_samples);

        let worker = Self {
            user_id,
            ctx,
            commands,
            conditions,
            conditions_open: true,
            state_tx,
            progress_tx,
            enabled: false,
            allow_cellular: false,
            paused_by_user: false,
            halted: None,
            low_storage: false,
            partial: false,
            phase: Phase::Idle,
            speed: SpeedMode::default(),
            cursor: None,
            backlog: VecDeque::new(),
            pending: VecDeque::new(),
            deferred: VecDeque::new(),
            stats: IndexingStats::default(),
            eta,
            consecutive_failures: 0,
            in_batch: 0,
        };

        WorkerHandle {
            commands: commands_tx,
            state,
            progress,
            task: tokio::spawn(worker.run()),
        }
    }

    async fn run(mut self) {
        self.detect().await;

        loop {
            let keep_running = if self.is_working() {
                self.step().await
            } else {
                self.idle().await
            };
            if !keep_running {
                break;
            }
        }

        debug!("Indexing worker of user {} stopped", self.user_id);
    }

    fn is_working(&self) -> bool {
        self.state_tx.borrow().is_active()
    }

    /// Resolve the `Undetermined` state from persisted settings.
    async fn detect(&mut self) {
        let saved = self.ctx.settings.get(&self.user_id).await;
        match saved {
            Ok(Some(saved)) => {
                self.allow_cellular = saved.allow_cellular;
                if saved.enabled {
                    self.restore(saved);
                }
            }
            Ok(None) => {}
            Err(e) => error!(
                "Failed to restore indexing state of user {}, treating as disabled: {e}",
                self.user_id
            ),
        }

        self.publish().await;
        self.report_progress();
    }

    fn restore(&mut self, saved: UserSettings) {
        self.enabled = true;
        self.paused_by_user = saved.paused_by_user;
        self.cursor = saved.cursor;
        self.stats = saved.stats;
        self.phase = Phase::Build;

        match saved.state {
            IndexingState::Paused(
                reason @ (PauseReason::RepeatedFailures | PauseReason::StorageFailure),
            ) => self.halted = Some(reason),
            IndexingState::LowStorage => self.low_storage = true,
            IndexingState::Partial => {
                self.phase = Phase::Idle;
                self.partial = true;
            }
            // Mail may have arrived while we were not running.
            IndexingState::Complete | IndexingState::Refreshing => self.phase = Phase::Refresh,
            _ => {}
        }

        debug!(
            "Restored indexing of user {} from state {}",
            self.user_id, saved.state
        );
    }

    /// Wait for a command or a condition change. Returns false once the
    /// facade is gone.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            command = self.commands.recv() => match command {
                Some(command) => {
                    self.handle(command).await;
                    true
                }
                None => false,
            },
            changed = self.conditions.changed(), if self.conditions_open => {
                if changed.is_err() {
                    self.conditions_open = false;
                }
                self.publish().await;
                true
            }
        }
    }

    /// Process one message. Returns false once the facade is gone.
    async fn step(&mut self) -> bool {
        // Conditions may have changed since the last item.
        self.publish().await;
        if !self.is_working() {
            return true;
        }

        let (message, origin) = match self.next_message().await {
            Next::Message(message, origin) => (message, origin),
            Next::RetryLater => {
                let delay = self.ctx.config.background.batch_delay();
                return self.rest(delay).await;
            }
            Next::Finished => return true,
        };

        let decrypter = Arc::clone(&self.ctx.decrypter);
        let user_id = self.user_id.clone();
        let target = message.clone();
        let item_timeout = self.ctx.config.item_timeout();
        let started = Instant::now();
        let work = async move { timeout(item_timeout, decrypter.decrypt(&user_id, &target)).await };
        tokio::pin!(work);

        let result = loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) if command.interrupts_item() => {
                        self.put_back(message, origin);
                        self.handle_deferred().await;
                        self.handle(command).await;
                        return true;
                    }
                    Some(command) => self.deferred.push_back(command),
                    None => {
                        self.put_back(message, origin);
                        return false;
                    }
                },
                result = &mut work => break result,
            }
        };

        match result {
            Ok(Ok(fields)) => {
                self.store_message(message, origin, fields, started.elapsed()).await;
            }
            Ok(Err(e)) => {
                warn!("Skipping message {} of user {}: {e}", message.id, self.user_id);
                self.skip(message, origin);
            }
            Err(_) => {
                warn!(
                    "Skipping message {} of user {}: timed out after {:?}",
                    message.id, self.user_id, item_timeout
                );
                self.skip(message, origin);
            }
        }
        self.end_of_item().await
    }

    async fn next_message(&mut self) -> Next {
        if let Some(message) = self.pending.pop_front() {
            return Next::Message(message, Origin::Pending);
        }

        if self.backlog.is_empty() {
            let limit = self.throughput().batch_size.max(1);
            let fetch = self
                .ctx
                .source
                .messages_after(&self.user_id, self.cursor.as_ref(), limit);
            let fetched = timeout(self.ctx.config.item_timeout(), fetch).await;
            match fetched {
                Ok(Ok(messages)) => self.backlog.extend(messages),
                Ok(Err(e)) => {
                    warn!("Listing messages of user {} failed: {e}", self.user_id);
                    self.record_failure();
                    self.publish().await;
                    return Next::RetryLater;
                }
                Err(_) => {
                    warn!("Listing messages of user {} timed out", self.user_id);
                    self.record_failure();
                    self.publish().await;
                    return Next::RetryLater;
                }
            }
        }

        match self.backlog.pop_front() {
            Some(message) => Next::Message(message, Origin::Backlog),
            None => {
                self.finish_phase().await;
                Next::Finished
            }
        }
    }

    async fn store_message(
        &mut self,
        message: MessageRef,
        origin: Origin,
        fields: MessageFields,
        elapsed: Duration,
    ) {
        let entry = IndexEntry::new(self.user_id.clone(), message.id.clone(), message.time, fields);

        let first_attempt = self.ctx.budget.admit(&entry).await;
        let outcome = match first_attempt {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    "Writing message {} of user {} failed, retrying: {e}",
                    message.id, self.user_id
                );
                let second_attempt = self.ctx.budget.admit(&entry).await;
                match second_attempt {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(
                            "Writing message {} of user {} failed again, pausing: {e}",
                            message.id, self.user_id
                        );
                        self.put_back(message, origin);
                        self.halted = Some(PauseReason::StorageFailure);
                        return;
                    }
                }
            }
        };

        match outcome {
            InsertOutcome::Stored { evicted } => {
                if !evicted.is_empty() && !self.partial {
                    info!(
                        "Index of user {} reached its storage limit, evicting oldest messages",
                        self.user_id
                    );
                }
                self.partial |= !evicted.is_empty();
                self.consecutive_failures = 0;
                self.eta.record(elapsed);
                self.advance(&message, origin);
            }
            InsertOutcome::ExceedsLimit { size } => {
                warn!(
                    "Message {} of user {} needs {size}, more than the whole storage limit",
                    message.id, self.user_id
                );
                self.put_back(message, origin);
                self.low_storage = true;
            }
        }
    }

    fn skip(&mut self, message: MessageRef, origin: Origin) {
        self.advance(&message, origin);
        self.record_failure();
    }

    fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.ctx.config.max_consecutive_failures {
            error!(
                "{} consecutive failures while indexing user {}, pausing",
                self.consecutive_failures, self.user_id
            );
            self.halted = Some(PauseReason::RepeatedFailures);
        }
    }

    fn advance(&mut self, message: &MessageRef, origin: Origin) {
        if origin == Origin::Backlog {
            self.cursor = Some(message.cursor());
        }
        self.stats.processed = self.stats.processed.saturating_add(1);
    }

    fn put_back(&mut self, message: MessageRef, origin: Origin) {
        match origin {
            Origin::Backlog => self.backlog.push_front(message),
            Origin::Pending => self.pending.push_front(message),
        }
    }

    async fn end_of_item(&mut self) -> bool {
        self.handle_deferred().await;
        self.publish().await;

        self.in_batch += 1;
        let throughput = self.throughput();
        if self.in_batch < throughput.batch_size.max(1) {
            return true;
        }

        self.in_batch = 0;
        self.report_progress();
        self.persist().await;
        if !self.is_working() {
            return true;
        }
        self.rest(throughput.batch_delay()).await
    }

    async fn handle_deferred(&mut self) {
        while let Some(command) = self.deferred.pop_front() {
            self.handle(command).await;
        }
    }

    async fn finish_phase(&mut self) {
        if self.phase == Phase::Build {
            info!(
                "Finished indexing user {} after {} messages",
                self.user_id, self.stats.processed
            );
        } else {
            debug!("Caught up on new mail of user {}", self.user_id);
        }
        self.phase = Phase::Idle;
        self.in_batch = 0;
        self.publish().await;
        self.persist().await;
        self.report_progress();
    }

    /// Sleep between batches while still serving commands. Returns false once
    /// the facade is gone.
    async fn rest(&mut self, delay: Duration) -> bool {
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return true;
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.handle(command).await;
                        if !self.is_working() {
                            return true;
                        }
                    }
                    None => return false,
                },
                changed = self.conditions.changed(), if self.conditions_open => {
                    if changed.is_err() {
                        self.conditions_open = false;
                    }
                    self.publish().await;
                    if !self.is_working() {
                        return true;
                    }
                }
            }
        }
    }

    fn throughput(&self) -> Throughput {
        let forced = self.conditions.borrow().forces_background();
        if self.speed == SpeedMode::Foreground && !forced {
            self.ctx.config.foreground
        } else {
            self.ctx.config.background
        }
    }

    fn derive_state(&self, conditions: &ConditionSnapshot) -> IndexingState {
        if !self.enabled {
            return IndexingState::Disabled;
        }
        if self.paused_by_user {
            return IndexingState::Paused(PauseReason::UserRequested);
        }
        if let Some(reason) = self.halted {
            return IndexingState::Paused(reason);
        }
        if self.low_storage {
            return IndexingState::LowStorage;
        }

        match self.phase {
            Phase::Idle if self.partial => IndexingState::Partial,
            Phase::Idle => IndexingState::Complete,
            Phase::Build | Phase::Refresh => {
                if let Some(reason) = conditions.blocking_reason(self.allow_cellular, &self.ctx.config)
                {
                    IndexingState::Paused(reason)
                } else if self.phase == Phase::Build {
                    IndexingState::CreatingIndex
                } else {
                    IndexingState::Refreshing
                }
            }
        }
    }

    /// Re-evaluate the state and notify observers if it changed.
    async fn publish(&mut self) {
        let conditions = *self.conditions.borrow_and_update();
        let state = self.derive_state(&conditions);
        let previous = *self.state_tx.borrow();
        if state == previous {
            return;
        }

        let newly_paused = !matches!(
            previous,
            IndexingState::Paused(_) | IndexingState::Undetermined
        );
        if let IndexingState::Paused(reason) = state {
            if newly_paused {
                self.stats.pause_count = self.stats.pause_count.saturating_add(1);
                if reason.is_condition() {
                    self.stats.interruption_count =
                        self.stats.interruption_count.saturating_add(1);
                }
            }
        }

        info!(
            "Indexing state of user {} changed: {} -> {}",
            self.user_id, previous, state
        );
        if self.enabled {
            self.save(state).await;
        }
        self.report_progress();
        self.state_tx.send_replace(state);
    }

    async fn persist(&self) {
        if self.enabled {
            let state = *self.state_tx.borrow();
            self.save(state).await;
        }
    }

    async fn save(&self, state: IndexingState) {
        if let Err(e) = self
            .ctx
            .settings
            .save_progress(&self.user_id, &state, self.cursor.as_ref(), &self.stats)
            .await
        {
            warn!("Failed to save indexing progress of user {}: {e}", self.user_id);
        }
    }

    fn report_progress(&self) {
        let queued = u64::try_from(self.backlog.len() + self.pending.len()).unwrap_or(u64::MAX);
        let total_estimate = self
            .stats
            .total
            .max(self.stats.processed.saturating_add(queued));
        let remaining = total_estimate - self.stats.processed;

        self.progress_tx.send_replace(IndexingProgress {
            processed: self.stats.processed,
            total_estimate,
            estimated_time_remaining: self.eta.estimate(remaining),
        });
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Enable => self.enable().await,
            Command::Disable { reply } => {
                let result = self.disable().await;
                // The caller may have stopped waiting.
                let _ = reply.send(result);
            }
            Command::PauseByUser => self.pause_by_user().await,
            Command::ResumeByUser => self.resume_by_user().await,
            Command::SetCellularAllowed(allowed) => self.set_cellular_allowed(allowed).await,
            Command::SetSpeed(speed) => {
                debug!("Indexing speed of user {} set to {:?}", self.user_id, speed);
                self.speed = speed;
            }
            Command::Resize { limit, reply } => {
                let result = self.resize(limit).await;
                let _ = reply.send(result);
            }
            Command::Notify(event) => self.on_message_event(event).await,
        }
    }

    async fn enable(&mut self) {
        if self.enabled {
            debug!("Encrypted search already enabled for user {}", self.user_id);
            return;
        }
        if let Err(e) = self.ctx.settings.set_enabled(&self.user_id, true).await {
            warn!("Failed to persist enabling search for user {}: {e}", self.user_id);
        }

        info!("Encrypted search enabled for user {}", self.user_id);
        self.enabled = true;
        self.paused_by_user = false;
        self.halted = None;
        self.low_storage = false;
        self.start_build().await;
    }

    /// Walk the whole mailbox again from the oldest message.
    async fn start_build(&mut self) {
        self.phase = Phase::Build;
        self.partial = false;
        self.cursor = None;
        self.backlog.clear();
        self.pending.clear();
        self.consecutive_failures = 0;
        self.in_batch = 0;
        self.eta.reset();
        self.stats.processed = 0;

        let count = self.ctx.source.total_messages(&self.user_id);
        let counted = timeout(self.ctx.config.item_timeout(), count).await;
        self.stats.total = match counted {
            Ok(Ok(total)) => total,
            Ok(Err(e)) => {
                warn!("Counting messages of user {} failed: {e}", self.user_id);
                0
            }
            Err(_) => {
                warn!("Counting messages of user {} timed out", self.user_id);
                0
            }
        };

        debug!(
            "Building index of user {} over {} messages",
            self.user_id, self.stats.total
        );
        self.publish().await;
        self.report_progress();
    }

    async fn disable(&mut self) -> Result<()> {
        let was_enabled = self.enabled;
        self.enabled = false;
        self.paused_by_user = false;
        self.halted = None;
        self.low_storage = false;
        self.partial = false;
        self.phase = Phase::Idle;
        self.cursor = None;
        self.backlog.clear();
        self.pending.clear();
        self.stats.processed = 0;
        self.stats.total = 0;
        self.consecutive_failures = 0;
        self.in_batch = 0;
        self.eta.reset();

        let removed = self.ctx.store.remove_all(&self.user_id).await;
        let reset = self.ctx.settings.reset_progress(&self.user_id).await;
        self.publish().await;
        self.report_progress();

        let removed = removed?;
        reset?;
        if was_enabled || removed > 0 {
            info!(
                "Encrypted search disabled for user {}, {} entries removed",
                self.user_id, removed
            );
        }
        Ok(())
    }

    async fn pause_by_user(&mut self) {
        if !self.enabled || self.paused_by_user {
            return;
        }
        if let Err(e) = self.ctx.settings.set_paused_by_user(&self.user_id, true).await {
            warn!("Failed to persist pause of user {}: {e}", self.user_id);
        }
        self.paused_by_user = true;
        self.publish().await;
    }

    async fn resume_by_user(&mut self) {
        if !self.enabled {
            return;
        }
        if self.paused_by_user {
            if let Err(e) = self.ctx.settings.set_paused_by_user(&self.user_id, false).await {
                warn!("Failed to persist resume of user {}: {e}", self.user_id);
            }
            self.paused_by_user = false;
        }
        if self.halted.take().is_some() {
            self.consecutive_failures = 0;
        }

        if self.phase == Phase::Idle && self.partial {
            info!("Rebuilding partial index of user {}", self.user_id);
            self.start_build().await;
        } else {
            self.publish().await;
        }
    }

    async fn set_cellular_allowed(&mut self, allowed: bool) {
        if let Err(e) = self.ctx.settings.set_allow_cellular(&self.user_id, allowed).await {
            warn!("Failed to persist cellular setting of user {}: {e}", self.user_id);
        }
        self.allow_cellular = allowed;
        self.publish().await;
    }

    async fn resize(&mut self, limit: ByteCount) -> Result<Vec<MessageId>> {
        let previous = self.ctx.budget.limit(&self.user_id).await;
        let evicted = self.ctx.budget.set_limit(&self.user_id, limit).await?;

        if self.enabled {
            if !evicted.is_empty() {
                info!(
                    "Storage limit of user {} lowered to {limit}, {} messages evicted",
                    self.user_id,
                    evicted.len()
                );
                self.partial = true;
            }
            if limit > previous {
                self.low_storage = false;
                if self.phase == Phase::Idle && self.partial {
                    info!("Storage limit of user {} raised, rebuilding index", self.user_id);
                    self.start_build().await;
                }
            }
        }

        self.publish().await;
        Ok(evicted)
    }

    async fn on_message_event(&mut self, event: MessageEvent) {
        if !self.enabled {
            return;
        }

        match event {
            MessageEvent::Deleted(id) => {
                self.backlog.retain(|m| m.id != id);
                self.pending.retain(|m| m.id != id);
                let removed = self.ctx.store.remove(&self.user_id, &id).await;
                match removed {
                    Ok(true) => {
                        debug!("Removed deleted message {id} from index of user {}", self.user_id);
                        self.low_storage = false;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(
                        "Failed to remove deleted message {id} of user {}: {e}",
                        self.user_id
                    ),
                }
            }
            MessageEvent::Arrived(message) => {
                self.stats.total = self.stats.total.saturating_add(1);
                self.queue(message);
            }
            MessageEvent::Updated(message) => self.queue(message),
        }

        self.publish().await;
    }

    /// Schedule a message for (re-)indexing.
    ///
    /// Messages after the cursor are picked up from the source anyway.
    fn queue(&mut self, message: MessageRef) {
        if message.is_at_or_before(self.cursor.as_ref())
            && !self.pending.iter().any(|m| m.id == message.id)
        {
            self.pending.push_back(message);
        }
        if self.phase == Phase::Idle {
            self.phase = Phase::Refresh;
        }
    }
}
