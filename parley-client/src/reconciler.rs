//! Replays the offline queue against the server.
//!
//! ```text
//!   network watch ──offline→online──► drain()
//!                                       │ per action, in sequence order
//!                                       ▼
//!                              ActionDispatcher::dispatch
//!                     ┌─────────────────┼───────────────────┐
//!                     ▼                 ▼                   ▼
//!                    Ok             Transient          any other error
//!                  remove        count attempt,          remove,
//!                               hold back the         emit Rejected
//!                               group's later
//!                               actions (dead
//!                               letter at
//!                               max_attempts)
//! ```
//!
//! A transient failure never lets a later action for the same group
//! overtake it; actions for other groups keep going.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use parley_core::model::unix_millis;
use parley_core::{Action, ActionError, ActionService, ActionType};

use crate::queue::{OfflineAction, OfflineQueue, QueueResult, SyncStats};

/// Sends one action to whatever is authoritative for it.
pub trait ActionDispatcher: Send + Sync {
    fn dispatch(&self, action: &Action) -> impl Future<Output = Result<(), ActionError>> + Send;
}

impl<D: ActionDispatcher> ActionDispatcher for Arc<D> {
    fn dispatch(&self, action: &Action) -> impl Future<Output = Result<(), ActionError>> + Send {
        (**self).dispatch(action)
    }
}

/// Applies actions straight to an in-process [`ActionService`].
pub struct LocalDispatcher {
    service: Arc<ActionService>,
    user_id: Uuid,
}

impl LocalDispatcher {
    pub fn new(service: Arc<ActionService>, user_id: Uuid) -> Self {
        Self { service, user_id }
    }
}

impl ActionDispatcher for LocalDispatcher {
    async fn dispatch(&self, action: &Action) -> Result<(), ActionError> {
        self.service.apply(self.user_id, action).await.map(|_| ())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub completed: usize,
    pub total: usize,
    /// Label of the action being replayed, if a drain is running.
    pub current_action: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub applied: usize,
    pub rejected: usize,
    pub dead_lettered: usize,
    /// Left in the queue for the next drain.
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainReport {
    /// Another drain was in progress; nothing was done.
    AlreadyRunning,
    Completed(DrainSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcilerEvent {
    Started { total: usize },
    Applied { id: Uuid, action_type: ActionType },
    Retrying { id: Uuid, attempts: u32, error: ActionError },
    DeadLettered { id: Uuid, error: ActionError },
    Rejected { id: Uuid, error: ActionError },
    Finished(DrainSummary),
}

/// What [`Reconciler::execute`] did with an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Applied,
    Queued(OfflineAction),
}

/// Resets the single-flight flag however the drain ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Reconciler<D> {
    queue: Arc<OfflineQueue>,
    dispatcher: D,
    draining: AtomicBool,
    progress: watch::Sender<SyncProgress>,
    events: broadcast::Sender<ReconcilerEvent>,
}

impl<D: ActionDispatcher> Reconciler<D> {
    pub fn new(queue: Arc<OfflineQueue>, dispatcher: D) -> Self {
        let (progress, _) = watch::channel(SyncProgress::default());
        let (events, _) = broadcast::channel(256);
        Self { queue, dispatcher, draining: AtomicBool::new(false), progress, events }
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> SyncProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ReconcilerEvent> {
        self.events.subscribe()
    }

    pub fn sync_stats(&self) -> QueueResult<SyncStats> {
        self.queue.sync_stats()
    }

    fn emit(&self, event: ReconcilerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run `action` now, or queue it if it cannot go out yet.
    ///
    /// Anything already pending goes first, so a non-empty queue always
    /// takes the new action. A transient failure queues it too; other
    /// failures are returned to the caller.
    pub async fn execute(&self, action: Action) -> Result<Execution, ActionError> {
        let store = self.queue.store()?;
        if store.pending_count()? > 0 {
            return Ok(Execution::Queued(store.append(action)?));
        }
        match self.dispatcher.dispatch(&action).await {
            Ok(()) => Ok(Execution::Applied),
            Err(e) if e.is_retryable() => {
                log::debug!("queueing {} after transient failure: {e}", action.label());
                Ok(Execution::Queued(store.append(action)?))
            }
            Err(e) => Err(e),
        }
    }

    /// Replay every pending action once, in sequence order.
    pub async fn drain(&self) -> QueueResult<DrainReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("drain already running");
            return Ok(DrainReport::AlreadyRunning);
        }
        let _guard = DrainGuard(&self.draining);

        let store = self.queue.store()?;
        let pending = store.pending()?;
        let total = pending.len();
        let mut summary = DrainSummary::default();

        log::info!("draining {total} queued actions");
        self.emit(ReconcilerEvent::Started { total });
        self.progress.send_replace(SyncProgress { completed: 0, total, current_action: None });

        // Groups whose earlier action failed transiently in this pass. Later
        // actions for them wait for the next drain; `None` is the group-less
        // lane (profile updates).
        let mut held_back: HashSet<Option<Uuid>> = HashSet::new();

        for (index, queued) in pending.iter().enumerate() {
            let lane = queued.action.group_id();
            if held_back.contains(&lane) {
                log::debug!("holding back #{} behind a failed action", queued.sequence);
                self.progress.send_modify(|p| p.completed = index + 1);
                continue;
            }

            let label = queued.action.label();
            self.progress.send_modify(|p| p.current_action = Some(label.clone()));

            match self.dispatcher.dispatch(&queued.action).await {
                Ok(()) => {
                    store.remove(queued.id)?;
                    store.set_last_sync(unix_millis())?;
                    summary.applied += 1;
                    log::debug!("replayed {label} (#{})", queued.sequence);
                    self.emit(ReconcilerEvent::Applied { id: queued.id, action_type: queued.action_type() });
                }
                Err(error) if error.is_retryable() => {
                    held_back.insert(lane);
                    let updated = store.record_failure(queued.id, &error.to_string())?;
                    if updated.attempts >= store.max_attempts() {
                        store.dead_letter(queued.id, &error.to_string())?;
                        summary.dead_lettered += 1;
                        self.emit(ReconcilerEvent::DeadLettered { id: queued.id, error });
                    } else {
                        log::info!("{label} failed (attempt {}): {error}", updated.attempts);
                        self.emit(ReconcilerEvent::Retrying {
                            id: queued.id,
                            attempts: updated.attempts,
                            error,
                        });
                    }
                }
                Err(error) => {
                    log::warn!("dropping rejected {label}: {error}");
                    store.remove(queued.id)?;
                    summary.rejected += 1;
                    self.emit(ReconcilerEvent::Rejected { id: queued.id, error });
                }
            }

            self.progress.send_modify(|p| p.completed = index + 1);
        }

        summary.remaining = store.pending_count()?;
        self.progress.send_replace(SyncProgress { completed: total, total, current_action: None });
        self.emit(ReconcilerEvent::Finished(summary.clone()));
        log::info!(
            "drain finished: {} applied, {} rejected, {} dead-lettered, {} left",
            summary.applied,
            summary.rejected,
            summary.dead_lettered,
            summary.remaining
        );
        Ok(DrainReport::Completed(summary))
    }

    /// Drain whenever `network` goes from offline to online, until the
    /// sender is dropped. Starting online counts as an edge.
    pub async fn run(&self, mut network: watch::Receiver<bool>) {
        let mut online = false;
        loop {
            let now = *network.borrow_and_update();
            if now && !online {
                match self.drain().await {
                    Ok(DrainReport::Completed(summary)) if summary.remaining > 0 => {
                        log::info!("{} actions still queued after reconnect", summary.remaining);
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("drain failed: {e}"),
                }
            }
            online = now;
            if network.changed().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;
    use parley_core::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Records dispatched actions and fails according to a script.
    #[derive(Default)]
    struct ScriptedDispatcher {
        script: Mutex<VecDeque<Result<(), ActionError>>>,
        seen: Mutex<Vec<Action>>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedDispatcher {
        fn with_script(script: Vec<Result<(), ActionError>>) -> Self {
            Self { script: Mutex::new(script.into()), ..Self::default() }
        }

        fn seen(&self) -> Vec<Action> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ActionDispatcher for ScriptedDispatcher {
        async fn dispatch(&self, action: &Action) -> Result<(), ActionError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.seen.lock().unwrap().push(action.clone());
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn queue(dir: &TempDir) -> Arc<OfflineQueue> {
        Arc::new(OfflineQueue::opened(QueueConfig::for_testing(dir.path())).unwrap())
    }

    #[tokio::test]
    async fn test_drain_applies_in_order() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);
        let g = Uuid::new_v4();
        let join = Action::JoinGroup { group_id: g };
        let hi = Action::send_message(g, "hi");
        queue.enqueue(join.clone()).unwrap();
        queue.enqueue(hi.clone()).unwrap();

        let reconciler = Reconciler::new(queue.clone(), ScriptedDispatcher::default());
        let report = reconciler.drain().await.unwrap();

        assert_eq!(
            report,
            DrainReport::Completed(DrainSummary { applied: 2, ..DrainSummary::default() })
        );
        assert_eq!(reconciler.dispatcher().seen(), vec![join, hi]);
        let stats = queue.sync_stats().unwrap();
        assert_eq!(stats.pending_actions, 0);
        assert!(stats.last_sync.is_some());
        assert_eq!(reconciler.progress(), SyncProgress { completed: 2, total: 2, current_action: None });
    }

    #[tokio::test]
    async fn test_rejected_action_is_dropped() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);
        let g = Uuid::new_v4();
        let bad = queue.enqueue(Action::LeaveGroup { group_id: g }).unwrap();
        queue.enqueue(Action::send_message(g, "after")).unwrap();

        let dispatcher = ScriptedDispatcher::with_script(vec![Err(ActionError::group_not_found(g))]);
        let reconciler = Reconciler::new(queue.clone(), dispatcher);
        let mut events = reconciler.subscribe_events();

        let report = reconciler.drain().await.unwrap();
        assert_eq!(
            report,
            DrainReport::Completed(DrainSummary { applied: 1, rejected: 1, ..DrainSummary::default() })
        );
        assert_eq!(queue.sync_stats().unwrap().pending_actions, 0);

        assert_eq!(events.recv().await.unwrap(), ReconcilerEvent::Started { total: 2 });
        assert!(matches!(
            events.recv().await.unwrap(),
            ReconcilerEvent::Rejected { id, error: ActionError::NotFound { .. } } if id == bad.id
        ));
    }

    #[tokio::test]
    async fn test_transient_failure_holds_back_same_group() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);
        let g = Uuid::new_v4();
        let first = queue.enqueue(Action::JoinGroup { group_id: g }).unwrap();
        let second = queue.enqueue(Action::send_message(g, "later")).unwrap();

        let dispatcher = ScriptedDispatcher::with_script(vec![Err(ActionError::transient("offline"))]);
        let reconciler = Reconciler::new(queue.clone(), dispatcher);

        let report = reconciler.drain().await.unwrap();
        assert_eq!(report, DrainReport::Completed(DrainSummary { remaining: 2, ..DrainSummary::default() }));
        assert_eq!(reconciler.dispatcher().seen().len(), 1);

        let pending = queue.pending().unwrap();
        assert_eq!(pending.iter().map(|p| p.id).collect::<Vec<_>>(), vec![first.id, second.id]);
        assert_eq!(pending[0].attempts, 1);

        // Next pass succeeds.
        reconciler.drain().await.unwrap();
        assert!(queue.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_does_not_block_other_groups() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);
        let (g1, g2) = (Uuid::new_v4(), Uuid::new_v4());
        let stuck = queue.enqueue(Action::JoinGroup { group_id: g1 }).unwrap();
        queue.enqueue(Action::JoinGroup { group_id: g2 }).unwrap();
        let behind = queue.enqueue(Action::send_message(g1, "waits")).unwrap();
        queue.enqueue(Action::send_message(g2, "goes")).unwrap();

        let dispatcher = ScriptedDispatcher::with_script(vec![Err(ActionError::transient("timeout"))]);
        let reconciler = Reconciler::new(queue.clone(), dispatcher);

        let report = reconciler.drain().await.unwrap();
        assert_eq!(
            report,
            DrainReport::Completed(DrainSummary { applied: 2, remaining: 2, ..DrainSummary::default() })
        );
        let seen_groups: Vec<_> = reconciler.dispatcher().seen().iter().map(|a| a.group_id()).collect();
        assert_eq!(seen_groups, vec![Some(g1), Some(g2), Some(g2)]);

        let pending: Vec<_> = queue.pending().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(pending, vec![stuck.id, behind.id]);
        assert_eq!(reconciler.progress().completed, 4);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(
            OfflineQueue::opened(QueueConfig { max_attempts: 2, ..QueueConfig::for_testing(dir.path()) })
                .unwrap(),
        );
        let doomed = queue.enqueue(Action::JoinGroup { group_id: Uuid::new_v4() }).unwrap();

        let dispatcher = ScriptedDispatcher::with_script(vec![
            Err(ActionError::transient("503")),
            Err(ActionError::transient("503")),
        ]);
        let reconciler = Reconciler::new(queue.clone(), dispatcher);
        let mut events = reconciler.subscribe_events();

        reconciler.drain().await.unwrap();
        let report = reconciler.drain().await.unwrap();
        assert_eq!(
            report,
            DrainReport::Completed(DrainSummary { dead_lettered: 1, ..DrainSummary::default() })
        );

        let stats = queue.sync_stats().unwrap();
        assert_eq!((stats.pending_actions, stats.dead_letters), (0, 1));

        let mut dead = None;
        while let Ok(event) = events.try_recv() {
            if let ReconcilerEvent::DeadLettered { id, .. } = event {
                dead = Some(id);
            }
        }
        assert_eq!(dead, Some(doomed.id));
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_single_flight() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);
        queue.enqueue(Action::JoinGroup { group_id: Uuid::new_v4() }).unwrap();

        let gate = Arc::new(Notify::new());
        let dispatcher = ScriptedDispatcher { gate: Some(gate.clone()), ..ScriptedDispatcher::default() };
        let reconciler = Arc::new(Reconciler::new(queue.clone(), dispatcher));
        let mut progress = reconciler.subscribe_progress();

        let first = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.drain().await.unwrap() }
        });
        progress.wait_for(|p| p.current_action.is_some()).await.unwrap();
        assert!(reconciler.is_draining());

        assert_eq!(reconciler.drain().await.unwrap(), DrainReport::AlreadyRunning);

        gate.notify_one();
        assert!(matches!(first.await.unwrap(), DrainReport::Completed(s) if s.applied == 1));
        assert!(!reconciler.is_draining());
    }

    #[tokio::test]
    async fn test_execute_queues_behind_pending() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);
        let g = Uuid::new_v4();
        let reconciler = Reconciler::new(
            queue.clone(),
            ScriptedDispatcher::with_script(vec![Err(ActionError::transient("down"))]),
        );

        assert!(matches!(
            reconciler.execute(Action::JoinGroup { group_id: g }).await.unwrap(),
            Execution::Queued(_)
        ));
        // The queue is non-empty, so this one waits without being sent.
        assert!(matches!(
            reconciler.execute(Action::send_message(g, "hi")).await.unwrap(),
            Execution::Queued(_)
        ));
        assert_eq!(reconciler.dispatcher().seen().len(), 1);
        assert_eq!(queue.pending().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_execute_returns_permanent_errors() {
        let dir = TempDir::new().unwrap();
        let reconciler = Reconciler::new(
            queue(&dir),
            ScriptedDispatcher::with_script(vec![Err(ActionError::unauthorized("admins only"))]),
        );
        let err = reconciler.execute(Action::LeaveGroup { group_id: Uuid::new_v4() }).await.unwrap_err();
        assert_eq!(err, ActionError::unauthorized("admins only"));
        assert!(reconciler.queue().pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_on_reconnect() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);
        queue.enqueue(Action::JoinGroup { group_id: Uuid::new_v4() }).unwrap();

        let reconciler = Arc::new(Reconciler::new(queue.clone(), ScriptedDispatcher::default()));
        let (network, rx) = watch::channel(false);
        let mut events = reconciler.subscribe_events();
        let task = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.run(rx).await }
        });

        network.send(true).unwrap();
        loop {
            if let ReconcilerEvent::Finished(summary) = events.recv().await.unwrap() {
                assert_eq!(summary.applied, 1);
                break;
            }
        }
        assert_eq!(queue.sync_stats().unwrap().pending_actions, 0);

        drop(network);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_local_dispatcher_replays_through_service() {
        let dir = TempDir::new().unwrap();
        let service = Arc::new(ActionService::with_store(Arc::new(MemoryStore::new())));
        let owner = Uuid::new_v4();
        let (group, _) = service.allocator().create_group(owner, "Café", "es").await.unwrap();

        let user = Uuid::new_v4();
        let queue = queue(&dir);
        queue.enqueue(Action::JoinGroup { group_id: group.id }).unwrap();
        let message = Action::send_message(group.id, "hola");
        queue.enqueue(message.clone()).unwrap();
        // Same client id twice: the second is a no-op success.
        queue.enqueue(message).unwrap();

        let reconciler = Reconciler::new(queue.clone(), LocalDispatcher::new(service.clone(), user));
        let report = reconciler.drain().await.unwrap();
        assert!(matches!(report, DrainReport::Completed(s) if s.applied == 3 && s.remaining == 0));
        assert_eq!(service.history(group.id, 10).await.unwrap().len(), 1);
    }
}
