//! Per-entity periodic callback scheduler.
//!
//! # Responsibilities
//! - Run an async callback for each scheduled entity on its own period
//! - Change one entity's period without touching the others
//! - Run recurring or once per scheduling
//! - Unschedule with a guarantee that no callback runs after it returns
//!
//! # Design Decisions
//! - One task per entity, tracked in a `DashMap` keyed by entity key
//! - Stop = cancel the entity's token, then await its task; a callback that
//!   is executing is dropped at its next await point
//! - Tasks hold only a weak reference back to the scheduler
//! - A run-once entity that has started firing can be scheduled again; the
//!   firing task is kept with the new entry until it finishes

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{join_all, BoxFuture};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Async callback invoked with the scheduled entity.
pub type EntityAction<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct ScheduledEntity<T> {
    entity: T,
    period: watch::Sender<Duration>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    generation: u64,
    /// Set once a run-once entity starts its action.
    fired: Arc<AtomicBool>,
    /// Tasks of earlier run-once entries replaced while firing.
    previous: Vec<(CancellationToken, JoinHandle<()>)>,
}

impl<T> ScheduledEntity<T> {
    fn cancel_tasks(&self) {
        self.cancel.cancel();
        for (cancel, _) in &self.previous {
            cancel.cancel();
        }
    }

    async fn join(self) {
        let _ = self.handle.await;
        for (_, handle) in self.previous {
            let _ = handle.await;
        }
    }
}

struct Inner<T> {
    action: EntityAction<T>,
    run_once: bool,
    started: watch::Sender<bool>,
    stopped: AtomicBool,
    generation: AtomicU64,
    entries: DashMap<String, ScheduledEntity<T>>,
}

/// Schedules an async action per entity.
pub struct EntityActionScheduler<T> {
    inner: Arc<Inner<T>>,
}

impl<T> EntityActionScheduler<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a scheduler. With `auto_start` false, timers only begin after [`start`](Self::start).
    pub fn new(action: EntityAction<T>, auto_start: bool, run_once: bool) -> Self {
        let (started, _) = watch::channel(auto_start);
        Self {
            inner: Arc::new(Inner {
                action,
                run_once,
                started,
                stopped: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                entries: DashMap::new(),
            }),
        }
    }

    /// Start timers of all scheduled entities. No-op if already started.
    pub fn start(&self) {
        self.inner.started.send_replace(true);
    }

    /// Schedule `entity` under `key`. Returns false if the key is already
    /// scheduled or the scheduler was stopped. A run-once entity whose action
    /// has already started does not block a new schedule.
    pub fn schedule_entity(&self, key: &str, entity: T, period: Duration) -> bool {
        if self.inner.stopped.load(Ordering::Acquire) {
            return false;
        }

        match self.inner.entries.entry(key.to_string()) {
            Entry::Occupied(slot) if !slot.get().fired.load(Ordering::Acquire) => false,
            Entry::Occupied(mut slot) => {
                let replaced = slot.insert(self.spawn_entity(key, entity, period));
                let mut previous = replaced.previous;
                previous.retain(|(_, handle)| !handle.is_finished());
                previous.push((replaced.cancel, replaced.handle));
                slot.get_mut().previous = previous;
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(self.spawn_entity(key, entity, period));
                true
            }
        }
    }

    fn spawn_entity(&self, key: &str, entity: T, period: Duration) -> ScheduledEntity<T> {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let (period_tx, period_rx) = watch::channel(period);
        let cancel = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_entity(
            Arc::downgrade(&self.inner),
            key.to_string(),
            entity.clone(),
            period_rx,
            self.inner.started.subscribe(),
            cancel.clone(),
            generation,
            fired.clone(),
        ));
        ScheduledEntity {
            entity,
            period: period_tx,
            cancel,
            handle,
            generation,
            fired,
            previous: Vec::new(),
        }
    }

    /// Change the period of one entity. The next invocation is due one new
    /// period from now.
    pub fn change_period(&self, key: &str, period: Duration) -> bool {
        match self.inner.entries.get(key) {
            Some(scheduled) => {
                scheduled.period.send_replace(period);
                true
            }
            None => false,
        }
    }

    /// Remove an entity and wait until its task has finished. No callback
    /// for it runs after this returns.
    pub async fn unschedule_entity(&self, key: &str) -> bool {
        let Some((_, scheduled)) = self.inner.entries.remove(key) else {
            return false;
        };
        scheduled.cancel_tasks();
        scheduled.join().await;
        true
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// The entity scheduled under `key`.
    pub fn get(&self, key: &str) -> Option<T> {
        self.inner.entries.get(key).map(|s| s.entity.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Unschedule everything and refuse new entities. Idempotent.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);

        let keys = self.keys();
        let removed: Vec<_> = keys
            .iter()
            .filter_map(|key| self.inner.entries.remove(key))
            .map(|(_, scheduled)| scheduled)
            .collect();
        for scheduled in &removed {
            scheduled.cancel_tasks();
        }
        join_all(removed.into_iter().map(ScheduledEntity::join)).await;
    }
}

impl<T> Drop for EntityActionScheduler<T> {
    fn drop(&mut self) {
        for entry in self.inner.entries.iter() {
            entry.cancel_tasks();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_entity<T>(
    inner: Weak<Inner<T>>,
    key: String,
    entity: T,
    mut period: watch::Receiver<Duration>,
    mut started: watch::Receiver<bool>,
    cancel: CancellationToken,
    generation: u64,
    fired: Arc<AtomicBool>,
) where
    T: Clone + Send + Sync + 'static,
{
    let Some(action) = inner.upgrade().map(|i| i.action.clone()) else {
        return;
    };
    let run_once = inner.upgrade().is_some_and(|i| i.run_once);

    tokio::select! {
        _ = cancel.cancelled() => return,
        ready = started.wait_for(|s| *s) => {
            if ready.is_err() {
                return;
            }
        }
    }

    let mut deadline = Instant::now() + *period.borrow_and_update();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            changed = period.changed() => {
                if changed.is_err() {
                    return;
                }
                deadline = Instant::now() + *period.borrow_and_update();
            }
            _ = tokio::time::sleep_until(deadline) => {
                if run_once {
                    fired.store(true, Ordering::Release);
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = action(entity.clone()) => {}
                }

                if run_once {
                    if let Some(inner) = inner.upgrade() {
                        inner.entries.remove_if(&key, |_, s| s.generation == generation);
                    }
                    return;
                }
                deadline = Instant::now() + *period.borrow();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_action(counter: Arc<AtomicUsize>) -> EntityAction<String> {
        Arc::new(move |_entity: String| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_invocations() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = EntityActionScheduler::new(counting_action(counter.clone()), true, false);
        assert!(scheduler.schedule_entity("a", "a".to_string(), Duration::from_millis(100)));
        assert!(!scheduler.schedule_entity("a", "a".to_string(), Duration::from_millis(100)));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_removes_entity() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = EntityActionScheduler::new(counting_action(counter.clone()), true, true);
        scheduler.schedule_entity("a", "a".to_string(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled("a"));

        // Can be scheduled again once it has fired
        assert!(scheduler.schedule_entity("a", "a".to_string(), Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_reschedule_while_firing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());
        let action: EntityAction<String> = {
            let counter = counter.clone();
            let gate = gate.clone();
            Arc::new(move |_entity: String| {
                let counter = counter.clone();
                let gate = gate.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                })
            })
        };
        let scheduler = EntityActionScheduler::new(action, true, true);
        assert!(scheduler.schedule_entity("a", "a".to_string(), Duration::from_millis(100)));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(scheduler.schedule_entity("a", "a".to_string(), Duration::from_millis(100)));

        // The first action finishing must not drop the new entry
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.is_scheduled("a"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(scheduler.unschedule_entity("a").await);
        assert!(!scheduler.is_scheduled("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_start() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = EntityActionScheduler::new(counting_action(counter.clone()), false, false);
        scheduler.schedule_entity("a", "a".to_string(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_period_affects_only_that_entity() {
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let counters = (a.clone(), b.clone());
        let action: EntityAction<String> = Arc::new(move |entity: String| {
            let counter = if entity == "a" { counters.0.clone() } else { counters.1.clone() };
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        let scheduler = EntityActionScheduler::new(action, true, false);
        scheduler.schedule_entity("a", "a".to_string(), Duration::from_millis(100));
        scheduler.schedule_entity("b", "b".to_string(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.change_period("a", Duration::from_millis(1000)));
        assert!(!scheduler.change_period("missing", Duration::from_millis(1)));

        tokio::time::sleep(Duration::from_millis(960)).await;
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 10);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.load(Ordering::SeqCst), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_unschedule_during_running_callback() {
        let started = Arc::new(tokio::sync::Notify::new());
        let invocations = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let action: EntityAction<String> = {
            let (started, invocations, completed) = (started.clone(), invocations.clone(), completed.clone());
            Arc::new(move |_entity: String| {
                let (started, invocations, completed) = (started.clone(), invocations.clone(), completed.clone());
                Box::pin(async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    started.notify_one();
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                })
            })
        };

        let scheduler = EntityActionScheduler::new(action, true, false);
        scheduler.schedule_entity("a", "a".to_string(), Duration::from_millis(10));

        started.notified().await;
        assert!(scheduler.unschedule_entity("a").await);
        let after_unschedule = invocations.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), after_unschedule);
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_scheduled("a"));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_blocks_new_entities() {
        let scheduler = EntityActionScheduler::new(counting_action(Arc::new(AtomicUsize::new(0))), true, false);
        scheduler.stop().await;
        scheduler.stop().await;
        assert!(!scheduler.schedule_entity("a", "a".to_string(), Duration::from_millis(10)));
    }
}
