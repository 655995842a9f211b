//! Background execution poller

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EventCallback, ExecutionFeed, SubscriptionId};
use crate::error::{Error, Result};
use crate::models::{Event, Execution};

/// Position of an execution in an agent's history
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Cursor {
    started_at: DateTime<Utc>,
    id: String,
}

impl Cursor {
    fn of(execution: &Execution) -> Self {
        Self {
            started_at: execution.started_at,
            id: execution.id.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct AgentCursor {
    last_seen: Option<Cursor>,
    /// Executions seen while still running, awaiting completion
    in_flight: HashMap<String, Cursor>,
}

struct Subscription {
    callback: EventCallback,
    seeded: bool,
    agents: HashMap<String, AgentCursor>,
}

impl Subscription {
    fn new(callback: EventCallback) -> Self {
        Self {
            callback,
            seeded: false,
            agents: HashMap::new(),
        }
    }

    /// Diff one page against this subscription's cursors and advance them.
    ///
    /// `page` maps agent id to executions in ascending cursor order.
    fn observe(&mut self, page: &BTreeMap<String, Vec<Execution>>) -> Vec<Event> {
        let mut events = Vec::new();

        for (agent_id, executions) in page {
            let cursor = self.agents.entry(agent_id.clone()).or_default();

            for execution in executions {
                let key = Cursor::of(execution);
                let unseen = cursor.last_seen.as_ref().is_none_or(|seen| key > *seen);

                if unseen {
                    if !execution.status.is_finished() {
                        cursor.in_flight.insert(execution.id.clone(), key.clone());
                    } else if self.seeded {
                        events.push(Event::from_execution(execution));
                    }
                    cursor.last_seen = Some(key);
                } else if execution.status.is_finished()
                    && cursor.in_flight.remove(&execution.id).is_some()
                {
                    events.push(Event::from_execution(execution));
                }
            }

            // Anything older than the page window can no longer be observed
            if let Some(oldest) = executions.first().map(Cursor::of) {
                cursor.in_flight.retain(|_, key| *key >= oldest);
            }
        }

        self.seeded = true;
        events.sort_by_key(|event| event.timestamp);
        events
    }
}

struct PollerShared {
    name: String,
    feed: Arc<dyn ExecutionFeed>,
    page_size: u32,
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
}

impl PollerShared {
    fn subscriptions(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn poll(&self) -> Result<usize> {
        if self.subscriptions().is_empty() {
            return Ok(0);
        }

        let executions = self.feed.recent_executions(self.page_size).await?;
        let page = group_by_agent(executions);

        // Diff and cursor advance are atomic; callbacks run after the lock is released
        let deliveries: Vec<(EventCallback, Vec<Event>)> = self
            .subscriptions()
            .values_mut()
            .map(|sub| (Arc::clone(&sub.callback), sub.observe(&page)))
            .filter(|(_, events)| !events.is_empty())
            .collect();

        let mut delivered = 0;
        for (callback, events) in deliveries {
            for event in &events {
                self.deliver(&callback, event);
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    fn deliver(&self, callback: &EventCallback, event: &Event) {
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            error!(
                poller = %self.name,
                agent = %event.agent_id,
                "Event callback panicked; continuing with remaining subscribers"
            );
        }
    }
}

fn group_by_agent(executions: Vec<Execution>) -> BTreeMap<String, Vec<Execution>> {
    let mut page: BTreeMap<String, BTreeMap<Cursor, Execution>> = BTreeMap::new();
    for execution in executions {
        page.entry(execution.agent_id.clone())
            .or_default()
            .insert(Cursor::of(&execution), execution);
    }
    page.into_iter()
        .map(|(agent, ordered)| (agent, ordered.into_values().collect()))
        .collect()
}

struct PollerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One repeating poll task per adapter, shared by every subscriber
pub struct EventPoller {
    shared: Arc<PollerShared>,
    interval: Duration,
    task: Mutex<Option<PollerTask>>,
}

impl std::fmt::Debug for EventPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPoller")
            .field("name", &self.shared.name)
            .field("interval", &self.interval)
            .field("subscribers", &self.subscriber_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl EventPoller {
    pub fn new(
        name: impl Into<String>,
        feed: Arc<dyn ExecutionFeed>,
        interval: Duration,
        page_size: u32,
    ) -> Self {
        Self {
            shared: Arc::new(PollerShared {
                name: name.into(),
                feed,
                page_size: page_size.max(1),
                subscriptions: Mutex::new(HashMap::new()),
            }),
            interval: interval.max(Duration::from_millis(1)),
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<PollerTask>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a callback; the first subscriber starts the poll task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, callback: EventCallback) -> Result<SubscriptionId> {
        let runtime = Handle::try_current().map_err(|_| {
            Error::Configuration("Event polling requires a Tokio runtime".to_string())
        })?;

        let mut task = self.task();
        let id = SubscriptionId::new();
        self.shared
            .subscriptions()
            .insert(id, Subscription::new(callback));

        if task.as_ref().is_none_or(|running| running.handle.is_finished()) {
            *task = Some(self.spawn(&runtime));
            info!(poller = %self.shared.name, interval_ms = self.interval.as_millis() as u64, "Event poller started");
        }
        debug!(poller = %self.shared.name, subscription = %id, "Subscribed");
        Ok(id)
    }

    /// Remove a subscription; the last removal stops the poll task
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut task = self.task();
        let (removed, empty) = {
            let mut subs = self.shared.subscriptions();
            (subs.remove(&id).is_some(), subs.is_empty())
        };

        if empty {
            Self::stop(&self.shared.name, &mut task);
        }
        removed
    }

    /// Drop every subscription and stop the task. Idempotent.
    pub fn shutdown(&self) {
        let mut task = self.task();
        self.shared.subscriptions().clear();
        Self::stop(&self.shared.name, &mut task);
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscriptions().len()
    }

    pub fn is_running(&self) -> bool {
        self.task()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Run one poll immediately, returning the number of events delivered
    pub async fn poll_once(&self) -> Result<usize> {
        self.shared.poll().await
    }

    /// Deliver an out-of-band event to every subscriber
    pub fn emit(&self, event: &Event) {
        let callbacks: Vec<EventCallback> = self
            .shared
            .subscriptions()
            .values()
            .map(|sub| Arc::clone(&sub.callback))
            .collect();
        for callback in &callbacks {
            self.shared.deliver(callback, event);
        }
    }

    fn spawn(&self, runtime: &Handle) -> PollerTask {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            result = AssertUnwindSafe(shared.poll()).catch_unwind() => match result {
                                Ok(Ok(0)) => {}
                                Ok(Ok(delivered)) => debug!(poller = %shared.name, delivered, "Poll delivered events"),
                                Ok(Err(e)) => warn!(poller = %shared.name, error = %e, "Poll tick failed"),
                                Err(_) => error!(poller = %shared.name, "Poll tick panicked; continuing on next interval"),
                            },
                        }
                    }
                }
            }
            debug!(poller = %shared.name, "Poll loop exited");
        });

        PollerTask { cancel, handle }
    }

    fn stop(name: &str, task: &mut Option<PollerTask>) {
        if let Some(task) = task.take() {
            task.cancel.cancel();
            task.handle.abort();
            info!(poller = %name, "Event poller stopped");
        }
    }
}

impl Drop for EventPoller {
    fn drop(&mut self) {
        let mut task = self.task();
        Self::stop(&self.shared.name, &mut task);
    }
}
