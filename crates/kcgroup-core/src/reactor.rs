//! The reactor: the single-threaded loop that drains application events,
//! polls every request manager, drives reconciliation, and hands the
//! result to the network client. Nothing outside this module ever mutates
//! membership state directly.

use std::cell::RefCell;
use std::rc::Rc;

use kcgroup_types::GroupError;

use crate::background::{BackgroundEvent, BackgroundEventSink};
use crate::commit::CommitManager;
use crate::config::GroupConfig;
use crate::coordinator::CoordinatorManager;
use crate::events::ApplicationEvent;
use crate::heartbeat::HeartbeatManager;
use crate::membership::MembershipManager;
use crate::metadata::MetadataCache;
use crate::metrics::Metrics;
use crate::network::{NetworkClient, UnsentRequest};
use crate::offsets::OffsetsManager;
use crate::processor::ApplicationEventProcessor;
use crate::queue::{ApplicationEventQueue, ApplicationEventSender};
use crate::reaper::{CompletableFuture, Reaper};
use crate::reconcile::ReconciliationEngine;
use crate::request_manager::{PollResult, RequestManager};
use crate::subscription::SubscriptionState;

/// Everything a lazily-constructed request manager needs, handed to each
/// supplier the first time `run_once` is called.
pub struct ReactorContext {
    pub config: GroupConfig,
    pub now_ms: i64,
    pub membership: Rc<RefCell<MembershipManager>>,
    pub coordinator: Rc<RefCell<CoordinatorManager>>,
    pub subscription: Rc<RefCell<dyn SubscriptionState>>,
    pub reaper: Rc<RefCell<Reaper>>,
}

type ManagerSupplier = Box<dyn FnOnce(&ReactorContext) -> Box<dyn RequestManager>>;

/// Holds the handles the reactor needs typed access to, populated once the
/// built-in suppliers run on the first tick.
struct StartedState {
    commit: Rc<RefCell<CommitManager>>,
    processor: ApplicationEventProcessor,
    managers: Vec<Box<dyn RequestManager>>,
}

pub struct Reactor {
    context: ReactorContext,
    application_queue: ApplicationEventQueue,
    background: Rc<RefCell<dyn BackgroundEventSink>>,
    metadata: Rc<RefCell<dyn MetadataCache>>,
    network: Box<dyn NetworkClient>,
    metrics: Rc<dyn Metrics>,
    reconciliation: Rc<RefCell<ReconciliationEngine>>,
    offsets: Rc<RefCell<OffsetsManager>>,
    manager_suppliers: Vec<ManagerSupplier>,
    commit_slot: Option<Rc<RefCell<Option<Rc<RefCell<CommitManager>>>>>>,
    heartbeat_slot: Option<Rc<RefCell<Option<Rc<RefCell<HeartbeatManager>>>>>>,
    started: Option<StartedState>,
}

impl Reactor {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GroupConfig,
        now_ms: i64,
        background: Rc<RefCell<dyn BackgroundEventSink>>,
        metadata: Rc<RefCell<dyn MetadataCache>>,
        subscription: Rc<RefCell<dyn SubscriptionState>>,
        network: Box<dyn NetworkClient>,
        metrics: Rc<dyn Metrics>,
    ) -> Self {
        let reaper = Reaper::new();
        let membership = Rc::new(RefCell::new(MembershipManager::new(
            config.group_instance_id.clone(),
            Rc::clone(&reaper),
        )));
        let coordinator = Rc::new(RefCell::new(CoordinatorManager::new(
            config.group_id.clone(),
            config.request_timeout_ms,
            now_ms,
            Rc::clone(&reaper),
        )));
        let context = ReactorContext {
            config,
            now_ms,
            membership,
            coordinator,
            subscription,
            reaper,
        };

        let offsets = Rc::new(RefCell::new(OffsetsManager::new(
            Rc::clone(&context.coordinator),
            Rc::clone(&context.subscription),
            Rc::clone(&context.reaper),
        )));

        let mut reactor = Self {
            context,
            application_queue: ApplicationEventQueue::new(256),
            background,
            metadata,
            network,
            metrics,
            reconciliation: Rc::new(RefCell::new(ReconciliationEngine::new())),
            offsets,
            manager_suppliers: Vec::new(),
            commit_slot: None,
            heartbeat_slot: None,
            started: None,
        };
        reactor.register_builtin_suppliers();
        reactor
    }

    /// Registers a manager whose construction is deferred to the first
    /// `run_once`, so it sees the reactor's real start time rather than an
    /// arbitrary construction-time clock reading.
    pub fn register_manager_supplier(&mut self, supplier: ManagerSupplier) {
        self.manager_suppliers.push(supplier);
    }

    fn register_builtin_suppliers(&mut self) {
        let offsets = Rc::clone(&self.offsets);
        self.manager_suppliers.push(Box::new(move |_ctx: &ReactorContext| {
            Box::new(offsets) as Box<dyn RequestManager>
        }));

        self.manager_suppliers.push(Box::new(|ctx: &ReactorContext| {
            Box::new(Rc::clone(&ctx.coordinator)) as Box<dyn RequestManager>
        }));

        let commit_slot: Rc<RefCell<Option<Rc<RefCell<CommitManager>>>>> = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&commit_slot);
        self.manager_suppliers.push(Box::new(move |ctx: &ReactorContext| {
            let commit = Rc::new(RefCell::new(CommitManager::new(
                ctx.config.group_id.clone(),
                ctx.config.auto_commit_enabled,
                ctx.config.auto_commit_interval_ms,
                ctx.now_ms,
                Rc::clone(&ctx.membership),
                Rc::clone(&ctx.coordinator),
                Rc::clone(&ctx.reaper),
            )));
            *slot.borrow_mut() = Some(Rc::clone(&commit));
            Box::new(commit) as Box<dyn RequestManager>
        }));
        self.commit_slot = Some(commit_slot);

        let heartbeat_slot: Rc<RefCell<Option<Rc<RefCell<HeartbeatManager>>>>> = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&heartbeat_slot);
        self.manager_suppliers.push(Box::new(move |ctx: &ReactorContext| {
            let heartbeat = Rc::new(RefCell::new(HeartbeatManager::new(
                ctx.config.group_id.clone(),
                ctx.config.rebalance_timeout_ms,
                ctx.config.max_poll_interval_ms,
                ctx.config.request_timeout_ms,
                ctx.now_ms,
                Rc::clone(&ctx.membership),
                Rc::clone(&ctx.coordinator),
                Rc::clone(&ctx.subscription),
                Rc::clone(&ctx.reaper),
            )));
            *slot.borrow_mut() = Some(Rc::clone(&heartbeat));
            Box::new(heartbeat) as Box<dyn RequestManager>
        }));
        self.heartbeat_slot = Some(heartbeat_slot);
    }

    /// Clonable producer handle for the user-facing API thread.
    #[must_use]
    pub fn sender(&self) -> ApplicationEventSender {
        self.application_queue.sender()
    }

    pub fn register_state_listener(&mut self, listener: crate::membership::StateListener) {
        self.context.membership.borrow_mut().register_state_listener(listener);
    }

    /// Current membership lifecycle state. Read-only introspection for
    /// monitoring and tests; nothing in this crate drives behavior off a
    /// caller reading this.
    #[must_use]
    pub fn membership_state(&self) -> crate::membership::MembershipState {
        self.context.membership.borrow().state()
    }

    /// The assignment currently applied via the subscription state, i.e.
    /// what reconciliation has settled on as of the last completed tick.
    #[must_use]
    pub fn current_assignment(&self) -> kcgroup_types::Assignment {
        self.context.membership.borrow().current_assignment().clone()
    }

    #[must_use]
    pub fn member_id(&self) -> kcgroup_types::MemberId {
        self.context.membership.borrow().member_id().clone()
    }

    #[must_use]
    pub fn member_epoch(&self) -> kcgroup_types::MemberEpoch {
        self.context.membership.borrow().member_epoch()
    }

    fn ensure_started(&mut self, now_ms: i64) {
        if self.started.is_some() {
            return;
        }
        self.context.now_ms = now_ms;
        let suppliers = std::mem::take(&mut self.manager_suppliers);
        let mut managers = Vec::with_capacity(suppliers.len());
        for supplier in suppliers {
            managers.push(supplier(&self.context));
        }

        let commit = self
            .commit_slot
            .take()
            .and_then(|slot| slot.borrow_mut().take())
            .expect("commit supplier always populates its slot");
        let heartbeat = self
            .heartbeat_slot
            .take()
            .and_then(|slot| slot.borrow_mut().take())
            .expect("heartbeat supplier always populates its slot");

        let processor = ApplicationEventProcessor::new(
            Rc::clone(&self.context.membership),
            Rc::clone(&self.reconciliation),
            Rc::clone(&self.context.subscription),
            Rc::clone(&self.metadata),
            Rc::clone(&commit),
            Rc::clone(&heartbeat),
            Rc::clone(&self.offsets),
            Rc::clone(&self.context.coordinator),
            Rc::clone(&self.background),
            Rc::clone(&self.context.reaper),
        );

        self.started = Some(StartedState { commit, processor, managers });
    }

    /// Routes a reconciliation-driven callback to the background queue,
    /// touching only the fields the borrow checker can see are disjoint
    /// from a live `&mut StartedState` borrow.
    fn enqueue_background(
        background: &Rc<RefCell<dyn BackgroundEventSink>>,
        metrics: &Rc<dyn Metrics>,
        callback: Option<crate::background::CallbackRequest>,
    ) {
        if let Some(callback) = callback {
            let method = callback_method_name(&callback);
            metrics.record_callback_enqueued(method);
            background.borrow_mut().enqueue(BackgroundEvent::CallbackNeeded(callback));
        }
    }

    /// One full reactor tick. Returns the absolute time, in ms, at which the
    /// caller should invoke `run_once` again at the latest.
    pub fn run_once(&mut self, now_ms: i64) -> i64 {
        self.ensure_started(now_ms);
        let started = self.started.as_mut().expect("ensure_started just populated this");

        let mut events = Vec::new();
        self.application_queue.drain(&mut events);
        for event in events {
            tracing::debug!(kind = event.kind(), "dispatching application event");
            started.processor.dispatch(event, now_ms);
        }

        let mut unsent: Vec<UnsentRequest> = Vec::new();
        let mut next_wake_ms = i64::MAX;
        for manager in &mut started.managers {
            let result = manager.poll(now_ms);
            if let Some(wake) = result.next_wake_ms {
                next_wake_ms = next_wake_ms.min(wake);
            }
            unsent.extend(result.unsent);
        }

        let callback = {
            let mut membership = self.context.membership.borrow_mut();
            let metadata = self.metadata.borrow();
            let mut commit = started.commit.borrow_mut();
            self.reconciliation.borrow_mut().poll(
                &mut membership,
                &self.context.subscription,
                &*metadata,
                &mut commit,
                now_ms,
            )
        };
        Self::enqueue_background(&self.background, &self.metrics, callback);

        let lifecycle_callback = self.context.membership.borrow_mut().take_pending_callback();
        Self::enqueue_background(&self.background, &self.metrics, lifecycle_callback);

        started.processor.poll();
        unsent.extend(started.processor.drain_outbound());

        self.metrics.record_unsent_requests(unsent.len());
        self.network.send_all(unsent);

        let outer_timeout_ms = if next_wake_ms == i64::MAX {
            self.context.config.heartbeat_interval_ms
        } else {
            (next_wake_ms - now_ms).max(0)
        };
        self.network.poll(outer_timeout_ms, now_ms);

        self.context.reaper.borrow_mut().reap(now_ms);
        self.metrics.record_tracked_completables(self.context.reaper.borrow().tracked_count());

        now_ms + outer_timeout_ms
    }

    /// Triggers shutdown: one final drain cycle, then cancels every
    /// outstanding completable event.
    pub fn close(&mut self, now_ms: i64) {
        self.run_once(now_ms);
        self.context.reaper.borrow_mut().reap_all();
    }
}

fn callback_method_name(callback: &crate::background::CallbackRequest) -> &'static str {
    use crate::subscription::RebalanceMethod;
    match callback.method {
        RebalanceMethod::OnPartitionsRevoked => "on_partitions_revoked",
        RebalanceMethod::OnPartitionsAssigned => "on_partitions_assigned",
        RebalanceMethod::OnPartitionsLost => "on_partitions_lost",
    }
}

/// Convenience blocking read for user-thread callers awaiting a future
/// produced by an enqueued application event.
pub async fn poll_future<T>(future: CompletableFuture<T>) -> Result<T, GroupError> {
    future.wait().await
}
