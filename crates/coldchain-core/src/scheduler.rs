//! Drives per-tenant collection from a single loop over a min-heap of
//! next-fire instants. Each due job runs in its own task.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::job::IngestionJob;
use crate::registry::{RegistryError, TenantRegistry};
use crate::types::{SharingMethod, TenantId, TenantSource};

enum Command {
    Reschedule(TenantSource),
    Remove(TenantId),
    Scheduled(oneshot::Sender<Vec<ScheduledTenant>>),
    Shutdown,
}

/// A tenant's position in the schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTenant {
    pub tenant_id: TenantId,
    pub code: String,
    pub interval: Duration,
    pub running: bool,
}

struct Entry {
    tenant: TenantSource,
    interval: Duration,
    /// Bumped on every reschedule; heap slots from older generations are stale.
    generation: u64,
    running: Arc<AtomicBool>,
}

/// `(fire_at, seq, tenant, generation)`; `seq` keeps ordering total.
type Slot = Reverse<(Instant, u64, TenantId, u64)>;

pub struct Scheduler {
    registry: Arc<dyn TenantRegistry>,
    job: Arc<IngestionJob>,
    config: SchedulerConfig,
}

/// Control surface of a running scheduler.
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Replaces a tenant's timer; the new one fires immediately.
    pub fn reschedule(&self, tenant: TenantSource) {
        let _ = self.commands.send(Command::Reschedule(tenant));
    }

    pub fn remove(&self, tenant_id: TenantId) {
        let _ = self.commands.send(Command::Remove(tenant_id));
    }

    pub async fn scheduled(&self) -> Vec<ScheduledTenant> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Scheduled(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Cancels every timer and waits for in-flight jobs to finish.
    pub async fn stop(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(err) = self.task.await {
            error!(error = %err, "scheduler task ended abnormally");
        }
    }
}

impl Scheduler {
    pub fn new(registry: Arc<dyn TenantRegistry>, job: Arc<IngestionJob>, config: SchedulerConfig) -> Self {
        Self {
            registry,
            job,
            config,
        }
    }

    /// Loads active tenants and starts the loop. Every tenant fires once
    /// right away and then at its polling interval.
    pub async fn start(self) -> Result<SchedulerHandle, RegistryError> {
        let tenants = self.registry.active_tenants().await?;
        let (commands, rx) = mpsc::unbounded_channel();

        let mut state = LoopState {
            registry: self.registry,
            job: self.job,
            config: self.config,
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
            seq: 0,
            jobs: JoinSet::new(),
        };
        for tenant in tenants {
            state.upsert(tenant);
        }
        info!(tenants = state.entries.len(), "scheduler started");

        let task = tokio::spawn(state.run(rx));
        Ok(SchedulerHandle { commands, task })
    }
}

struct LoopState {
    registry: Arc<dyn TenantRegistry>,
    job: Arc<IngestionJob>,
    config: SchedulerConfig,
    entries: HashMap<TenantId, Entry>,
    heap: BinaryHeap<Slot>,
    seq: u64,
    jobs: JoinSet<()>,
}

impl LoopState {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let refresh_every = self.config.registry_refresh();
        let mut refresh = tokio::time::interval(refresh_every.unwrap_or(Duration::from_secs(3600)));
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; tenants were just loaded.
        refresh.tick().await;

        loop {
            let next_due = self.heap.peek().map(|Reverse((at, ..))| *at);
            let sleep = async move {
                match next_due {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Reschedule(tenant)) => {
                        self.job.processor().invalidate(tenant.id);
                        self.upsert(tenant);
                    }
                    Some(Command::Remove(tenant_id)) => self.remove(tenant_id),
                    Some(Command::Scheduled(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(joined) = self.jobs.join_next(), if !self.jobs.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "ingestion job panicked");
                    }
                }
                _ = sleep => self.fire_due(),
                _ = refresh.tick(), if refresh_every.is_some() => self.refresh().await,
            }
        }

        self.heap.clear();
        let in_flight = self.jobs.len();
        if in_flight > 0 {
            info!(in_flight, "waiting for running ingestion jobs");
        }
        while let Some(joined) = self.jobs.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "ingestion job panicked");
            }
        }
        info!("scheduler stopped");
    }

    fn push_slot(&mut self, at: Instant, tenant_id: TenantId, generation: u64) {
        self.seq += 1;
        self.heap.push(Reverse((at, self.seq, tenant_id, generation)));
    }

    /// Adds or replaces a tenant's timer, firing immediately.
    fn upsert(&mut self, tenant: TenantSource) {
        if let SharingMethod::Unsupported(method) = &tenant.sharing_method {
            warn!(tenant = %tenant.code, method = %method, "unsupported sharing method, not scheduling");
            self.entries.remove(&tenant.id);
            return;
        }

        let interval = tenant.polling_interval(self.config.min_interval_secs);
        let tenant_id = tenant.id;
        let (generation, running) = match self.entries.get(&tenant_id) {
            Some(existing) => (existing.generation + 1, Arc::clone(&existing.running)),
            None => (0, Arc::new(AtomicBool::new(false))),
        };
        info!(
            tenant = %tenant.code,
            method = %tenant.sharing_method,
            interval_secs = interval.as_secs(),
            "scheduled tenant"
        );
        self.entries.insert(
            tenant_id,
            Entry {
                tenant,
                interval,
                generation,
                running,
            },
        );
        self.push_slot(Instant::now(), tenant_id, generation);
    }

    fn remove(&mut self, tenant_id: TenantId) {
        if let Some(entry) = self.entries.remove(&tenant_id) {
            info!(tenant = %entry.tenant.code, "unscheduled tenant");
        }
        self.job.processor().invalidate(tenant_id);
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((at, _, tenant_id, generation))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();

            let Some(entry) = self.entries.get(&tenant_id) else {
                continue;
            };
            if entry.generation != generation {
                continue;
            }

            // Fixed rate; ticks missed while the loop was held up are dropped.
            let mut next = at + entry.interval;
            while next <= now {
                next += entry.interval;
            }
            let interval = entry.interval;

            if entry
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                let tenant = entry.tenant.clone();
                let running = Arc::clone(&entry.running);
                let job = Arc::clone(&self.job);
                debug!(tenant = %tenant.code, "starting ingestion job");
                self.jobs.spawn(async move {
                    let _guard = RunningGuard(running);
                    job.run(&tenant).await;
                });
            } else {
                warn!(
                    tenant = %entry.tenant.code,
                    interval_secs = interval.as_secs(),
                    "previous run still in progress, skipping tick"
                );
            }

            self.push_slot(next, tenant_id, generation);
        }
    }

    async fn refresh(&mut self) {
        let tenants = match self.registry.active_tenants().await {
            Ok(tenants) => tenants,
            Err(err) => {
                error!(error = %err, "registry refresh failed, keeping current schedule");
                return;
            }
        };

        let active: HashMap<TenantId, TenantSource> =
            tenants.into_iter().map(|tenant| (tenant.id, tenant)).collect();

        let gone: Vec<TenantId> = self
            .entries
            .keys()
            .filter(|id| !active.contains_key(id))
            .copied()
            .collect();
        for tenant_id in gone {
            self.remove(tenant_id);
        }

        for (tenant_id, tenant) in active {
            match self.entries.get(&tenant_id) {
                Some(entry) if !entry.tenant.schedule_differs(&tenant) => {}
                Some(_) => {
                    self.job.processor().invalidate(tenant_id);
                    self.upsert(tenant);
                }
                None => self.upsert(tenant),
            }
        }
    }

    fn snapshot(&self) -> Vec<ScheduledTenant> {
        let mut scheduled: Vec<ScheduledTenant> = self
            .entries
            .values()
            .map(|entry| ScheduledTenant {
                tenant_id: entry.tenant.id,
                code: entry.tenant.code.clone(),
                interval: entry.interval,
                running: entry.running.load(Ordering::Relaxed),
            })
            .collect();
        scheduled.sort_by(|a, b| a.code.cmp(&b.code));
        scheduled
    }
}

/// Clears a tenant's running flag when its job ends, panics included.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
