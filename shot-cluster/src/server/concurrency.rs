//! Concurrency tokens.
//!
//! A grant takes `acquire` slots from its flow's in-flight counter and
//! returns a lease. The lease is armed in a timing wheel; an explicit release
//! disarms it, expiry releases it by force.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use shot_guard::ClusterTokenResult;
use shot_guard::TokenStatus;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;
use tracing::debug;
use tracing::warn;

use crate::ClusterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lease {
    flow_id: i64,
    acquire: u64,
}

#[derive(Debug)]
struct LeaseTable {
    in_flight: DashMap<i64, Arc<AtomicU64>>,
    leases: DashMap<u64, Lease>,
    next_token: AtomicU64,
}

impl LeaseTable {
    /// Removes the lease and returns its slots. Only one caller wins.
    fn release(&self, token_id: u64) -> Option<Lease> {
        let (_, lease) = self.leases.remove(&token_id)?;
        if let Some(count) = self.in_flight.get(&lease.flow_id) {
            let _ = count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(lease.acquire))
            });
        }
        Some(lease)
    }
}

#[derive(Debug)]
enum TimerCommand {
    Arm { token_id: u64, timeout: Duration },
    Disarm { token_id: u64 },
}

#[derive(Debug)]
pub(crate) struct ConcurrencyManager {
    table: Arc<LeaseTable>,
    timer: mpsc::UnboundedSender<TimerCommand>,
}

impl ConcurrencyManager {
    /// Spawns the lease timer on the current Tokio runtime.
    pub(crate) fn new() -> Result<Self, ClusterError> {
        let handle = Handle::try_current().map_err(|_| ClusterError::NoRuntime)?;
        let table = Arc::new(LeaseTable {
            in_flight: DashMap::new(),
            leases: DashMap::new(),
            next_token: AtomicU64::new(1),
        });
        let (timer, commands) = mpsc::unbounded_channel();
        handle.spawn(run_timer(Arc::downgrade(&table), commands));
        Ok(Self { table, timer })
    }

    pub(crate) fn acquire(
        &self,
        flow_id: i64,
        acquire: u64,
        threshold: f64,
        lease: Duration,
    ) -> ClusterTokenResult {
        let count = Arc::clone(self.table.in_flight.entry(flow_id).or_default().value());
        let granted = count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            let next = n.saturating_add(acquire);
            (next as f64 <= threshold).then_some(next)
        });
        let held = match granted {
            Ok(previous) => previous + acquire,
            Err(current) => {
                return ClusterTokenResult::new(TokenStatus::Blocked)
                    .with_remaining(remaining(threshold, current));
            }
        };

        let token_id = self.table.next_token.fetch_add(1, Ordering::Relaxed);
        self.table.leases.insert(token_id, Lease { flow_id, acquire });
        if self
            .timer
            .send(TimerCommand::Arm {
                token_id,
                timeout: lease,
            })
            .is_err()
        {
            warn!(token_id, flow_id, "lease timer is gone; token will not expire");
        }
        ClusterTokenResult::new(TokenStatus::Ok)
            .with_token_id(token_id)
            .with_remaining(remaining(threshold, held))
    }

    pub(crate) fn release(&self, token_id: u64) -> ClusterTokenResult {
        match self.table.release(token_id) {
            Some(_) => {
                let _ = self.timer.send(TimerCommand::Disarm { token_id });
                ClusterTokenResult::new(TokenStatus::ReleaseOk)
            }
            None => ClusterTokenResult::new(TokenStatus::AlreadyReleased),
        }
    }

    pub(crate) fn in_flight(&self, flow_id: i64) -> u64 {
        self.table
            .in_flight
            .get(&flow_id)
            .map(|n| n.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub(crate) fn lease_count(&self) -> usize {
        self.table.leases.len()
    }
}

fn remaining(threshold: f64, held: u64) -> i32 {
    (threshold - held as f64).max(0.0) as i32
}

async fn run_timer(table: Weak<LeaseTable>, mut commands: mpsc::UnboundedReceiver<TimerCommand>) {
    let mut wheel: DelayQueue<u64> = DelayQueue::new();
    let mut keys: HashMap<u64, Key> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(TimerCommand::Arm { token_id, timeout }) => {
                    keys.insert(token_id, wheel.insert(token_id, timeout));
                }
                Some(TimerCommand::Disarm { token_id }) => {
                    if let Some(key) = keys.remove(&token_id) {
                        let _ = wheel.try_remove(&key);
                    }
                }
                None => break,
            },
            Some(expired) = wheel.next(), if !wheel.is_empty() => {
                let token_id = expired.into_inner();
                keys.remove(&token_id);
                let Some(table) = table.upgrade() else {
                    break;
                };
                if let Some(lease) = table.release(token_id) {
                    warn!(
                        token_id,
                        flow_id = lease.flow_id,
                        acquire = lease.acquire,
                        "concurrency token expired; released"
                    );
                }
            }
        }
    }
    debug!("lease timer stopped");
}
