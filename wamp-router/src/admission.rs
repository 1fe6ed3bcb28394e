//! Connection admission: soft/hard limits, stale eviction, per-connection
//! activity tracking and the accept-backoff engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff as _;
use parking_lot::Mutex;
use tap::Pipe as _;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::{AcceptBackoff, ServerOptions};
use crate::task::{ShutdownSignal, Task};
use crate::transport::TransportErrorKind;

pub(crate) type ConnId = u64;

/// A kill order delivered to a connection task.
#[derive(Clone, Debug)]
pub(crate) struct Kill {
    pub kind: TransportErrorKind,
    pub message: String,
}

/// One-shot kill signal shared between the monitor and a connection task.
#[derive(Debug, Default)]
pub(crate) struct KillSwitch {
    reason: Mutex<Option<Kill>>,
    notify: Notify,
}

impl KillSwitch {
    pub(crate) fn kill(&self, kind: TransportErrorKind, message: impl Into<String>) {
        let mut reason = self.reason.lock();
        if reason.is_none() {
            *reason = Some(Kill {
                kind,
                message: message.into(),
            });
        }
        drop(reason);
        self.notify.notify_waiters();
    }

    /// Resolves with the kill order once one is issued.
    pub(crate) async fn killed(&self) -> Kill {
        loop {
            let notified = self.notify.notified();
            if let Some(kill) = self.reason.lock().clone() {
                return kill;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
pub(crate) struct ConnectionRecord {
    pub id: ConnId,
    pub established_at: Instant,
    last_activity: Mutex<Instant>,
    pub kill: Arc<KillSwitch>,
}

impl ConnectionRecord {
    /// Called on every inbound WAMP message.
    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }
}

/// Admission verdict for a freshly accepted transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    Accept,
    /// Admitted over the soft limit; a stale session eviction has been
    /// scheduled in the background.
    AcceptOverSoft,
    /// At or above the hard limit; refuse at handshake time.
    Shed,
}

struct AdmitterState {
    connections: HashMap<ConnId, Arc<ConnectionRecord>>,
    /// Evictions requested by over-soft admissions, performed by the
    /// monitor pass.
    pending_evictions: usize,
}

/// Shared connection table of one server.
pub(crate) struct ConnectionAdmitter {
    state: Mutex<AdmitterState>,
    next_id: AtomicU64,
    soft_limit: usize,
    hard_limit: usize,
    stale_timeout: Duration,
    overstay_timeout: Option<Duration>,
}

impl ConnectionAdmitter {
    pub(crate) fn new(options: &ServerOptions) -> Arc<Self> {
        ConnectionAdmitter {
            state: Mutex::new(AdmitterState {
                connections: HashMap::new(),
                pending_evictions: 0,
            }),
            next_id: AtomicU64::new(1),
            soft_limit: options.soft_connection_limit,
            hard_limit: options.hard_connection_limit,
            stale_timeout: options.stale_timeout,
            overstay_timeout: options.overstay_timeout,
        }
        .pipe(Arc::new)
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Classifies a new transport against the limits, scheduling an
    /// eviction when the soft limit is crossed.
    pub(crate) fn admit(&self) -> Admission {
        let mut state = self.state.lock();
        let count = state.connections.len();
        if count >= self.hard_limit {
            Admission::Shed
        } else if count >= self.soft_limit {
            state.pending_evictions += 1;
            Admission::AcceptOverSoft
        } else {
            Admission::Accept
        }
    }

    /// Registers an admitted connection; the guard deregisters on drop.
    pub(crate) fn register(self: &Arc<Self>) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let record = Arc::new(ConnectionRecord {
            id,
            established_at: now,
            last_activity: Mutex::new(now),
            kill: Arc::new(KillSwitch::default()),
        });
        self.state.lock().connections.insert(id, Arc::clone(&record));
        ConnectionGuard {
            admitter: Arc::clone(self),
            record,
        }
    }

    fn deregister(&self, id: ConnId) {
        self.state.lock().connections.remove(&id);
    }

    /// One monitor pass: stale/overstay enforcement plus scheduled
    /// soft-limit evictions.
    fn enforce_deadlines(&self) {
        let now = Instant::now();
        let mut stalest: Option<(Arc<ConnectionRecord>, Duration)> = None;

        let (records, mut evictions) = {
            let mut state = self.state.lock();
            let records: Vec<Arc<ConnectionRecord>> = state.connections.values().map(Arc::clone).collect();
            let evictions = state.pending_evictions;
            state.pending_evictions = 0;
            (records, evictions)
        };

        for record in &records {
            let idle = record.idle_for(now);
            if idle > self.stale_timeout {
                record.kill.kill(
                    TransportErrorKind::SilenceTimeout,
                    "connection exceeded the stale timeout",
                );
                continue;
            }

            if let Some(overstay) = self.overstay_timeout {
                if now.saturating_duration_since(record.established_at) > overstay {
                    record.kill.kill(
                        TransportErrorKind::OverstayTimeout,
                        "connection exceeded the maximum allowed connection time",
                    );
                    continue;
                }
            }

            if stalest.as_ref().is_none_or(|(_, max_idle)| idle > *max_idle) {
                stalest = Some((Arc::clone(record), idle));
            }
        }

        // Soft-limit pressure: drop the stalest surviving connection.
        // Policy choice, deliberately conservative: prefer the greatest
        // idle time, and when every connection shows zero idle time admit
        // without evicting. Evicting the oldest connection outright would
        // also be defensible.
        while evictions > 0 {
            evictions -= 1;
            match stalest.take() {
                Some((record, idle)) if idle > Duration::ZERO => {
                    tracing::warn!(
                        connection.id = record.id,
                        idle = ?idle,
                        "Soft connection limit exceeded, evicting stalest connection"
                    );
                    record
                        .kill
                        .kill(TransportErrorKind::LoiterTimeout, "connection evicted under load");
                }
                _ => break,
            }
        }
    }
}

/// Keeps a connection registered for its lifetime.
pub(crate) struct ConnectionGuard {
    admitter: Arc<ConnectionAdmitter>,
    record: Arc<ConnectionRecord>,
}

impl ConnectionGuard {
    pub(crate) fn record(&self) -> &Arc<ConnectionRecord> {
        &self.record
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.admitter.deregister(self.record.id);
    }
}

/// Periodic stale/overstay enforcement for one server.
pub(crate) struct MonitorTask {
    pub admitter: Arc<ConnectionAdmitter>,
    pub interval: Duration,
}

#[async_trait]
impl Task for MonitorTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "connection monitor";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tracing::debug!("Task started");
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.admitter.enforce_deadlines(),
                () = shutdown_signal.wait() => break,
            }
        }

        tracing::debug!("Task terminated");
        Ok(())
    }
}

/// Binary-exponential delay between failed accepts: start at `min`, double
/// on consecutive failures up to `max`, reset on success.
pub(crate) struct AcceptBackoffTimer {
    inner: backoff::ExponentialBackoff,
    max: Duration,
}

impl AcceptBackoffTimer {
    pub(crate) fn new(config: AcceptBackoff) -> Self {
        let inner = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(config.min)
            .with_randomization_factor(0.0)
            .with_multiplier(2.0)
            .with_max_interval(config.max)
            .with_max_elapsed_time(None)
            .build();
        AcceptBackoffTimer { inner, max: config.max }
    }

    /// Delay to wait after the latest failure.
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.inner.next_backoff().unwrap_or(self.max)
    }

    /// A successful accept returns the wait to `min`.
    pub(crate) fn reset(&mut self) {
        self.inner.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(soft: usize, hard: usize) -> ServerOptions {
        ServerOptions::new("test")
            .with_soft_connection_limit(soft)
            .with_hard_connection_limit(hard)
    }

    #[test]
    fn admission_tiers() {
        let admitter = ConnectionAdmitter::new(&options(1, 2));

        assert_eq!(admitter.admit(), Admission::Accept);
        let _first = admitter.register();

        assert_eq!(admitter.admit(), Admission::AcceptOverSoft);
        let _second = admitter.register();

        assert_eq!(admitter.admit(), Admission::Shed);
    }

    #[test]
    fn guard_drop_releases_the_slot() {
        let admitter = ConnectionAdmitter::new(&options(1, 1));
        let guard = admitter.register();
        assert_eq!(admitter.connection_count(), 1);
        drop(guard);
        assert_eq!(admitter.connection_count(), 0);
        assert_eq!(admitter.admit(), Admission::Accept);
    }

    #[tokio::test]
    async fn kill_switch_delivers_reason_once() {
        let switch = Arc::new(KillSwitch::default());
        let waiter = {
            let switch = Arc::clone(&switch);
            tokio::spawn(async move { switch.killed().await })
        };

        switch.kill(TransportErrorKind::SilenceTimeout, "idle too long");
        // Later kills must not overwrite the first reason.
        switch.kill(TransportErrorKind::OverstayTimeout, "second");

        let kill = waiter.await.expect("join");
        assert_eq!(kill.kind, TransportErrorKind::SilenceTimeout);
        assert_eq!(kill.message, "idle too long");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_connections_are_killed() {
        let admitter = ConnectionAdmitter::new(&options(8, 16).with_stale_timeout(Duration::from_secs(5)));
        let guard = admitter.register();

        tokio::time::advance(Duration::from_secs(6)).await;
        admitter.enforce_deadlines();

        let kill = guard.record().kill.killed().await;
        assert_eq!(kill.kind, TransportErrorKind::SilenceTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn overstay_is_enforced_even_when_active() {
        let admitter = ConnectionAdmitter::new(
            &options(8, 16)
                .with_stale_timeout(Duration::from_secs(3600))
                .with_overstay_timeout(Duration::from_secs(10)),
        );
        let guard = admitter.register();

        tokio::time::advance(Duration::from_secs(11)).await;
        guard.record().touch();
        admitter.enforce_deadlines();

        let kill = guard.record().kill.killed().await;
        assert_eq!(kill.kind, TransportErrorKind::OverstayTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn over_soft_admission_evicts_the_stalest() {
        let admitter = ConnectionAdmitter::new(&options(1, 8).with_stale_timeout(Duration::from_secs(3600)));

        let old = admitter.register();
        tokio::time::advance(Duration::from_secs(30)).await;
        let fresh = admitter.register();
        fresh.record().touch();

        assert_eq!(admitter.admit(), Admission::AcceptOverSoft);
        let _third = admitter.register();
        admitter.enforce_deadlines();

        let kill = old.record().kill.killed().await;
        assert_eq!(kill.kind, TransportErrorKind::LoiterTimeout);
    }

    #[test]
    fn backoff_doubles_and_resets() {
        let mut timer = AcceptBackoffTimer::new(AcceptBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(400),
        ));

        assert_eq!(timer.next_delay(), Duration::from_millis(100));
        assert_eq!(timer.next_delay(), Duration::from_millis(200));
        assert_eq!(timer.next_delay(), Duration::from_millis(400));
        assert_eq!(timer.next_delay(), Duration::from_millis(400));

        timer.reset();
        assert_eq!(timer.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn fixed_backoff_never_doubles() {
        let mut timer = AcceptBackoffTimer::new(AcceptBackoff::fixed(Duration::from_millis(250)));
        assert_eq!(timer.next_delay(), Duration::from_millis(250));
        assert_eq!(timer.next_delay(), Duration::from_millis(250));
    }
}
