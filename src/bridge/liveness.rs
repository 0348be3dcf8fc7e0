//! Heartbeat-based liveness
//!
//! The guest overwrites its heartbeat every interval. The host only looks at
//! whether the heartbeat *changes*, measured on the host clock, so guest
//! clock skew does not matter.

use std::time::{Duration, Instant};

use crate::protocol::{DaemonStatus, Heartbeat};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// No heartbeat seen yet (guest still booting)
    Waiting,
    Alive,
    /// Daemon is up but has no usable request transport
    Degraded,
    /// Heartbeat has not advanced for more than twice the interval
    Unresponsive { stale_for: Duration },
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    last: Option<(Heartbeat, Instant)>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Feed the latest heartbeat read (or `None`) observed at `now`
    pub fn observe(&mut self, heartbeat: Option<Heartbeat>, now: Instant) -> Liveness {
        if let Some(hb) = heartbeat {
            let advanced = match &self.last {
                Some((prev, _)) => prev.timestamp != hb.timestamp || prev.pid != hb.pid,
                None => true,
            };
            if advanced {
                self.last = Some((hb, now));
            }
        }

        let Some((hb, seen_at)) = &self.last else {
            return Liveness::Waiting;
        };
        let stale_for = now.saturating_duration_since(*seen_at);
        if stale_for > self.interval * 2 {
            Liveness::Unresponsive { stale_for }
        } else if hb.status == DaemonStatus::Degraded {
            Liveness::Degraded
        } else {
            Liveness::Alive
        }
    }

    /// Read the bridge's heartbeat now and classify it
    pub async fn check(&mut self, bridge: &dyn super::HostBridge) -> Liveness {
        let heartbeat = bridge.read_heartbeat().await;
        self.observe(heartbeat, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TransportMode;

    fn hb(timestamp: u64, status: DaemonStatus) -> Heartbeat {
        Heartbeat {
            timestamp,
            pid: 42,
            uptime: timestamp / 1000,
            ipc_mounted: true,
            transport: TransportMode::File,
            status,
        }
    }

    #[test]
    fn test_stale_heartbeat_becomes_unresponsive() {
        let interval = Duration::from_secs(5);
        let mut monitor = HeartbeatMonitor::new(interval);
        let t0 = Instant::now();

        assert_eq!(monitor.observe(None, t0), Liveness::Waiting);
        assert_eq!(monitor.observe(Some(hb(1_000, DaemonStatus::Ready)), t0), Liveness::Alive);

        // Same heartbeat re-read within 2× interval: still alive.
        let t1 = t0 + Duration::from_secs(9);
        assert_eq!(monitor.observe(Some(hb(1_000, DaemonStatus::Ready)), t1), Liveness::Alive);

        // Unchanged past 2× interval.
        let t2 = t0 + Duration::from_secs(11);
        assert!(matches!(
            monitor.observe(Some(hb(1_000, DaemonStatus::Ready)), t2),
            Liveness::Unresponsive { .. }
        ));

        // Advancing again recovers.
        assert_eq!(monitor.observe(Some(hb(12_000, DaemonStatus::Ready)), t2), Liveness::Alive);
    }

    #[test]
    fn test_degraded_status_surfaced() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(5));
        let now = Instant::now();
        assert_eq!(
            monitor.observe(Some(hb(5, DaemonStatus::Degraded)), now),
            Liveness::Degraded
        );
    }
}
