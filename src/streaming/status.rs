//! Periodic status fan-out to every registered client

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::context::RelayContext;
use crate::transport::{OutboundMessage, TransportError};
use crate::wire::ControlMessage;

/// Outcome of one broadcast tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct StatusBroadcaster {
    ctx: Arc<RelayContext>,
}

impl StatusBroadcaster {
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        Self { ctx }
    }

    /// Tick on the configured period until `shutdown` flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.ctx.timing().status_interval;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(period_ms = period.as_millis() as u64, "Status broadcaster started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.broadcast_once().await;
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Status broadcaster stopped");
    }

    /// Send one status message to a snapshot of the registered sessions.
    ///
    /// A session whose send fails or times out is asked to close; its own
    /// loop deregisters it. The remaining sessions are still served.
    pub async fn broadcast_once(&self) -> BroadcastReport {
        let sessions = self.ctx.registry.snapshot();
        if sessions.is_empty() {
            return BroadcastReport::default();
        }

        let json = match ControlMessage::from(self.ctx.status()).to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to encode status");
                return BroadcastReport::default();
            }
        };

        let timeout = self.ctx.timing().status_send_timeout;
        let sends = sessions.iter().map(|handle| {
            let send = handle.transport().send(OutboundMessage::Text(json.clone()));
            async move {
                match tokio::time::timeout(timeout, send).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout),
                }
            }
        });
        // All sends run together, so one tick takes at most one timeout
        let results = join_all(sends).await;

        let mut report = BroadcastReport::default();
        for (handle, result) in sessions.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(
                        session_id = handle.id(),
                        peer = %handle.peer(),
                        error = %e,
                        "Status send failed"
                    );
                    handle.request_close();
                    report.failed += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::context::RelayTiming;
    use crate::streaming::registry::SessionHandle;
    use crate::streaming::session::{ClientSession, CloseReason};
    use crate::transport::testing::RecordingTransport;
    use crate::transport::ClientTransport;
    use std::time::{Duration, Instant};

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn register(
        ctx: &RelayContext,
        transport: Arc<RecordingTransport>,
    ) -> (SessionHandle, watch::Receiver<bool>) {
        let (handle, rx) = SessionHandle::new(ctx.registry.next_session_id(), transport);
        ctx.registry.add(handle.clone());
        (handle, rx)
    }

    #[tokio::test]
    async fn test_empty_registry_sends_nothing() {
        let ctx = Arc::new(RelayContext::default());
        let report = StatusBroadcaster::new(ctx).broadcast_once().await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_fan_out_isolates_failures() {
        let ctx = Arc::new(RelayContext::default());
        let t1 = Arc::new(RecordingTransport::new("one"));
        let t2 = Arc::new(RecordingTransport::failing("two"));
        let t3 = Arc::new(RecordingTransport::new("three"));

        let (_h1, _rx1) = register(&ctx, t1.clone());
        let (h2, rx2) = register(&ctx, t2.clone());
        let (_h3, _rx3) = register(&ctx, t3.clone());

        let report = StatusBroadcaster::new(Arc::clone(&ctx)).broadcast_once().await;

        assert_eq!(report, BroadcastReport { delivered: 2, failed: 1 });
        assert_eq!(t1.text_messages().len(), 1);
        assert_eq!(t3.text_messages().len(), 1);
        assert!(t2.text_messages().is_empty());

        // Left registered until its own loop retires it
        assert!(ctx.registry.contains(h2.id()));
        assert!(h2.close_requested());
        assert!(*rx2.borrow(), "failed session should be asked to close");
    }

    #[tokio::test]
    async fn test_status_content() {
        let ctx = Arc::new(RelayContext::default());
        let t1 = Arc::new(RecordingTransport::new("one"));
        let t2 = Arc::new(RecordingTransport::new("two"));
        let (_h1, _rx1) = register(&ctx, t1.clone());
        let (_h2, _rx2) = register(&ctx, t2.clone());
        ctx.mark_connected();

        StatusBroadcaster::new(Arc::clone(&ctx)).broadcast_once().await;

        let ControlMessage::Status(status) =
            ControlMessage::from_json(&t1.text_messages()[0]).unwrap();
        assert!(status.connected);
        assert_eq!(status.clients, 2);
    }

    #[tokio::test]
    async fn test_stalled_session_times_out() {
        let ctx = Arc::new(RelayContext::new(
            30,
            RelayTiming {
                status_send_timeout: Duration::from_millis(20),
                ..RelayTiming::default()
            },
        ));
        let stalled = Arc::new(RecordingTransport::slow("stalled", Duration::from_secs(10)));
        let healthy = Arc::new(RecordingTransport::new("healthy"));
        let (stalled_handle, _rx_s) = register(&ctx, stalled);
        let (_h, _rx_h) = register(&ctx, healthy.clone());

        let report = StatusBroadcaster::new(Arc::clone(&ctx)).broadcast_once().await;

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert!(stalled_handle.close_requested());
        assert_eq!(healthy.text_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_run_ticks_until_shutdown() {
        let ctx = Arc::new(RelayContext::new(
            30,
            RelayTiming {
                status_interval: Duration::from_millis(10),
                ..RelayTiming::default()
            },
        ));
        let transport = Arc::new(RecordingTransport::new("client"));
        let (_h, _rx) = register(&ctx, transport.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(StatusBroadcaster::new(Arc::clone(&ctx)).run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(transport.text_messages().len() >= 2);
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_stalled_sessions_share_one_timeout() {
        let ctx = Arc::new(RelayContext::new(
            30,
            RelayTiming {
                status_send_timeout: Duration::from_millis(100),
                ..RelayTiming::default()
            },
        ));
        let mut stalled = Vec::new();
        for name in ["s1", "s2", "s3"] {
            let transport = Arc::new(RecordingTransport::slow(name, Duration::from_secs(10)));
            stalled.push(register(&ctx, transport));
        }
        let healthy = Arc::new(RecordingTransport::new("healthy"));
        let (_h, _rx) = register(&ctx, healthy.clone());

        let started = Instant::now();
        let report = StatusBroadcaster::new(Arc::clone(&ctx)).broadcast_once().await;
        let elapsed = started.elapsed();

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 3 });
        assert!(elapsed < Duration::from_millis(250), "tick took {:?}", elapsed);
        assert_eq!(healthy.text_messages().len(), 1);
        assert!(stalled.iter().all(|(handle, _)| handle.close_requested()));
    }

    #[tokio::test]
    async fn test_failed_session_is_retired_by_its_loop() {
        let ctx = Arc::new(RelayContext::default());
        let transports: Vec<_> = ["one", "two", "three"]
            .into_iter()
            .map(|name| Arc::new(RecordingTransport::new(name)))
            .collect();

        let mut ids = Vec::new();
        let mut tasks = Vec::new();
        for transport in &transports {
            let session = ClientSession::open(Arc::clone(&ctx), transport.clone());
            ids.push(session.id());
            tasks.push(tokio::spawn(session.run()));
        }

        // Every session has sent its initial status before the failure starts
        wait_until(|| transports.iter().all(|t| t.text_messages().len() == 1)).await;
        transports[1].set_failing(true);

        let report = StatusBroadcaster::new(Arc::clone(&ctx)).broadcast_once().await;
        assert_eq!(report, BroadcastReport { delivered: 2, failed: 1 });

        wait_until(|| !ctx.registry.contains(ids[1])).await;
        assert!(ctx.registry.contains(ids[0]));
        assert!(ctx.registry.contains(ids[2]));
        assert_eq!(ctx.registry.len(), 2);
        assert_eq!(transports[0].text_messages().len(), 2);
        assert_eq!(transports[2].text_messages().len(), 2);

        ctx.registry.close_all();
        let mut reasons = Vec::new();
        for task in tasks {
            reasons.push(task.await.unwrap().reason);
        }
        assert_eq!(reasons[1], CloseReason::Requested);
        assert!(ctx.registry.is_empty());
    }
}
