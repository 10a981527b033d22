//! Per-client session loop
//!
//! Each connected client gets one `ClientSession` running on the serving
//! runtime. It repeatedly snapshots the frame slot and sends the newest frame
//! it has not delivered yet. Frames produced while a send is in flight are
//! simply skipped, so a slow client never builds a backlog.

use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::context::RelayContext;
use super::registry::{SessionHandle, SessionId};
use crate::transport::{ClientTransport, OutboundMessage};
use crate::wire::{encode_frame_message, ControlMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client hung up
    Disconnected,
    /// Sending to the client failed
    SendFailed,
    /// Server-side close request (shutdown or status send failure)
    Requested,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub frames_sent: u64,
    /// Frame ids produced but never delivered to this client
    pub frames_skipped: u64,
    pub last_delivered_version: u64,
    pub reason: CloseReason,
    pub state: SessionState,
}

pub struct ClientSession {
    id: SessionId,
    ctx: Arc<RelayContext>,
    transport: Arc<dyn ClientTransport>,
    close_rx: watch::Receiver<bool>,
    state: SessionState,
    last_delivered_version: u64,
    frames_sent: u64,
    frames_skipped: u64,
}

impl ClientSession {
    /// Create the session and register it with the context's registry
    pub fn open(ctx: Arc<RelayContext>, transport: Arc<dyn ClientTransport>) -> Self {
        let id = ctx.registry.next_session_id();
        let (handle, close_rx) = SessionHandle::new(id, Arc::clone(&transport));
        ctx.registry.add(handle);

        Self {
            id,
            ctx,
            transport,
            close_rx,
            state: SessionState::Active,
            last_delivered_version: 0,
            frames_sent: 0,
            frames_skipped: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Drive the session until it closes, then deregister it
    pub async fn run(mut self) -> SessionSummary {
        let peer = self.transport.peer();
        info!(session_id = self.id, %peer, "Client connected");

        let reason = match self.send_initial_status().await {
            Ok(()) => self.deliver_frames().await,
            Err(reason) => reason,
        };

        self.close(reason).await;

        let summary = SessionSummary {
            session_id: self.id,
            frames_sent: self.frames_sent,
            frames_skipped: self.frames_skipped,
            last_delivered_version: self.last_delivered_version,
            reason,
            state: self.state,
        };

        info!(
            session_id = self.id,
            %peer,
            frames_sent = summary.frames_sent,
            frames_skipped = summary.frames_skipped,
            reason = ?summary.reason,
            "Client disconnected"
        );

        summary
    }

    async fn send_initial_status(&mut self) -> Result<(), CloseReason> {
        let status = ControlMessage::from(self.ctx.status());
        match status.to_json() {
            Ok(json) => self.send(OutboundMessage::Text(json)).await,
            Err(e) => {
                warn!(session_id = self.id, error = %e, "Failed to encode status");
                Ok(())
            }
        }
    }

    /// Send one message unless the session is told to close or the client
    /// hangs up first; a stalled send is abandoned in that case.
    async fn send(&mut self, message: OutboundMessage) -> Result<(), CloseReason> {
        let id = self.id;
        let transport = Arc::clone(&self.transport);
        let close_requested = self.close_rx.wait_for(|closed| *closed).map(|_| ());

        tokio::select! {
            result = transport.send(message) => result.map_err(|e| {
                debug!(session_id = id, error = %e, "Send failed");
                CloseReason::SendFailed
            }),
            _ = transport.closed() => Err(CloseReason::Disconnected),
            _ = close_requested => Err(CloseReason::Requested),
        }
    }

    async fn deliver_frames(&mut self) -> CloseReason {
        let poll_interval = self.ctx.timing().poll_interval;
        let ctx = Arc::clone(&self.ctx);
        let transport = Arc::clone(&self.transport);

        loop {
            if *self.close_rx.borrow() {
                return CloseReason::Requested;
            }
            if transport.is_closed() {
                return CloseReason::Disconnected;
            }

            // Register for the wake-up before looking at the version so a
            // frame published in between is not missed.
            let changed = ctx.slot.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if ctx.slot.version() > self.last_delivered_version {
                if let Err(reason) = self.send_latest().await {
                    return reason;
                }
                continue;
            }

            let close_requested = self.close_rx.wait_for(|closed| *closed).map(|_| ());
            tokio::select! {
                _ = tokio::time::timeout(poll_interval, changed.as_mut()) => {}
                _ = transport.closed() => return CloseReason::Disconnected,
                // Also taken when every handle is dropped without a request
                _ = close_requested => return CloseReason::Requested,
            }
        }
    }

    async fn send_latest(&mut self) -> Result<(), CloseReason> {
        let Some(frame) = self.ctx.slot.get() else {
            return Ok(());
        };
        if frame.id <= self.last_delivered_version {
            return Ok(());
        }

        let message = encode_frame_message(&frame, self.ctx.fps.rate());
        self.send(OutboundMessage::Binary(message)).await?;

        if self.last_delivered_version > 0 {
            self.frames_skipped += frame.id - self.last_delivered_version - 1;
        }
        self.last_delivered_version = frame.id;
        self.frames_sent += 1;
        Ok(())
    }

    async fn close(&mut self, reason: CloseReason) {
        self.state = SessionState::Closed;
        self.ctx.registry.remove(self.id);

        if reason != CloseReason::Disconnected {
            // A client that stopped reading may never accept the close frame
            let timeout = self.ctx.timing().status_send_timeout;
            if tokio::time::timeout(timeout, self.transport.close()).await.is_err() {
                debug!(session_id = self.id, "Close handshake timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::context::RelayTiming;
    use crate::streaming::Frame;
    use crate::transport::testing::RecordingTransport;
    use crate::wire::decode_frame_message;
    use bytes::Bytes;
    use std::time::{Duration, SystemTime};

    fn context(poll_ms: u64) -> Arc<RelayContext> {
        Arc::new(RelayContext::new(
            30,
            RelayTiming {
                poll_interval: Duration::from_millis(poll_ms),
                ..RelayTiming::default()
            },
        ))
    }

    fn publish(ctx: &RelayContext, id: u64) {
        ctx.slot.set(Frame::new(
            id,
            SystemTime::now(),
            Bytes::from(format!("frame-{id}")),
        ));
    }

    fn delivered_ids(transport: &RecordingTransport) -> Vec<u32> {
        transport
            .binary_messages()
            .iter()
            .map(|m| decode_frame_message(m).unwrap().0.frame_id)
            .collect()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_initial_status_precedes_frames() {
        let ctx = context(5);
        publish(&ctx, 1);

        let transport = Arc::new(RecordingTransport::new("client"));
        let session = ClientSession::open(Arc::clone(&ctx), transport.clone());
        let id = session.id();
        let task = tokio::spawn(session.run());

        wait_until(|| !transport.binary_messages().is_empty()).await;

        let sent = transport.sent();
        match &sent[0] {
            OutboundMessage::Text(json) => assert!(json.contains(r#""type":"status""#)),
            other => panic!("expected status first, got {:?}", other),
        }
        assert!(ctx.registry.contains(id));

        transport.disconnect();
        let summary = task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::Disconnected);
        assert_eq!(summary.frames_sent, 1);
        assert!(!ctx.registry.contains(id));
    }

    #[tokio::test]
    async fn test_latest_wins_and_monotonic() {
        let ctx = context(5);
        // Each send takes longer than the producer interval, forcing skips
        let transport = Arc::new(RecordingTransport::slow("slow", Duration::from_millis(15)));
        let task = tokio::spawn(ClientSession::open(Arc::clone(&ctx), transport.clone()).run());

        const K: u64 = 40;
        for id in 1..=K {
            publish(&ctx, id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        wait_until(|| delivered_ids(&transport).last() == Some(&(K as u32))).await;

        let ids = delivered_ids(&transport);
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids not increasing: {:?}", ids);
        assert!(ids.len() < K as usize, "slow client should have skipped frames");

        ctx.registry.close_all();
        let summary = task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::Requested);
        assert_eq!(summary.last_delivered_version, K);
        assert_eq!(summary.frames_sent + summary.frames_skipped, K - ids[0] as u64 + 1);
    }

    #[tokio::test]
    async fn test_no_resend_without_new_frame() {
        let ctx = context(2);
        publish(&ctx, 1);

        let transport = Arc::new(RecordingTransport::new("client"));
        let task = tokio::spawn(ClientSession::open(Arc::clone(&ctx), transport.clone()).run());

        wait_until(|| transport.binary_messages().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.binary_messages().len(), 1);

        publish(&ctx, 2);
        wait_until(|| transport.binary_messages().len() == 2).await;

        ctx.registry.close_all();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_failure_closes_only_that_session() {
        let ctx = context(5);
        let good = Arc::new(RecordingTransport::new("good"));
        let bad = Arc::new(RecordingTransport::new("bad"));

        let good_session = ClientSession::open(Arc::clone(&ctx), good.clone());
        let bad_session = ClientSession::open(Arc::clone(&ctx), bad.clone());
        let bad_id = bad_session.id();

        let good_task = tokio::spawn(good_session.run());
        let bad_task = tokio::spawn(bad_session.run());

        wait_until(|| !bad.text_messages().is_empty()).await;
        bad.set_failing(true);
        publish(&ctx, 1);

        let summary = bad_task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::SendFailed);
        assert!(!ctx.registry.contains(bad_id));

        publish(&ctx, 2);
        wait_until(|| delivered_ids(&good).last() == Some(&2)).await;
        assert_eq!(ctx.registry.len(), 1);

        ctx.registry.close_all();
        good_task.await.unwrap();
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_request_while_idle() {
        let ctx = context(1_000);
        let transport = Arc::new(RecordingTransport::new("idle"));
        let task = tokio::spawn(ClientSession::open(Arc::clone(&ctx), transport.clone()).run());

        wait_until(|| !transport.text_messages().is_empty()).await;
        ctx.registry.close_all();

        let summary = tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("session did not react to close request")
            .unwrap();
        assert_eq!(summary.reason, CloseReason::Requested);
        assert_eq!(summary.state, SessionState::Closed);
        assert_eq!(summary.frames_sent, 0);
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_close_request_interrupts_stalled_send() {
        let ctx = context(5);
        publish(&ctx, 1);

        // Client that never drains: every send hangs far longer than the test
        let transport = Arc::new(RecordingTransport::slow("stalled", Duration::from_secs(10)));
        let session = ClientSession::open(Arc::clone(&ctx), transport.clone());
        let id = session.id();
        let task = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.registry.contains(id));
        ctx.registry.close_all();

        let summary = tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("stalled session ignored the close request")
            .unwrap();
        assert_eq!(summary.reason, CloseReason::Requested);
        assert_eq!(summary.frames_sent, 0);
        assert!(!ctx.registry.contains(id));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_session_opened_during_shutdown_closes() {
        let ctx = context(1_000);
        ctx.registry.close_all();

        let transport = Arc::new(RecordingTransport::new("late"));
        let session = ClientSession::open(Arc::clone(&ctx), transport.clone());
        let id = session.id();

        let summary = tokio::time::timeout(Duration::from_millis(500), session.run())
            .await
            .expect("late session kept running");
        assert_eq!(summary.reason, CloseReason::Requested);
        assert!(!ctx.registry.contains(id));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_hangup_interrupts_stalled_send() {
        let ctx = context(5);
        let transport = Arc::new(RecordingTransport::slow("stalled", Duration::from_secs(10)));
        let session = ClientSession::open(Arc::clone(&ctx), transport.clone());
        let id = session.id();
        let task = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.disconnect();

        let summary = tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("stalled session missed the hangup")
            .unwrap();
        assert_eq!(summary.reason, CloseReason::Disconnected);
        assert!(!ctx.registry.contains(id));
    }
}
