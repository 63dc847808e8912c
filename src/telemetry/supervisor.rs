use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::decode::decode_frame;
use super::types::{LinkState, TelemetryView};
use super::{TelemetryError, TelemetrySource, TelemetryStream};

/// Owns the device connection and publishes the latest decoded snapshot.
///
/// Readers subscribe to the `watch` receiver returned by [`ConnectionSupervisor::new`];
/// the snapshot is kept across disconnects and only `link` changes.
pub struct ConnectionSupervisor {
    source: Arc<dyn TelemetrySource>,
    backoff: Backoff,
    frame_timeout: Duration,
    tx: watch::Sender<TelemetryView>,
}

impl ConnectionSupervisor {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        backoff: Backoff,
        frame_timeout: Duration,
    ) -> (Self, watch::Receiver<TelemetryView>) {
        let (tx, rx) = watch::channel(TelemetryView::default());
        (
            Self {
                source,
                backoff,
                frame_timeout,
                tx,
            },
            rx,
        )
    }

    /// Connect, receive and reconnect until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        info!("Telemetry supervisor started");

        loop {
            self.tx.send_modify(|v| v.link = LinkState::Connecting);

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.source.connect() => result,
            };

            let error = match connected {
                Ok(mut stream) => {
                    attempt = 0;
                    self.tx.send_modify(|v| {
                        v.link = LinkState::Connected;
                        v.connected_since = Some(Utc::now());
                        v.last_error = None;
                    });
                    info!("Telemetry connected");
                    match self.receive(stream.as_mut(), &cancel).await {
                        Some(err) => err,
                        None => break,
                    }
                }
                Err(err) => err,
            };

            warn!("Telemetry link down: {}", error);
            self.tx.send_modify(|v| {
                v.link = LinkState::Disconnected;
                v.connected_since = None;
                v.last_error = Some(error.to_string());
            });

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!("Reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.tx.send_modify(|v| {
            v.link = LinkState::Disconnected;
            v.connected_since = None;
        });
        info!("Telemetry supervisor stopped");
    }

    /// Receive until the stream fails. Returns `None` when cancelled.
    async fn receive(
        &self,
        stream: &mut dyn TelemetryStream,
        cancel: &CancellationToken,
    ) -> Option<TelemetryError> {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = timeout(self.frame_timeout, stream.next_frame()) => result,
            };

            let frame = match next {
                Err(_) => return Some(TelemetryError::Timeout(self.frame_timeout.as_millis() as u64)),
                // a garbled body is one bad frame; the connection itself is fine
                Ok(Err(TelemetryError::Malformed(msg))) => {
                    warn!("Dropping telemetry frame: {}", msg);
                    continue;
                }
                Ok(Err(err)) => return Some(err),
                Ok(Ok(None)) => return Some(TelemetryError::Receive("stream closed".to_string())),
                Ok(Ok(Some(frame))) => frame,
            };

            match decode_frame(&frame) {
                Ok(snapshot) => {
                    let snapshot = Arc::new(snapshot);
                    self.tx.send_modify(|v| {
                        v.snapshot = Some(snapshot);
                        v.sequence += 1;
                    });
                }
                Err(err) => warn!("Dropping telemetry frame: {}", err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use crate::slot::SlotKey;

    enum Step {
        Frame(Value),
        Garbled,
        Fail,
    }

    /// Each `connect` pops one scripted session; an exhausted script refuses connections.
    struct FakeSource {
        sessions: Mutex<VecDeque<Result<Vec<Step>, String>>>,
    }

    struct FakeStream {
        steps: VecDeque<Step>,
    }

    #[async_trait]
    impl TelemetrySource for FakeSource {
        async fn connect(&self) -> Result<Box<dyn TelemetryStream>, TelemetryError> {
            match self.sessions.lock().pop_front() {
                Some(Ok(steps)) => Ok(Box::new(FakeStream {
                    steps: steps.into(),
                })),
                Some(Err(msg)) => Err(TelemetryError::Connect(msg)),
                None => Err(TelemetryError::Connect("refused".to_string())),
            }
        }
    }

    #[async_trait]
    impl TelemetryStream for FakeStream {
        async fn next_frame(&mut self) -> Result<Option<Value>, TelemetryError> {
            match self.steps.pop_front() {
                Some(Step::Frame(v)) => Ok(Some(v)),
                Some(Step::Garbled) => Err(TelemetryError::Malformed("body is not JSON".to_string())),
                Some(Step::Fail) => Err(TelemetryError::Receive("reset".to_string())),
                None => std::future::pending().await,
            }
        }
    }

    fn frame(material: &str) -> Value {
        json!({"result": {"status": {"1A": {"present": true, "material": material}}}})
    }

    fn start(
        sessions: Vec<Result<Vec<Step>, String>>,
    ) -> (watch::Receiver<TelemetryView>, CancellationToken, tokio::task::JoinHandle<()>) {
        let source = Arc::new(FakeSource {
            sessions: Mutex::new(sessions.into()),
        });
        let (supervisor, rx) = ConnectionSupervisor::new(
            source,
            Backoff::new(1, 5, 0.0),
            Duration::from_secs(30),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));
        (rx, cancel, handle)
    }

    async fn wait(
        rx: &mut watch::Receiver<TelemetryView>,
        pred: impl FnMut(&TelemetryView) -> bool,
    ) -> TelemetryView {
        timeout(Duration::from_secs(5), rx.wait_for(pred))
            .await
            .expect("timed out waiting for view")
            .expect("supervisor dropped")
            .clone()
    }

    fn material_1a(view: &TelemetryView) -> Option<String> {
        let key: SlotKey = "1A".parse().unwrap();
        view.snapshot
            .as_ref()
            .and_then(|s| s.slots.get(&key))
            .and_then(|s| s.material.clone())
    }

    #[tokio::test]
    async fn test_publishes_snapshot_when_connected() {
        let (mut rx, cancel, handle) = start(vec![Ok(vec![Step::Frame(frame("PLA"))])]);
        let view = wait(&mut rx, |v| v.sequence == 1).await;
        assert!(view.is_live());
        assert!(view.connected_since.is_some());
        assert_eq!(material_1a(&view).as_deref(), Some("PLA"));

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(rx.borrow().link, LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let (mut rx, cancel, handle) = start(vec![Ok(vec![
            Step::Frame(json!({"nonsense": true})),
            Step::Frame(frame("PETG")),
        ])]);
        let view = wait(&mut rx, |v| v.sequence >= 1).await;
        assert_eq!(view.sequence, 1);
        assert!(view.is_live());
        assert_eq!(material_1a(&view).as_deref(), Some("PETG"));
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_garbled_body_keeps_connection() {
        // a single session: any reconnect would be refused and show up as an error
        let (mut rx, cancel, handle) = start(vec![Ok(vec![
            Step::Garbled,
            Step::Garbled,
            Step::Frame(frame("PLA")),
        ])]);
        let view = wait(&mut rx, |v| v.sequence >= 1).await;
        assert_eq!(view.sequence, 1);
        assert!(view.is_live());
        assert!(view.last_error.is_none());
        assert_eq!(material_1a(&view).as_deref(), Some("PLA"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let view = rx.borrow().clone();
        assert!(view.is_live());
        assert!(view.last_error.is_none());
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_loss_keeps_last_snapshot() {
        let (mut rx, cancel, handle) =
            start(vec![Ok(vec![Step::Frame(frame("ABS")), Step::Fail])]);
        let view = wait(&mut rx, |v| {
            v.sequence == 1 && v.link == LinkState::Disconnected && v.last_error.is_some()
        })
        .await;
        assert!(!view.is_live());
        assert_eq!(material_1a(&view).as_deref(), Some("ABS"));
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_failures() {
        let (mut rx, cancel, handle) = start(vec![
            Err("down".to_string()),
            Err("still down".to_string()),
            Ok(vec![Step::Frame(frame("TPU"))]),
        ]);
        let view = wait(&mut rx, |v| v.is_live() && v.sequence == 1).await;
        assert!(view.last_error.is_none());
        assert_eq!(material_1a(&view).as_deref(), Some("TPU"));
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_while_backing_off() {
        let source = Arc::new(FakeSource {
            sessions: Mutex::new(VecDeque::new()),
        });
        let (supervisor, rx) = ConnectionSupervisor::new(
            source,
            Backoff::new(60_000, 60_000, 0.0),
            Duration::from_secs(30),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("supervisor did not stop")
            .unwrap();
        assert_eq!(rx.borrow().link, LinkState::Disconnected);
    }
}
