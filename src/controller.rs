use crate::control_bridge::{ControlBridge, ControlEvent, StatusMessage};
use crate::error::CallError;
use crate::net_link::{LinkEvent, NetEvent};
use crate::session::{SessionDeps, StreamSession};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Shown to the user for every failure; details go to the log.
const CALL_FAILED_MESSAGE: &str = "Call failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Dialing,
    InCall,
    Failed,
}

/// Result of a background dial attempt.
pub struct DialOutcome {
    attempt: Uuid,
    result: Result<StreamSession, CallError>,
}

/// A dial attempt still connecting.
struct Dialing {
    attempt: Uuid,
    task: JoinHandle<()>,
}

pub struct CoreController {
    state: CallState,
    session: Option<StreamSession>,
    dialing: Option<Dialing>,
    deps: SessionDeps,
    default_url: String,
    control: Arc<ControlBridge>,
    outcomes: mpsc::Sender<DialOutcome>,
}

impl CoreController {
    pub fn new(
        default_url: String,
        deps: SessionDeps,
        control: Arc<ControlBridge>,
        outcomes: mpsc::Sender<DialOutcome>,
    ) -> Self {
        Self {
            state: CallState::Idle,
            session: None,
            dialing: None,
            deps,
            default_url,
            control,
            outcomes,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Report the current state, e.g. right after startup.
    pub async fn announce(&self) {
        self.control
            .send_status(&StatusMessage::CallState { state: self.state })
            .await;
    }

    pub async fn handle_control_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Permission { granted } => {
                self.deps.permission.set(granted);
                if !granted && (self.session.is_some() || self.dialing.is_some()) {
                    log::warn!("Microphone permission revoked during call, hanging up");
                    self.hangup().await;
                }
            }
            ControlEvent::Dial { url } => {
                let url = url.unwrap_or_else(|| self.default_url.clone());
                self.dial(url).await;
            }
            ControlEvent::Hangup => self.hangup().await,
        }
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let current = self.session.as_ref().map(StreamSession::id);
        if current != Some(event.session) {
            log::debug!("Ignoring event from stale session {}: {:?}", event.session, event.event);
            return;
        }

        match event.event {
            NetEvent::Connected => log::info!("Media stream connected"),
            NetEvent::StreamStarted(sid) => log::info!("Remote stream started: {:?}", sid),
            NetEvent::StreamStopped | NetEvent::Disconnected => {
                log::info!("Remote side ended the call");
                self.hangup().await;
            }
            NetEvent::Failed(reason) => {
                self.fail(&CallError::ConnectionFailure(reason)).await;
            }
            NetEvent::CaptureLost(reason) => {
                self.fail(&CallError::DeviceUnavailable(reason)).await;
            }
        }
    }

    /// Start connecting in the background; the outcome comes back through
    /// `handle_dial_outcome` so control events keep flowing meanwhile.
    async fn dial(&mut self, url: String) {
        // Never two calls on the devices at once
        self.cancel_dial().await;
        self.end_session().await;

        self.set_state(CallState::Dialing).await;
        let attempt = Uuid::new_v4();
        let deps = self.deps.clone();
        let outcomes = self.outcomes.clone();
        let task = tokio::spawn(async move {
            let result = StreamSession::start(&deps, &url).await;
            if let Err(e) = outcomes.send(DialOutcome { attempt, result }).await {
                // Controller is gone; tear the orphaned call down here
                if let Ok(mut session) = e.0.result {
                    session.stop().await;
                }
            }
        });
        self.dialing = Some(Dialing { attempt, task });
    }

    pub async fn handle_dial_outcome(&mut self, outcome: DialOutcome) {
        if self.dialing.as_ref().map(|d| d.attempt) != Some(outcome.attempt) {
            log::debug!("Discarding outcome of cancelled dial {}", outcome.attempt);
            if let Ok(mut session) = outcome.result {
                session.stop().await;
            }
            return;
        }
        self.dialing = None;

        match outcome.result {
            Ok(session) => {
                log::info!("Call {} established", session.id());
                self.session = Some(session);
                self.set_state(CallState::InCall).await;
            }
            Err(e) => self.fail(&e).await,
        }
    }

    pub async fn hangup(&mut self) {
        self.cancel_dial().await;
        self.end_session().await;
        if self.state != CallState::Idle {
            self.set_state(CallState::Idle).await;
        }
    }

    async fn fail(&mut self, error: &CallError) {
        if error.is_device_failure() {
            log::error!("Call failed, audio device problem: {}", error);
        } else {
            log::error!("Call failed: {}", error);
        }
        self.end_session().await;
        self.set_state(CallState::Failed).await;
        self.control
            .send_status(&StatusMessage::CallFailed {
                message: CALL_FAILED_MESSAGE.to_string(),
            })
            .await;
    }

    /// Abort a dial in progress and wait until its resources are dropped.
    async fn cancel_dial(&mut self) {
        if let Some(dialing) = self.dialing.take() {
            log::info!("Cancelling dial {}", dialing.attempt);
            dialing.task.abort();
            let _ = dialing.task.await;
        }
    }

    async fn end_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stop().await;
        }
    }

    async fn set_state(&mut self, state: CallState) {
        log::info!("Call state: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.announce().await;
    }

    /// Tear down any live or pending call before exit.
    pub async fn shutdown(&mut self) {
        self.cancel_dial().await;
        self.end_session().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::BinaryFormat;
    use crate::audio::testing::{FakeBackend, wait_until};
    use crate::net_link::NetLinkOptions;
    use crate::session::{PermissionGate, SessionSlot};
    use futures_util::StreamExt;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};
    use tokio::net::{TcpListener, UdpSocket};
    use tokio_tungstenite::accept_async;

    struct Harness {
        controller: CoreController,
        ui: UdpSocket,
        backend: Arc<FakeBackend>,
        slot: Arc<SessionSlot>,
        outcomes: mpsc::Receiver<DialOutcome>,
        _events: mpsc::Receiver<LinkEvent>,
    }

    impl Harness {
        async fn dial(&mut self, url: Option<String>) {
            self.controller
                .handle_control_event(ControlEvent::Dial { url })
                .await;
            assert_eq!(self.controller.state(), CallState::Dialing);
            let outcome = tokio::time::timeout(Duration::from_secs(5), self.outcomes.recv())
                .await
                .unwrap()
                .unwrap();
            self.controller.handle_dial_outcome(outcome).await;
        }
    }

    async fn harness(granted: bool) -> Harness {
        let ui = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (control_tx, _control_rx) = mpsc::channel(4);
        let control = ControlBridge::bind(
            "127.0.0.1:0",
            ui.local_addr().unwrap().to_string(),
            1024,
            control_tx,
        )
        .await
        .unwrap();

        let backend = Arc::new(FakeBackend::new());
        let slot = SessionSlot::new();
        let (events_tx, events_rx) = mpsc::channel(64);
        let (outcomes_tx, outcomes_rx) = mpsc::channel(4);
        let deps = SessionDeps {
            backend: backend.clone(),
            permission: Arc::new(PermissionGate::new(granted)),
            slot: slot.clone(),
            options: NetLinkOptions {
                connect_timeout: Duration::from_secs(3),
                keepalive: Duration::from_secs(30),
                outbound_queue: 64,
                binary_format: BinaryFormat::Pcm16,
                token: None,
            },
            playback_queue: 16,
            events: events_tx,
        };

        Harness {
            controller: CoreController::new(
                "ws://127.0.0.1:1".into(),
                deps,
                Arc::new(control),
                outcomes_tx,
            ),
            ui,
            backend,
            slot,
            outcomes: outcomes_rx,
            _events: events_rx,
        }
    }

    async fn next_status(ui: &UdpSocket) -> serde_json::Value {
        let mut buf = [0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(3), ui.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        serde_json::from_slice(&buf[..len]).unwrap()
    }

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(mut ws) = accept_async(stream).await {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });
        format!("ws://{}", addr)
    }

    /// Accepts TCP connections but never answers the WebSocket handshake.
    async fn mute_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn dial_without_permission_fails_generically() {
        let mut h = harness(false).await;
        h.dial(None).await;

        assert_eq!(h.controller.state(), CallState::Failed);
        assert_eq!(next_status(&h.ui).await["state"], "dialing");
        assert_eq!(next_status(&h.ui).await["state"], "failed");
        let failed = next_status(&h.ui).await;
        assert_eq!(failed["type"], "call_failed");
        assert_eq!(failed["message"], "Call failed");
        assert_eq!(h.backend.input_opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_server_fails_and_frees_devices() {
        let mut h = harness(true).await;
        h.dial(None).await;

        assert_eq!(h.controller.state(), CallState::Failed);
        assert!(!h.slot.is_busy());
        assert!(h.backend.sink_log.released.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dial_hangup_and_redial() {
        let mut h = harness(true).await;
        let url = echo_server().await;

        h.dial(Some(url.clone())).await;
        assert_eq!(h.controller.state(), CallState::InCall);
        let first_session = h.controller.session.as_ref().map(StreamSession::id);

        // Redial tears down the running call first
        h.dial(Some(url)).await;
        assert_eq!(h.controller.state(), CallState::InCall);
        let second_session = h.controller.session.as_ref().map(StreamSession::id);
        assert_ne!(first_session, second_session);
        assert_eq!(h.backend.output_opens.load(Ordering::SeqCst), 2);

        h.controller.handle_control_event(ControlEvent::Hangup).await;
        assert_eq!(h.controller.state(), CallState::Idle);
        assert!(!h.slot.is_busy());
        assert!(h.backend.source_released.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hangup_while_dialing_cancels_promptly() {
        let mut h = harness(true).await;
        let url = mute_server().await;

        h.controller
            .handle_control_event(ControlEvent::Dial { url: Some(url) })
            .await;
        assert_eq!(h.controller.state(), CallState::Dialing);
        assert!(wait_until(Duration::from_secs(2), || h.slot.is_busy()));

        let started = Instant::now();
        h.controller.handle_control_event(ControlEvent::Hangup).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.controller.state(), CallState::Idle);
        assert!(!h.slot.is_busy());
        assert!(h.controller.dialing.is_none());
        assert!(wait_until(Duration::from_secs(2), || {
            h.backend.sink_log.released.load(Ordering::SeqCst)
        }));

        // The cancelled attempt never reports back
        assert!(
            tokio::time::timeout(Duration::from_millis(300), h.outcomes.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_events_are_ignored_and_remote_stop_hangs_up() {
        let mut h = harness(true).await;
        let url = echo_server().await;
        h.dial(Some(url)).await;
        let id = h.controller.session.as_ref().map(StreamSession::id).unwrap();

        h.controller
            .handle_link_event(LinkEvent {
                session: uuid::Uuid::new_v4(),
                event: NetEvent::Disconnected,
            })
            .await;
        assert_eq!(h.controller.state(), CallState::InCall);

        h.controller
            .handle_link_event(LinkEvent {
                session: id,
                event: NetEvent::StreamStopped,
            })
            .await;
        assert_eq!(h.controller.state(), CallState::Idle);
        assert!(h.controller.session.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lost_capture_fails_the_call() {
        let mut h = harness(true).await;
        let url = echo_server().await;
        h.dial(Some(url)).await;
        assert_eq!(h.controller.state(), CallState::InCall);
        let id = h.controller.session.as_ref().map(StreamSession::id).unwrap();
        assert_eq!(next_status(&h.ui).await["state"], "dialing");
        assert_eq!(next_status(&h.ui).await["state"], "in_call");

        h.controller
            .handle_link_event(LinkEvent {
                session: id,
                event: NetEvent::CaptureLost("device unplugged".into()),
            })
            .await;
        assert_eq!(h.controller.state(), CallState::Failed);
        assert_eq!(next_status(&h.ui).await["state"], "failed");
        assert_eq!(next_status(&h.ui).await["message"], "Call failed");
        assert!(!h.slot.is_busy());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn revoking_permission_ends_the_call() {
        let mut h = harness(true).await;
        let url = echo_server().await;
        h.dial(Some(url)).await;
        assert_eq!(h.controller.state(), CallState::InCall);

        h.controller
            .handle_control_event(ControlEvent::Permission { granted: false })
            .await;
        assert_eq!(h.controller.state(), CallState::Idle);
        assert!(!h.slot.is_busy());
    }
}
