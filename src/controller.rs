//! Session controller.
//!
//! One controller instance per UI session owns every resource of the active
//! attempt: capture handle, output handle, playback scheduler, and transport.
//! It runs as an actor task so that all state transitions happen on one
//! loop; producers reach it only through typed events, and the hosting UI
//! only through `start`/`stop` and the read-only status stream.
//!
//! Each attempt gets a monotonically increasing epoch. Capture blocks and
//! inbound messages tagged with a stale epoch are dropped without effect,
//! which formalizes the "send racing teardown" case instead of relying on
//! swallowed errors.

use crate::capture::{CaptureConfig, CaptureError, CaptureHandle, CaptureSource};
use crate::config::EngineConfig;
use crate::context::ConversationContext;
use crate::events::{EngineEvent, ServerEvent, SessionState, SessionStatus};
use crate::pcm::{self, AudioChunk};
use crate::playback::{OutputDevice, OutputHandle, PlaybackScheduler};
use crate::transport::{Connector, SessionSetup, TransportHandle};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

enum Command {
    Start(ConversationContext),
    Stop(oneshot::Sender<()>),
}

enum StartOutcome {
    Proceed(ConversationContext),
    Abandon,
    Shutdown,
}

enum Wake {
    Cmd(Option<Command>),
    Event(Option<EngineEvent>),
}

enum Verdict {
    Continue,
    Ended(SessionState),
}

/// Public handle on the session engine.
pub struct SessionController {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<SessionStatus>,
    _task: JoinHandle<()>,
}

impl SessionController {
    pub fn new(
        config: EngineConfig,
        capture: Arc<dyn CaptureSource>,
        output: Arc<dyn OutputDevice>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::idle());
        let runner = Runner {
            config,
            capture,
            output,
            connector,
            cmd_rx,
            evt_tx,
            evt_rx,
            status_tx: Arc::new(status_tx),
            epoch: 0,
        };
        let task = tokio::spawn(runner.run());
        Self {
            cmd_tx,
            status_rx,
            _task: task,
        }
    }

    /// Request a session. Rapid duplicate requests coalesce into one; a
    /// request while a session is connecting or connected is a no-op.
    pub fn start(&self, context: ConversationContext) {
        let _ = self.cmd_tx.send(Command::Start(context));
    }

    /// Tear the session down and wait until teardown has finished. Safe
    /// from any state, including mid-connect (the pending connect is
    /// cancelled rather than awaited).
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Read-only `{state, is_audible}` stream for the hosting UI.
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }
}

/// Resources of one connected session; created at start, destroyed at stop
/// or on reaching a terminal error state. Nothing outlives one attempt.
struct ActiveSession {
    epoch: u64,
    capture: Box<dyn CaptureHandle>,
    output: Box<dyn OutputHandle>,
    scheduler: PlaybackScheduler,
    transport: Option<TransportHandle>,
    audible_task: JoinHandle<()>,
}

struct Runner {
    config: EngineConfig,
    capture: Arc<dyn CaptureSource>,
    output: Arc<dyn OutputDevice>,
    connector: Arc<dyn Connector>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    evt_tx: mpsc::UnboundedSender<EngineEvent>,
    evt_rx: mpsc::UnboundedReceiver<EngineEvent>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    epoch: u64,
}

impl Runner {
    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                cmd = self.cmd_rx.recv() => Wake::Cmd(cmd),
                event = self.evt_rx.recv() => Wake::Event(event),
            };
            match wake {
                Wake::Cmd(Some(Command::Start(context))) => {
                    match self.coalesce_start(context).await {
                        StartOutcome::Proceed(context) => self.run_session(context).await,
                        StartOutcome::Abandon => self.set_state(SessionState::Idle),
                        StartOutcome::Shutdown => return,
                    }
                }
                Wake::Cmd(Some(Command::Stop(ack))) => {
                    // Nothing is running; "close" from a terminal state
                    // just returns the UI to idle.
                    self.set_state(SessionState::Idle);
                    let _ = ack.send(());
                }
                Wake::Event(Some(_)) => {
                    // Stale event from a torn-down attempt; dropped.
                }
                Wake::Cmd(None) | Wake::Event(None) => return,
            }
        }
    }

    /// Absorb duplicate start intents for a short window; only the most
    /// recent one proceeds to acquire any resource.
    async fn coalesce_start(&mut self, first: ConversationContext) -> StartOutcome {
        let mut context = first;
        let window = sleep(self.config.start_debounce);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => return StartOutcome::Proceed(context),
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Start(next)) => context = next,
                    Some(Command::Stop(ack)) => {
                        let _ = ack.send(());
                        return StartOutcome::Abandon;
                    }
                    None => return StartOutcome::Shutdown,
                },
            }
        }
    }

    async fn run_session(&mut self, context: ConversationContext) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.set_state(SessionState::Connecting);
        info!(epoch, subject = %context.subject, "session connecting");

        // Acquire devices before touching the network, in the mirror order
        // of teardown: output first, then the microphone.
        let scheduler = PlaybackScheduler::new(self.config.playback_rate);
        let mut output = match self.output.open(&scheduler, self.config.playback_rate) {
            Ok(handle) => handle,
            Err(e) => {
                error!("output device unavailable: {e}");
                self.set_state(SessionState::Error);
                return;
            }
        };

        let capture_config = CaptureConfig {
            sample_rate: self.config.capture_rate,
            block_frames: self.config.capture_block,
            device_name: self.config.device_name.clone(),
        };
        let mut capture = match self.capture.open(&capture_config, epoch, self.evt_tx.clone()) {
            Ok(handle) => handle,
            Err(CaptureError::PermissionDenied) => {
                warn!("microphone permission denied");
                output.close();
                self.set_state(SessionState::PermissionDenied);
                return;
            }
            Err(e) => {
                error!("capture device failed to open: {e}");
                output.close();
                self.set_state(SessionState::Error);
                return;
            }
        };

        let setup = SessionSetup {
            model: self.config.model.clone(),
            system_instruction: context.system_instruction(),
            capture_rate: self.config.capture_rate,
            playback_rate: self.config.playback_rate,
        };
        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(setup, epoch, self.evt_tx.clone()),
        );
        tokio::pin!(connect);

        // Race the pending connect against stop; dropping the future
        // cancels the attempt instead of waiting for it to resolve.
        let transport = loop {
            enum ConnectWake {
                Done(Result<Result<TransportHandle, crate::transport::ConnectError>, tokio::time::error::Elapsed>),
                Cmd(Option<Command>),
            }
            let wake = tokio::select! {
                result = &mut connect => ConnectWake::Done(result),
                cmd = self.cmd_rx.recv() => ConnectWake::Cmd(cmd),
            };
            match wake {
                ConnectWake::Done(Ok(Ok(transport))) => break transport,
                ConnectWake::Done(Ok(Err(e))) => {
                    error!("connect failed: {e}");
                    capture.close();
                    output.close();
                    self.set_state(SessionState::Error);
                    return;
                }
                ConnectWake::Done(Err(_)) => {
                    error!("connect timed out");
                    capture.close();
                    output.close();
                    self.set_state(SessionState::Error);
                    return;
                }
                // Already connecting; a duplicate start is a no-op.
                ConnectWake::Cmd(Some(Command::Start(_))) => {}
                ConnectWake::Cmd(Some(Command::Stop(ack))) => {
                    info!(epoch, "stop during connect, cancelling");
                    capture.close();
                    scheduler.interrupt();
                    output.close();
                    self.set_state(SessionState::Idle);
                    let _ = ack.send(());
                    return;
                }
                ConnectWake::Cmd(None) => {
                    capture.close();
                    output.close();
                    return;
                }
            }
        };

        // Forward the scheduler's audible edge into the status stream for
        // the life of this session.
        let mut audible_rx = scheduler.audible();
        let status_tx = self.status_tx.clone();
        let audible_task = tokio::spawn(async move {
            while audible_rx.changed().await.is_ok() {
                let audible = *audible_rx.borrow();
                status_tx.send_modify(|status| status.is_audible = audible);
            }
        });

        let mut session = ActiveSession {
            epoch,
            capture,
            output,
            scheduler,
            transport: Some(transport),
            audible_task,
        };
        self.set_state(SessionState::Connected);
        info!(epoch, "session connected");

        loop {
            let wake = tokio::select! {
                cmd = self.cmd_rx.recv() => Wake::Cmd(cmd),
                event = self.evt_rx.recv() => Wake::Event(event),
            };
            match wake {
                // Guard against duplicate sessions from re-entrant starts.
                Wake::Cmd(Some(Command::Start(_))) => {}
                Wake::Cmd(Some(Command::Stop(ack))) => {
                    self.teardown(session).await;
                    self.set_state(SessionState::Idle);
                    let _ = ack.send(());
                    return;
                }
                Wake::Event(Some(event)) => match self.dispatch(&mut session, event) {
                    Verdict::Continue => {}
                    Verdict::Ended(state) => {
                        self.teardown(session).await;
                        self.set_state(state);
                        return;
                    }
                },
                Wake::Cmd(None) | Wake::Event(None) => {
                    self.teardown(session).await;
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, session: &mut ActiveSession, event: EngineEvent) -> Verdict {
        match event {
            EngineEvent::Captured { epoch, samples } => {
                if epoch != session.epoch {
                    return Verdict::Continue;
                }
                let chunk = AudioChunk::new(pcm::encode(&samples), self.config.capture_rate);
                if let Some(transport) = session.transport.as_ref() {
                    transport.send_audio(chunk);
                }
                Verdict::Continue
            }
            EngineEvent::Inbound { epoch, event } => {
                if epoch != session.epoch {
                    return Verdict::Continue;
                }
                match event {
                    ServerEvent::Audio(chunk) => {
                        if let Err(e) = session.scheduler.enqueue(&chunk) {
                            let dropped = session.scheduler.dropped_chunks();
                            warn!(dropped, "dropped undecodable reply chunk: {e}");
                        }
                        Verdict::Continue
                    }
                    ServerEvent::Interrupted => {
                        debug!("remote barge-in, flushing playback");
                        session.scheduler.interrupt();
                        Verdict::Continue
                    }
                    ServerEvent::Closed => {
                        info!("remote ended the session");
                        Verdict::Ended(SessionState::Idle)
                    }
                    ServerEvent::Error(reason) => {
                        error!("transport error: {reason}");
                        Verdict::Ended(SessionState::Error)
                    }
                }
            }
            EngineEvent::CaptureLost { epoch, reason } => {
                if epoch != session.epoch {
                    return Verdict::Continue;
                }
                error!("capture stream lost: {reason}");
                Verdict::Ended(SessionState::Error)
            }
        }
    }

    /// Fixed teardown order: stop capture first so no further sends can be
    /// produced, silence playback, await the transport close, and only then
    /// release the output device so no late enqueue races a closing
    /// scheduler.
    async fn teardown(&mut self, mut session: ActiveSession) {
        session.capture.close();
        session.scheduler.interrupt();
        if let Some(transport) = session.transport.take() {
            transport.close().await;
        }
        session.audible_task.abort();
        session.output.close();
        self.status_tx.send_modify(|status| status.is_audible = false);
        debug!(epoch = session.epoch, "session torn down");
    }

    fn set_state(&self, state: SessionState) {
        self.status_tx.send_modify(|status| {
            status.state = state;
            if state != SessionState::Connected {
                status.is_audible = false;
            }
        });
    }
}
