//! Session loop for one PBX connection, and the reconnect loop around it.

use std::fmt;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use callwatch_protocol::{
    Action, AmiCodec, AmiEvent, AmiFrame, AmiMessage, Inbound, Response, ACTION_ID_INIT_CHANNELS,
    ACTION_ID_INIT_PEERS, ACTION_ID_POLL,
};

use super::{AmiControl, AmiError};
use crate::config::PbxConfig;
use crate::engine::EngineHandle;

/// Time allowed for the Logoff to go out on shutdown.
const LOGOFF_TIMEOUT: Duration = Duration::from_secs(1);

type FrameReader = FramedRead<OwnedReadHalf, AmiCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, AmiCodec>;

/// How a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The daemon is shutting down
    Shutdown,
    /// A client asked for a fresh session
    ReconnectRequested,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "shutdown"),
            Self::ReconnectRequested => write!(f, "reconnect requested"),
        }
    }
}

// ============================================================================
// Connection Manager
// ============================================================================

pub struct ConnectionManager {
    config: PbxConfig,
    engine: EngineHandle,
    control: mpsc::Receiver<AmiControl>,
    /// False once every `AmiHandle` is dropped
    control_open: bool,
    cancel: CancellationToken,
    last_connection_id: u64,
}

impl ConnectionManager {
    pub fn new(
        config: PbxConfig,
        engine: EngineHandle,
        control: mpsc::Receiver<AmiControl>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            engine,
            control,
            control_open: true,
            cancel,
            last_connection_id: 0,
        }
    }

    /// Connects, runs the session and reconnects until cancelled.
    pub async fn run(mut self) {
        info!(addr = %self.config.address(), "Connection manager starting");

        while !self.cancel.is_cancelled() {
            self.last_connection_id += 1;
            let connection_id = self.last_connection_id;

            match self.run_session(connection_id).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::ReconnectRequested) => {
                    info!(connection_id, "Reconnecting on request");
                    continue;
                }
                Err(AmiError::EngineClosed) => {
                    debug!("Engine gone, connection manager stopping");
                    break;
                }
                Err(e) => {
                    warn!(connection_id, error = %e, "PBX session ended");
                }
            }

            if !self.wait_before_reconnect().await {
                break;
            }
        }

        info!("Connection manager stopped");
    }

    /// Sleeps for the reconnect delay. A reconnect request cuts the wait
    /// short. Returns false on shutdown.
    async fn wait_before_reconnect(&mut self) -> bool {
        let resume_at = Instant::now() + self.config.reconnect_delay();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = sleep_until(resume_at) => return true,
                msg = self.control.recv(), if self.control_open => match msg {
                    Some(AmiControl::Reconnect) => return true,
                    Some(AmiControl::Poll) => debug!("Not connected, ignoring poll request"),
                    None => self.control_open = false,
                },
            }
        }
    }

    async fn run_session(&mut self, connection_id: u64) -> Result<SessionEnd, AmiError> {
        let addr = self.config.address();
        let connect = timeout(self.config.connect_timeout(), TcpStream::connect(&addr));
        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(SessionEnd::Shutdown),
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => return Err(AmiError::Connect { addr, source }),
                Err(_) => return Err(AmiError::ConnectTimeout { addr }),
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "Failed to set TCP_NODELAY");
        }
        debug!(connection_id, addr = %addr, "Connected to PBX");

        self.engine
            .link_up(connection_id)
            .await
            .map_err(|_| AmiError::EngineClosed)?;

        let (read_half, write_half) = stream.into_split();
        let mut session = Session {
            connection_id,
            config: &self.config,
            engine: &self.engine,
            reader: FramedRead::new(read_half, AmiCodec::new()),
            writer: FramedWrite::new(write_half, AmiCodec::new()),
            authenticated: false,
            heartbeat: None,
            poll: None,
            bootstrap_at: None,
            listing: None,
        };
        let result = session
            .drive(&mut self.control, &mut self.control_open, &self.cancel)
            .await;

        let reason = match &result {
            Ok(end) => end.to_string(),
            Err(e) => e.to_string(),
        };
        let _ = self.engine.link_down(connection_id, reason).await;
        result
    }
}

// ============================================================================
// Session
// ============================================================================

/// State that lives exactly as long as one TCP connection.
struct Session<'a> {
    connection_id: u64,
    config: &'a PbxConfig,
    engine: &'a EngineHandle,
    reader: FrameReader,
    writer: FrameWriter,
    authenticated: bool,
    heartbeat: Option<Interval>,
    poll: Option<Interval>,
    /// When the initial channel listing is due
    bootstrap_at: Option<Instant>,
    /// ActionID of the channel listing still streaming in
    listing: Option<String>,
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn periodic(every: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl Session<'_> {
    async fn drive(
        &mut self,
        control: &mut mpsc::Receiver<AmiControl>,
        control_open: &mut bool,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, AmiError> {
        let idle_timeout = self.config.idle_timeout();
        let mut idle_deadline = Instant::now() + idle_timeout;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if self.authenticated {
                        let _ = timeout(LOGOFF_TIMEOUT, self.writer.send(Action::logoff())).await;
                    }
                    return Ok(SessionEnd::Shutdown);
                }

                frame = self.reader.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(AmiError::Closed),
                    };
                    idle_deadline = Instant::now() + idle_timeout;
                    self.handle_frame(frame).await?;
                }

                _ = sleep_until(idle_deadline) => {
                    return Err(AmiError::IdleTimeout { secs: idle_timeout.as_secs() });
                }

                msg = control.recv(), if *control_open => match msg {
                    Some(AmiControl::Reconnect) => return Ok(SessionEnd::ReconnectRequested),
                    Some(AmiControl::Poll) => {
                        if self.authenticated {
                            self.request_channels(ACTION_ID_POLL).await?;
                        } else {
                            debug!(connection_id = self.connection_id, "Not logged in, ignoring poll request");
                        }
                    }
                    None => *control_open = false,
                },

                _ = tick(&mut self.heartbeat), if self.heartbeat.is_some() => {
                    trace!(connection_id = self.connection_id, "Heartbeat");
                    self.writer.send(Action::ping()).await?;
                }

                _ = tick(&mut self.poll), if self.poll.is_some() => {
                    self.request_channels(ACTION_ID_POLL).await?;
                }

                _ = sleep_until(self.bootstrap_at.unwrap_or_else(Instant::now)), if self.bootstrap_at.is_some() => {
                    self.bootstrap_at = None;
                    self.request_channels(ACTION_ID_INIT_CHANNELS).await?;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: AmiFrame) -> Result<(), AmiError> {
        match frame {
            AmiFrame::Banner(banner) => {
                debug!(connection_id = self.connection_id, banner = %banner, "PBX banner received");
                let login = Action::login(&self.config.username, &self.config.secret);
                self.writer.send(login).await?;
                Ok(())
            }
            AmiFrame::Message(msg) => self.handle_message(&msg).await,
        }
    }

    async fn handle_message(&mut self, msg: &AmiMessage) -> Result<(), AmiError> {
        match Inbound::classify(msg) {
            Inbound::Response(Response::AuthAccepted) => self.on_authenticated().await,
            Inbound::Response(Response::AuthRejected { message }) => {
                self.engine
                    .auth_failed(self.connection_id, message.clone())
                    .await
                    .map_err(|_| AmiError::EngineClosed)?;
                Err(AmiError::AuthRejected(message))
            }
            Inbound::Response(Response::Error { action_id, message }) => {
                if action_id.is_some() && action_id == self.listing {
                    self.listing = None;
                }
                warn!(
                    connection_id = self.connection_id,
                    action_id = action_id.as_deref().unwrap_or(""),
                    message = %message,
                    "PBX returned an error"
                );
                Ok(())
            }
            Inbound::Response(Response::Success { action_id, .. }) => {
                trace!(action_id = action_id.as_deref().unwrap_or(""), "Action succeeded");
                Ok(())
            }
            Inbound::Event(AmiEvent::Unknown(name)) => {
                trace!(event = %name, "Ignoring event");
                Ok(())
            }
            Inbound::Event(event) => {
                if matches!(event, AmiEvent::CoreShowChannelsComplete) {
                    self.listing = None;
                }
                self.engine
                    .protocol_event(self.connection_id, event)
                    .await
                    .map_err(|_| AmiError::EngineClosed)
            }
            Inbound::Other => {
                trace!(fields = msg.len(), "Ignoring message without Response or Event");
                Ok(())
            }
        }
    }

    async fn on_authenticated(&mut self) -> Result<(), AmiError> {
        self.authenticated = true;
        self.engine
            .authenticated(self.connection_id)
            .await
            .map_err(|_| AmiError::EngineClosed)?;

        self.writer
            .send(Action::sip_peers().with_action_id(ACTION_ID_INIT_PEERS))
            .await?;

        self.heartbeat = Some(periodic(self.config.heartbeat_interval()));
        self.poll = Some(periodic(self.config.poll_interval()));
        self.bootstrap_at = Some(Instant::now() + self.config.channel_bootstrap_delay());
        Ok(())
    }

    /// Opens a reconciliation pass and asks for the channel listing.
    ///
    /// Does nothing while an earlier listing is still streaming, since
    /// reopening the pass would drop the rows already collected.
    async fn request_channels(&mut self, action_id: &str) -> Result<(), AmiError> {
        if let Some(outstanding) = &self.listing {
            debug!(
                connection_id = self.connection_id,
                outstanding = %outstanding,
                requested = action_id,
                "Channel listing still in progress, skipping"
            );
            return Ok(());
        }
        self.engine
            .begin_reconciliation(self.connection_id)
            .await
            .map_err(|_| AmiError::EngineClosed)?;
        self.writer
            .send(Action::core_show_channels().with_action_id(action_id))
            .await?;
        self.listing = Some(action_id.to_string());
        Ok(())
    }
}
