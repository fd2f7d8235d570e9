//! Per-channel request state machine.
//!
//! A [`ChannelDispatcher`] owns one logical channel: it consumes the
//! channel's events strictly in arrival order, answers every request that
//! wants a reply exactly once, and owns the channel's pty and terminal
//! state. Nothing here is shared with other channels of the same session.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::Window;
use crate::recorder::RecordingHeader;
use crate::request::{
    ChannelRequest, DecodeError, EnvRequest, PtyRequest, RequestKind, WindowChangeRequest,
    decode_single_string,
};
use crate::session::ActivitySignal;
use crate::shell::{Evaluation, PseudoShell, ShellContext, ShellExit, ShellSettings};
use crate::terminal::{TerminalInput, TerminalOutput, VirtualTerminal};

/// Inbound traffic on a channel, in the order the peer sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A channel request.
    Request(ChannelRequest),
    /// Channel data typed by the client.
    Data(Bytes),
}

/// Outbound messages for the transport to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutput {
    /// Positive reply to the pending request.
    Success,
    /// Negative reply to the pending request.
    Failure,
    /// Channel data for the client.
    Data(Bytes),
    /// `exit-status` notification, sent without wanting a reply.
    ExitStatus(u32),
    /// Close the channel.
    Close,
}

/// Why a request was answered negatively.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The payload did not parse.
    #[error("malformed payload: {0}")]
    Decode(#[from] DecodeError),

    /// `window-change` arrived before any terminal existed.
    #[error("no terminal on this channel")]
    NoTerminal,

    /// The request is not allowed while the shell runs.
    #[error("shell already active")]
    ShellActive,
}

/// Terminal state of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// No pty negotiated yet.
    NoPty,
    /// A pty was negotiated; no shell yet.
    PtyNegotiated(PtyRequest),
    /// The shell runs on a live terminal.
    ShellActive {
        /// The pty the terminal was created from. Never changed afterwards.
        pty: PtyRequest,
        /// Current geometry of the live terminal.
        window: Window,
    },
}

impl ChannelState {
    /// Returns the negotiated pty, if any.
    pub fn pty(&self) -> Option<&PtyRequest> {
        match self {
            Self::NoPty => None,
            Self::PtyNegotiated(pty) | Self::ShellActive { pty, .. } => Some(pty),
        }
    }

    /// Returns the live terminal geometry, if a shell runs.
    pub fn terminal_window(&self) -> Option<Window> {
        match self {
            Self::ShellActive { window, .. } => Some(*window),
            _ => None,
        }
    }
}

/// Everything a dispatcher needs from its session.
#[derive(Clone)]
pub struct ChannelContext {
    /// Label for logs and recordings, e.g. `"conn-3/ch-1"`.
    pub label: String,
    /// Authenticated user.
    pub user: String,
    /// Liveness signal for the session watchdog.
    pub activity: ActivitySignal,
    /// Shell configuration.
    pub shell: Arc<ShellSettings>,
    /// Cancelled when the connection goes away.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Finish,
}

enum Step {
    Event(Option<ChannelEvent>),
    ShellDone(Result<ShellExit, tokio::task::JoinError>),
    Cancelled,
}

/// Processes the request stream of one accepted channel.
pub struct ChannelDispatcher {
    ctx: ChannelContext,
    state: ChannelState,
    output: mpsc::UnboundedSender<ChannelOutput>,
    shell_input: Option<mpsc::UnboundedSender<TerminalInput>>,
    shell_task: Option<JoinHandle<ShellExit>>,
}

impl ChannelDispatcher {
    /// Creates a dispatcher writing replies and data to `output`.
    pub fn new(ctx: ChannelContext, output: mpsc::UnboundedSender<ChannelOutput>) -> Self {
        Self {
            ctx,
            state: ChannelState::NoPty,
            output,
            shell_input: None,
            shell_task: None,
        }
    }

    /// Returns the channel's current state.
    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    /// Runs until the event stream ends, the shell exits, or the
    /// connection is cancelled. Always ends with one `exit-status` and one
    /// close.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        debug!(channel = %self.ctx.label, "Channel dispatcher started");
        let cancel = self.ctx.cancel.clone();

        loop {
            let step = match self.shell_task.as_mut() {
                Some(task) => tokio::select! {
                    () = cancel.cancelled() => Step::Cancelled,
                    event = events.recv() => Step::Event(event),
                    exit = task => Step::ShellDone(exit),
                },
                None => tokio::select! {
                    () = cancel.cancelled() => Step::Cancelled,
                    event = events.recv() => Step::Event(event),
                },
            };

            match step {
                Step::Event(Some(event)) => {
                    self.ctx.activity.touch();
                    if self.handle_event(event) == Flow::Finish {
                        break;
                    }
                }
                Step::Event(None) => {
                    debug!(channel = %self.ctx.label, "Request stream ended");
                    break;
                }
                Step::ShellDone(exit) => {
                    self.shell_task = None;
                    debug!(channel = %self.ctx.label, exit = ?exit.ok(), "Shell finished");
                    break;
                }
                Step::Cancelled => {
                    debug!(channel = %self.ctx.label, "Connection cancelled");
                    break;
                }
            }
        }

        self.finish().await;
    }

    fn handle_event(&mut self, event: ChannelEvent) -> Flow {
        match event {
            ChannelEvent::Data(data) => {
                trace!(channel = %self.ctx.label, len = data.len(), "Data received");
                if let Some(input) = &self.shell_input {
                    let _ = input.send(TerminalInput::Data(data));
                }
                Flow::Continue
            }
            ChannelEvent::Request(request) => self.handle_request(request),
        }
    }

    fn handle_request(&mut self, request: ChannelRequest) -> Flow {
        let want_reply = request.want_reply;
        match request.kind() {
            RequestKind::PtyReq => {
                let result = self.on_pty_req(&request.payload);
                self.reply(&request.name, want_reply, result);
            }
            RequestKind::Env => {
                let result = self.on_env(&request.payload);
                self.reply(&request.name, want_reply, result);
            }
            RequestKind::Shell => match self.prepare_shell() {
                Ok(pty) => {
                    self.reply(&request.name, want_reply, Ok(()));
                    self.start_shell(pty);
                }
                Err(e) => self.reply(&request.name, want_reply, Err(e)),
            },
            RequestKind::Exec => match self.prepare_exec(&request.payload) {
                Ok(command) => {
                    self.reply(&request.name, want_reply, Ok(()));
                    self.run_exec(&command);
                    return Flow::Finish;
                }
                Err(e) => self.reply(&request.name, want_reply, Err(e)),
            },
            RequestKind::Subsystem => {
                let result = self.on_subsystem(&request.payload);
                self.reply(&request.name, want_reply, result);
            }
            RequestKind::WindowChange => {
                let result = self.on_window_change(&request.payload);
                self.reply(&request.name, want_reply, result);
            }
            RequestKind::KeepAlive => {
                trace!(channel = %self.ctx.label, request = %request.name, "Keep-alive ignored");
            }
            RequestKind::Unknown => {
                debug!(
                    channel = %self.ctx.label,
                    request = %request.name,
                    "Unknown channel request type"
                );
            }
        }
        Flow::Continue
    }

    fn reply(&self, name: &str, want_reply: bool, result: Result<(), RequestError>) {
        let message = match &result {
            Ok(()) => ChannelOutput::Success,
            Err(e) => {
                warn!(channel = %self.ctx.label, request = name, error = %e, "Request rejected");
                ChannelOutput::Failure
            }
        };
        if want_reply {
            let _ = self.output.send(message);
        }
    }

    fn on_pty_req(&mut self, payload: &[u8]) -> Result<(), RequestError> {
        if matches!(self.state, ChannelState::ShellActive { .. }) {
            return Err(RequestError::ShellActive);
        }
        let pty = PtyRequest::decode(payload)?;
        info!(
            channel = %self.ctx.label,
            user = %self.ctx.user,
            term = %pty.term,
            width = pty.width,
            height = pty.height,
            "User requesting pty"
        );
        self.state = ChannelState::PtyNegotiated(pty);
        Ok(())
    }

    fn on_env(&self, payload: &[u8]) -> Result<(), RequestError> {
        let env = EnvRequest::decode(payload)?;
        info!(
            channel = %self.ctx.label,
            user = %self.ctx.user,
            name = %env.name,
            value = %env.value,
            "User sent environment variable"
        );
        Ok(())
    }

    fn on_subsystem(&self, payload: &[u8]) -> Result<(), RequestError> {
        let name = decode_single_string(payload, "subsystem")?;
        info!(
            channel = %self.ctx.label,
            user = %self.ctx.user,
            subsystem = %name,
            "User requested subsystem"
        );
        Ok(())
    }

    fn on_window_change(&mut self, payload: &[u8]) -> Result<(), RequestError> {
        let ChannelState::ShellActive { window, .. } = &mut self.state else {
            return Err(RequestError::NoTerminal);
        };
        let change = WindowChangeRequest::decode(payload)?;
        *window = change.window();
        trace!(
            channel = %self.ctx.label,
            width = change.width,
            height = change.height,
            "Window change"
        );
        if let Some(input) = &self.shell_input {
            let _ = input.send(TerminalInput::Resize(change.window()));
        }
        Ok(())
    }

    fn prepare_shell(&self) -> Result<PtyRequest, RequestError> {
        match &self.state {
            ChannelState::NoPty => Ok(PtyRequest::default()),
            ChannelState::PtyNegotiated(pty) => Ok(pty.clone()),
            ChannelState::ShellActive { .. } => Err(RequestError::ShellActive),
        }
    }

    fn open_output(&self, pty: &PtyRequest) -> TerminalOutput {
        let recording = self.ctx.shell.recorder.open(&RecordingHeader {
            width: pty.width,
            height: pty.height,
            term: pty.term.clone(),
            label: self.ctx.label.clone(),
        });
        TerminalOutput::new(self.output.clone(), recording)
    }

    fn shell(&self) -> PseudoShell {
        PseudoShell::new(
            ShellContext {
                user: self.ctx.user.clone(),
                hostname: self.ctx.shell.hostname.clone(),
            },
            Arc::clone(&self.ctx.shell.commands),
        )
        .with_label(self.ctx.label.clone())
    }

    fn start_shell(&mut self, pty: PtyRequest) {
        info!(channel = %self.ctx.label, user = %self.ctx.user, "User requesting shell access");

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let mut terminal = VirtualTerminal::new(
            self.ctx.shell.prompt.clone(),
            pty.window(),
            self.open_output(&pty),
            input_rx,
        );
        let shell = self.shell();
        self.shell_task = Some(tokio::spawn(async move { shell.run(&mut terminal).await }));
        self.shell_input = Some(input_tx);
        self.state = ChannelState::ShellActive {
            window: pty.window(),
            pty,
        };
    }

    fn prepare_exec(&self, payload: &[u8]) -> Result<String, RequestError> {
        if matches!(self.state, ChannelState::ShellActive { .. }) {
            return Err(RequestError::ShellActive);
        }
        decode_single_string(payload, "command").map_err(Into::into)
    }

    fn run_exec(&self, command: &str) {
        info!(
            channel = %self.ctx.label,
            user = %self.ctx.user,
            command = %command,
            "User requested exec"
        );
        let pty = self.state.pty().cloned().unwrap_or_default();
        let mut output = self.open_output(&pty);
        if let Evaluation::Output(text) = self.shell().evaluate(command) {
            let _ = output.write_raw(text.as_bytes());
        }
    }

    async fn finish(mut self) {
        // Closing the input ends a running shell's read loop.
        self.shell_input = None;
        if let Some(task) = self.shell_task.take() {
            if let Err(e) = task.await {
                warn!(channel = %self.ctx.label, error = %e, "Shell task failed");
            }
        }

        let _ = self.output.send(ChannelOutput::ExitStatus(0));
        let _ = self.output.send(ChannelOutput::Close);
        debug!(channel = %self.ctx.label, "Channel closed");
    }
}
