//! Virtual terminal with line editing over a channel byte stream.
//!
//! There is no operating-system pty behind this. Input bytes arrive from the
//! channel dispatcher, are echoed and edited here, and complete lines are
//! handed to the pseudo-shell. All output, echo included, passes through the
//! terminal's [`Recording`] before it is queued for the wire.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use crate::Window;
use crate::dispatcher::ChannelOutput;
use crate::recorder::Recording;

/// Longest line the terminal will buffer. Further input is dropped.
pub const MAX_LINE_LEN: usize = 4096;

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const CTRL_U: u8 = 0x15;
const ESC: u8 = 0x1b;
const DEL: u8 = 0x7f;

/// Reasons a terminal can no longer produce lines.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalError {
    /// The channel went away.
    #[error("terminal closed")]
    Closed,

    /// The client sent end-of-input (Ctrl-D on an empty line).
    #[error("end of input")]
    EndOfInput,
}

/// Input delivered to a terminal, in channel order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalInput {
    /// Raw bytes typed by the client.
    Data(Bytes),
    /// New window geometry from a `window-change` request.
    Resize(Window),
}

/// A line-oriented terminal the pseudo-shell talks to.
#[async_trait]
pub trait LineTerminal: Send {
    /// Prints the prompt and waits for one complete line of input.
    async fn read_line(&mut self) -> Result<String, TerminalError>;

    /// Writes output. Lone `\n` is translated as the terminal requires.
    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError>;
}

/// Output half of a terminal: the recording sink in front of the channel.
pub struct TerminalOutput {
    tx: mpsc::UnboundedSender<ChannelOutput>,
    recording: Box<dyn Recording>,
}

impl TerminalOutput {
    /// Wraps a channel output queue with a recording.
    pub fn new(tx: mpsc::UnboundedSender<ChannelOutput>, recording: Box<dyn Recording>) -> Self {
        Self { tx, recording }
    }

    /// Records and queues raw bytes for the client.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        if data.is_empty() {
            return Ok(());
        }
        self.recording.output(data);
        self.tx
            .send(ChannelOutput::Data(Bytes::copy_from_slice(data)))
            .map_err(|_| TerminalError::Closed)
    }

    fn record_input(&mut self, data: &[u8]) {
        self.recording.input(data);
    }

    fn record_resize(&mut self, window: Window) {
        self.recording.resize(window);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Esc,
    Sequence,
}

/// Line-editing terminal bound to one channel.
pub struct VirtualTerminal {
    prompt: String,
    window: Window,
    output: TerminalOutput,
    input: mpsc::UnboundedReceiver<TerminalInput>,
    pending: VecDeque<u8>,
    line: String,
    utf8: Vec<u8>,
    escape: Escape,
    after_cr: bool,
}

impl VirtualTerminal {
    /// Creates a terminal reading from `input` and writing to `output`.
    pub fn new(
        prompt: impl Into<String>,
        window: Window,
        output: TerminalOutput,
        input: mpsc::UnboundedReceiver<TerminalInput>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            window,
            output,
            input,
            pending: VecDeque::new(),
            line: String::new(),
            utf8: Vec::new(),
            escape: Escape::None,
            after_cr: false,
        }
    }

    /// Returns the current window geometry.
    pub fn size(&self) -> Window {
        self.window
    }

    /// Changes the window geometry.
    pub fn set_size(&mut self, window: Window) {
        trace!(width = window.width, height = window.height, "Terminal resized");
        self.window = window;
        self.output.record_resize(window);
    }

    fn echo(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        self.output.write_raw(data)
    }

    fn push_char(&mut self, c: char) -> Result<(), TerminalError> {
        if self.line.chars().count() >= MAX_LINE_LEN {
            return Ok(());
        }
        self.line.push(c);
        let mut buf = [0u8; 4];
        let encoded = c.encode_utf8(&mut buf);
        self.echo(encoded.as_bytes())
    }

    fn erase_chars(&mut self, count: usize) -> Result<(), TerminalError> {
        for _ in 0..count {
            if self.line.pop().is_none() {
                break;
            }
            self.echo(b"\x08 \x08")?;
        }
        Ok(())
    }

    /// Feeds one input byte. Returns a line once Enter is seen.
    fn handle_byte(&mut self, byte: u8) -> Result<Option<String>, TerminalError> {
        let after_cr = std::mem::replace(&mut self.after_cr, false);

        match self.escape {
            Escape::Esc => {
                self.escape = if byte == b'[' || byte == b'O' {
                    Escape::Sequence
                } else {
                    Escape::None
                };
                return Ok(None);
            }
            Escape::Sequence => {
                if (0x40..=0x7e).contains(&byte) {
                    self.escape = Escape::None;
                }
                return Ok(None);
            }
            Escape::None => {}
        }

        if byte.is_ascii() {
            // A partial multibyte sequence cut off by ASCII is abandoned.
            self.utf8.clear();
        }

        match byte {
            b'\r' => {
                self.after_cr = true;
                self.finish_line().map(Some)
            }
            b'\n' if after_cr => Ok(None),
            b'\n' => self.finish_line().map(Some),
            BACKSPACE | DEL => {
                self.erase_chars(1)?;
                Ok(None)
            }
            CTRL_C => {
                self.line.clear();
                self.echo(b"^C\r\n")?;
                let prompt = self.prompt.clone();
                self.echo(prompt.as_bytes())?;
                Ok(None)
            }
            CTRL_D if self.line.is_empty() => Err(TerminalError::EndOfInput),
            CTRL_U => {
                let count = self.line.chars().count();
                self.erase_chars(count)?;
                Ok(None)
            }
            ESC => {
                self.escape = Escape::Esc;
                Ok(None)
            }
            0x00..=0x1f => Ok(None),
            0x20..=0x7e => {
                self.push_char(byte as char)?;
                Ok(None)
            }
            _ => {
                self.utf8.push(byte);
                self.decode_utf8()?;
                Ok(None)
            }
        }
    }

    /// Emits every complete character buffered in `utf8`. Invalid bytes are
    /// dropped; an incomplete tail stays buffered.
    fn decode_utf8(&mut self) -> Result<(), TerminalError> {
        while !self.utf8.is_empty() {
            let (valid, skip) = match std::str::from_utf8(&self.utf8) {
                Ok(s) => (s.len(), 0),
                Err(e) => match e.error_len() {
                    Some(len) => (e.valid_up_to(), len),
                    None if e.valid_up_to() == 0 => return Ok(()),
                    None => (e.valid_up_to(), 0),
                },
            };
            let decoded: Vec<u8> = self.utf8.drain(..valid + skip).take(valid).collect();
            for c in String::from_utf8_lossy(&decoded).chars() {
                self.push_char(c)?;
            }
        }
        Ok(())
    }

    fn finish_line(&mut self) -> Result<String, TerminalError> {
        self.utf8.clear();
        self.echo(b"\r\n")?;
        Ok(std::mem::take(&mut self.line))
    }
}

#[async_trait]
impl LineTerminal for VirtualTerminal {
    async fn read_line(&mut self) -> Result<String, TerminalError> {
        let prompt = self.prompt.clone();
        self.output.write_raw(prompt.as_bytes())?;

        loop {
            while let Some(byte) = self.pending.pop_front() {
                if let Some(line) = self.handle_byte(byte)? {
                    return Ok(line);
                }
            }

            match self.input.recv().await {
                Some(TerminalInput::Data(data)) => {
                    self.output.record_input(&data);
                    self.pending.extend(data.iter().copied());
                }
                Some(TerminalInput::Resize(window)) => self.set_size(window),
                None => return Err(TerminalError::Closed),
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        let mut translated = Vec::with_capacity(data.len() + 8);
        let mut prev = 0u8;
        for &b in data {
            if b == b'\n' && prev != b'\r' {
                translated.push(b'\r');
            }
            translated.push(b);
            prev = b;
        }
        self.output.write_raw(&translated)
    }
}
