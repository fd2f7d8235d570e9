//! Terminal recording sinks.
//!
//! Every byte that crosses a pseudo-terminal is mirrored into a
//! [`Recording`] so sessions can be replayed exactly as the client saw them.
//! [`AsciicastRecorder`] writes one asciicast v2 file per channel.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::Window;

/// Metadata describing a terminal at the moment recording starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingHeader {
    /// Width in characters.
    pub width: u32,
    /// Height in characters.
    pub height: u32,
    /// Terminal type name.
    pub term: String,
    /// Label identifying the session and channel.
    pub label: String,
}

/// An open recording for one terminal.
pub trait Recording: Send {
    /// Records bytes written to the client.
    fn output(&mut self, data: &[u8]);

    /// Records bytes received from the client.
    fn input(&mut self, data: &[u8]);

    /// Records a terminal resize.
    fn resize(&mut self, _window: Window) {}
}

/// Factory for [`Recording`]s.
pub trait TerminalRecorder: Send + Sync {
    /// Opens a recording for a newly created terminal.
    fn open(&self, header: &RecordingHeader) -> Box<dyn Recording>;
}

/// Recorder that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRecorder;

impl Recording for NullRecorder {
    fn output(&mut self, _data: &[u8]) {}

    fn input(&mut self, _data: &[u8]) {}
}

impl TerminalRecorder for NullRecorder {
    fn open(&self, _header: &RecordingHeader) -> Box<dyn Recording> {
        Box::new(Self)
    }
}

// -----------------------------------------------------------------------------
// Asciicast
// -----------------------------------------------------------------------------

#[derive(Serialize)]
struct CastEnv<'a> {
    #[serde(rename = "TERM")]
    term: &'a str,
}

#[derive(Serialize)]
struct CastHeader<'a> {
    version: u8,
    width: u32,
    height: u32,
    timestamp: i64,
    title: &'a str,
    env: CastEnv<'a>,
}

/// Writes asciicast v2 recordings into a directory.
#[derive(Debug, Clone)]
pub struct AsciicastRecorder {
    dir: PathBuf,
}

impl AsciicastRecorder {
    /// Creates a recorder writing into `dir`. The directory must exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(header: &RecordingHeader) -> String {
        let label: String = header
            .label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!("{}-{label}.cast", Utc::now().format("%Y%m%dT%H%M%S%.3f"))
    }
}

impl TerminalRecorder for AsciicastRecorder {
    fn open(&self, header: &RecordingHeader) -> Box<dyn Recording> {
        let path = self.dir.join(Self::file_name(header));
        match File::create(&path) {
            Ok(file) => {
                debug!(path = %path.display(), "Recording terminal session");
                Box::new(AsciicastRecording::new(BufWriter::new(file), header))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot create recording file");
                Box::new(NullRecorder)
            }
        }
    }
}

/// An asciicast v2 stream over any writer.
///
/// Write failures disable the recording; they never reach the session.
pub struct AsciicastRecording<W: Write + Send> {
    writer: Option<W>,
    started: Instant,
}

impl<W: Write + Send> AsciicastRecording<W> {
    /// Starts a recording, writing the header line immediately.
    pub fn new(writer: W, header: &RecordingHeader) -> Self {
        let mut recording = Self {
            writer: Some(writer),
            started: Instant::now(),
        };
        let cast_header = CastHeader {
            version: 2,
            width: header.width,
            height: header.height,
            timestamp: Utc::now().timestamp(),
            title: &header.label,
            env: CastEnv { term: &header.term },
        };
        match serde_json::to_string(&cast_header) {
            Ok(line) => recording.write_line(&line),
            Err(e) => warn!(error = %e, "Cannot encode recording header"),
        }
        recording
    }

    /// Consumes the recording and returns the writer, if still healthy.
    pub fn into_inner(mut self) -> Option<W> {
        self.writer.take()
    }

    fn event(&mut self, code: &str, data: &str) {
        if self.writer.is_none() {
            return;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        match serde_json::to_string(&(elapsed, code, data)) {
            Ok(line) => self.write_line(&line),
            Err(e) => warn!(error = %e, "Cannot encode recording event"),
        }
    }

    fn write_line(&mut self, line: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            warn!(error = %e, "Recording write failed, disabling recording");
            self.writer = None;
        }
    }
}

impl<W: Write + Send> Recording for AsciicastRecording<W> {
    fn output(&mut self, data: &[u8]) {
        self.event("o", &String::from_utf8_lossy(data));
    }

    fn input(&mut self, data: &[u8]) {
        self.event("i", &String::from_utf8_lossy(data));
    }

    fn resize(&mut self, window: Window) {
        self.event("r", &format!("{}x{}", window.width, window.height));
    }
}
