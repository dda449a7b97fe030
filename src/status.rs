// src/status.rs - Status record marshalling and the named-pipe publisher
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, ErrorCode};

/// Published coarse state. The numeric value goes over the status pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StateCode {
    Initializing = 0,
    Idle = 1,
    Home = 2,
    Registering = 3,
    ConfirmingCancel = 4,
    Homing = 5,
    Preparing = 6,
    PressingButton = 7,
    Exposing = 8,
    Separating = 9,
    Approaching = 10,
    PausedByUser = 11,
    Inspecting = 12,
    ConfirmingResume = 13,
    AwaitingCancelation = 14,
    EndingPrint = 15,
    ShowingVersion = 16,
    Calibrating = 17,
    DoorOpen = 18,
    Error = 19,
}

/// Optional refinement of the coarse state, driven by the print data
/// download lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum UiSubState {
    #[default]
    NoSubState = 0,
    Downloading = 1,
    Downloaded = 2,
    DownloadFailed = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusChange {
    NoChange = 0,
    Entering = 1,
    Leaving = 2,
}

/// The sole record consumers ever see. Marshalled little-endian in field
/// declaration order, one record per observable change.
#[derive(Debug, Clone, Copy)]
pub struct PrinterStatus {
    pub state: StateCode,
    pub ui_substate: UiSubState,
    pub change: StatusChange,
    pub current_layer: u32,
    pub num_layers: u32,
    pub estimated_seconds_remaining: u32,
    pub error_code: ErrorCode,
    pub errno: i32,
    pub is_error: bool,
}

/// Marshalled size of one record on the wire.
pub const STATUS_RECORD_LEN: usize = 22;

impl PrinterStatus {
    pub fn new() -> Self {
        Self {
            state: StateCode::Initializing,
            ui_substate: UiSubState::NoSubState,
            change: StatusChange::NoChange,
            current_layer: 0,
            num_layers: 0,
            estimated_seconds_remaining: 0,
            error_code: ErrorCode::Success,
            errno: 0,
            is_error: false,
        }
    }

    pub fn encode(&self) -> [u8; STATUS_RECORD_LEN] {
        let mut buf = [0u8; STATUS_RECORD_LEN];
        buf[0] = self.state as u8;
        buf[1] = self.ui_substate as u8;
        buf[2] = self.change as u8;
        buf[3..7].copy_from_slice(&self.current_layer.to_le_bytes());
        buf[7..11].copy_from_slice(&self.num_layers.to_le_bytes());
        buf[11..15].copy_from_slice(&self.estimated_seconds_remaining.to_le_bytes());
        buf[15..17].copy_from_slice(&self.error_code.as_u16().to_le_bytes());
        buf[17..21].copy_from_slice(&self.errno.to_le_bytes());
        buf[21] = self.is_error as u8;
        buf
    }
}

impl Default for PrinterStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes whole status records to a named FIFO, never blocking the engine.
///
/// Both ends are opened here so writes succeed before a consumer attaches;
/// once the pipe fills, further records are dropped silently (the consumer
/// is responsible for keeping up).
pub struct StatusPipe {
    path: PathBuf,
    pipe: File,
}

impl StatusPipe {
    pub fn create(path: &Path) -> Result<Self, EngineError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(EngineError::StatusPipe)?;
        }
        mkfifo(path).map_err(EngineError::StatusPipe)?;
        // Opening read+write keeps a reader on the pipe so writes never see
        // ENXIO, and O_NONBLOCK keeps a full pipe from stalling the loop.
        let pipe = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(EngineError::StatusPipe)?;
        Ok(Self {
            path: path.to_path_buf(),
            pipe,
        })
    }

    /// Write one whole record in a single `write` call. Short or failed
    /// writes drop the record; PIPE_BUF guarantees whole-record atomicity
    /// for everything that does land.
    pub fn write_record(&mut self, status: &PrinterStatus) {
        let buf = status.encode();
        match self.pipe.write(&buf) {
            Ok(n) if n == buf.len() => {}
            Ok(n) => tracing::warn!("short status write: {n} of {} bytes", buf.len()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tracing::debug!("status pipe full, record dropped");
            }
            Err(e) => tracing::warn!("status write failed: {e}"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StatusPipe {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub(crate) fn mkfifo(path: &Path) -> std::io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // 0666 so unprivileged consumers can attach
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o666) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
    }
    Ok(())
}
