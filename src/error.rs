// src/error.rs - Error taxonomy and bring-up errors
use thiserror::Error;

/// Error classification carried in every status record.
///
/// The numeric value is what goes over the status pipe, so variants are
/// append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u16)]
pub enum ErrorCode {
    #[error("no error")]
    Success = 0,

    #[error("motor command failed")]
    MotorError = 1,
    #[error("motor movement timed out")]
    MotorTimeoutError = 2,
    #[error("unknown motor board status")]
    UnknownMotorStatus = 3,
    #[error("front panel reported an error")]
    FrontPanelError = 4,
    #[error("unknown front panel status")]
    UnknownFrontPanelStatus = 5,

    #[error("exposure timer failed")]
    ExposureTimer = 10,
    #[error("motor timeout timer failed")]
    MotorTimeoutTimer = 11,
    #[error("could not read remaining exposure time")]
    RemainingExposure = 12,
    #[error("could not create status pipe")]
    StatusPipeCreation = 13,
    #[error("gpio input failed")]
    GpioInput = 14,

    #[error("no image present for layer")]
    NoImageForLayer = 20,
    #[error("could not show layer image")]
    CantShowImage = 21,
    #[error("could not show black screen")]
    CantShowBlack = 22,

    #[error("no print data available")]
    NoPrintDataAvailable = 30,
    #[error("print data invalid")]
    InvalidPrintData = 31,
    #[error("could not stage print data")]
    PrintDataStageError = 32,
    #[error("could not load print settings from print data")]
    PrintDataSettings = 33,
    #[error("could not move print data into place")]
    PrintDataMove = 34,
    #[error("could not remove old print data")]
    PrintDataRemove = 35,
    #[error("could not load print settings file")]
    CantLoadPrintSettingsFile = 36,
    #[error("print data operation not allowed in this state")]
    IllegalStateForPrintData = 37,

    #[error("separation RPM out of range")]
    SeparationRpmOutOfRange = 40,
    #[error("unrecognized command input")]
    UnknownCommandInput = 41,
    #[error("hardware required but not present")]
    HardwareNeeded = 42,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Unrecoverable bring-up failures. Anything that fails after construction
/// goes through the error handler and the `Error` state instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not create status pipe: {0}")]
    StatusPipe(#[source] std::io::Error),
    #[error("could not create command pipe: {0}")]
    CommandPipe(#[source] std::io::Error),
    #[error("could not set up gpio input {pin}: {source}")]
    Gpio {
        pin: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("could not open i2c bus {bus}: {source}")]
    Bus {
        bus: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not open projector output: {0}")]
    Projector(String),
    #[error("invalid settings: {0}")]
    Settings(String),
    #[error("hardware required in release builds")]
    HardwareNeeded,
}
