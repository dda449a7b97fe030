// src/event.rs - Events consumed by the state machine and commands from upstream
use std::str::FromStr;

/// Everything the state machine can react to. Raw interrupt payloads are
/// translated into these by the event router before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    StartPrint,
    Cancel,
    Pause,
    Resume,
    Reset,
    LeftButton,
    RightButton,
    RightButtonHold,
    LeftAndRightButton,
    DoorOpened,
    DoorClosed,
    /// Exposure timer fired.
    Exposed,
    /// Motor interrupt line fired for an action batch.
    MotionCompleted { success: bool },
    /// Motor interrupt line fired for a settings-only write.
    GotSetting,
    Connected,
    Registered,
    Error { fatal: bool },
}

/// Front panel button byte, low nibble. The whole byte `0xFF` signals a
/// front panel fault instead.
pub mod buttons {
    pub const BTN1_PRESS: u8 = 0x01;
    pub const BTN2_PRESS: u8 = 0x02;
    pub const BTNS_1_AND_2_PRESS: u8 = 0x03;
    pub const BTN1_HOLD: u8 = 0x04;
    pub const BTN2_HOLD: u8 = 0x08;
}

/// Map a front panel button byte to an event.
///
/// Returns `None` for a zero low nibble (spurious interrupt) and for
/// combinations with no assigned meaning. The two-button chord wins over
/// either single press, which is the §5 tie-break for payloads that encode
/// several buttons in one byte.
pub fn button_event(byte: u8) -> Option<Event> {
    let nibble = byte & 0x0F;
    if nibble == 0 {
        return None;
    }
    if nibble & buttons::BTNS_1_AND_2_PRESS == buttons::BTNS_1_AND_2_PRESS {
        return Some(Event::LeftAndRightButton);
    }
    if nibble & buttons::BTN2_HOLD != 0 {
        return Some(Event::RightButtonHold);
    }
    if nibble & buttons::BTN1_PRESS != 0 {
        return Some(Event::LeftButton);
    }
    if nibble & buttons::BTN2_PRESS != 0 {
        return Some(Event::RightButton);
    }
    // BTN1_HOLD alone has no binding today
    None
}

/// Commands accepted from the upstream UI/network parser.
///
/// The engine consumes a subset; the rest belong to other layers and are
/// acknowledged with a log line only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Cancel,
    Pause,
    Resume,
    Reset,
    Test,
    RefreshSettings,
    ApplyPrintSettings,
    StartPrintDataLoad,
    ProcessPrintData,
    StartRegistering,
    RegistrationSucceeded,
    GetStatus,
    GetSetting(String),
    SetSetting(String, String),
    RestoreSetting(String),
    GetLogs,
    SetFirmware,
    GetFWVersion,
    GetBoardNum,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized command: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split_whitespace();
        let word = parts.next().unwrap_or("");
        let arg = |p: &mut std::str::SplitWhitespace| p.next().map(str::to_string);
        let cmd = match word.to_ascii_uppercase().as_str() {
            "START" => Command::Start,
            "CANCEL" => Command::Cancel,
            "PAUSE" => Command::Pause,
            "RESUME" => Command::Resume,
            "RESET" => Command::Reset,
            "TEST" => Command::Test,
            "REFRESHSETTINGS" => Command::RefreshSettings,
            "APPLYPRINTSETTINGS" => Command::ApplyPrintSettings,
            "STARTPRINTDATALOAD" => Command::StartPrintDataLoad,
            "PROCESSPRINTDATA" => Command::ProcessPrintData,
            "STARTREGISTERING" => Command::StartRegistering,
            "REGISTERED" | "REGISTRATIONSUCCEEDED" => Command::RegistrationSucceeded,
            "GETSTATUS" => Command::GetStatus,
            "GETSETTING" => Command::GetSetting(
                arg(&mut parts).ok_or_else(|| UnknownCommand(s.to_string()))?,
            ),
            "SETSETTING" => {
                let key = arg(&mut parts).ok_or_else(|| UnknownCommand(s.to_string()))?;
                let value = arg(&mut parts).ok_or_else(|| UnknownCommand(s.to_string()))?;
                Command::SetSetting(key, value)
            }
            "RESTORESETTING" => Command::RestoreSetting(
                arg(&mut parts).ok_or_else(|| UnknownCommand(s.to_string()))?,
            ),
            "GETLOGS" => Command::GetLogs,
            "SETFIRMWARE" => Command::SetFirmware,
            "GETFWVERSION" => Command::GetFWVersion,
            "GETBOARDNUM" => Command::GetBoardNum,
            "EXIT" => Command::Exit,
            _ => return Err(UnknownCommand(s.to_string())),
        };
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_byte_mapping() {
        assert_eq!(button_event(0x00), None);
        assert_eq!(button_event(buttons::BTN1_PRESS), Some(Event::LeftButton));
        assert_eq!(button_event(buttons::BTN2_PRESS), Some(Event::RightButton));
        assert_eq!(
            button_event(buttons::BTN2_HOLD),
            Some(Event::RightButtonHold)
        );
        // High nibble noise is ignored
        assert_eq!(button_event(0xA0 | buttons::BTN2_PRESS), Some(Event::RightButton));
    }

    #[test]
    fn two_button_chord_beats_single_presses() {
        assert_eq!(
            button_event(buttons::BTNS_1_AND_2_PRESS),
            Some(Event::LeftAndRightButton)
        );
        // Even with a hold bit also set, the chord wins
        assert_eq!(
            button_event(buttons::BTNS_1_AND_2_PRESS | buttons::BTN2_HOLD),
            Some(Event::LeftAndRightButton)
        );
    }

    #[test]
    fn command_parsing() {
        assert_eq!("start".parse::<Command>().unwrap(), Command::Start);
        assert_eq!("EXIT".parse::<Command>().unwrap(), Command::Exit);
        assert_eq!(
            "SetSetting FirstExposureSec 4.5".parse::<Command>().unwrap(),
            Command::SetSetting("FirstExposureSec".into(), "4.5".into())
        );
        assert!("frobnicate".parse::<Command>().is_err());
        assert!("GETSETTING".parse::<Command>().is_err());
    }
}
