// src/motor/command.rs - Motor board wire protocol
//
// The board exposes five command registers. GENERAL commands are a single
// action byte; register-scoped commands are `[register, action]` with an
// optional 32-bit little-endian parameter.

/// Command registers.
pub mod reg {
    pub const GENERAL: u8 = 0x20;
    pub const ROT_SETTINGS: u8 = 0x21;
    pub const ROT_ACTION: u8 = 0x22;
    pub const Z_SETTINGS: u8 = 0x23;
    pub const Z_ACTION: u8 = 0x24;
}

/// Actions, shared across registers where they make sense.
pub mod action {
    pub const ENABLE: u8 = 0x01;
    pub const DISABLE: u8 = 0x02;
    pub const PAUSE: u8 = 0x03;
    pub const RESUME: u8 = 0x04;
    pub const CLEAR: u8 = 0x05;
    pub const RESET: u8 = 0x06;
    /// Sentinel terminating an interrupt batch.
    pub const INTERRUPT: u8 = 0x07;
    pub const STOP: u8 = 0x08;
    pub const HOME: u8 = 0x10;
    pub const MOVE: u8 = 0x11;
    pub const STEP_ANGLE: u8 = 0x30;
    pub const UNITS_PER_REV: u8 = 0x31;
    pub const MICROSTEPPING: u8 = 0x32;
    pub const JERK: u8 = 0x33;
    pub const SPEED: u8 = 0x34;
}

/// Single-byte replies read back over the interrupt line.
pub mod status {
    pub const SUCCESS: u8 = 0x01;
    pub const ERROR: u8 = 0xFF;
}

/// The board counts rotation in units of `millidegrees / R_SCALE_FACTOR`.
pub const R_SCALE_FACTOR: i32 = 10;
/// Rotation speeds are programmed as `rpm * R_SPEED_FACTOR`.
pub const R_SPEED_FACTOR: i32 = 10;
/// Z speeds are programmed as `microns_per_second * Z_SPEED_FACTOR`.
pub const Z_SPEED_FACTOR: i32 = 10;

/// One register-addressed command, 1-6 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorCommand {
    pub register: u8,
    pub action: u8,
    pub param: Option<i32>,
}

impl MotorCommand {
    pub fn general(action: u8) -> Self {
        Self {
            register: reg::GENERAL,
            action,
            param: None,
        }
    }

    pub fn with_param(register: u8, action: u8, param: i32) -> Self {
        Self {
            register,
            action,
            param: Some(param),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        if self.register == reg::GENERAL {
            return vec![self.action];
        }
        let mut bytes = vec![self.register, self.action];
        if let Some(p) = self.param {
            bytes.extend_from_slice(&p.to_le_bytes());
        }
        bytes
    }
}
