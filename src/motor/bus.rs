// src/motor/bus.rs - I²C byte transport
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;

use thiserror::Error;

use crate::error::EngineError;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("i2c address select failed: {0}")]
    Select(#[source] io::Error),
    #[error("i2c write failed: {0}")]
    Write(#[source] io::Error),
    #[error("i2c read failed: {0}")]
    Read(#[source] io::Error),
}

/// Serialized byte transport to the boards on the bus. A single owner sends
/// synchronously; there is no concurrent access by construction.
pub trait MotorBus: Send {
    fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), BusError>;
    fn read_byte(&mut self, addr: u16) -> Result<u8, BusError>;
}

const I2C_SLAVE: libc::c_ulong = 0x0703;

/// `/dev/i2c-N` adapter. Slave selection sticks per file descriptor, so it
/// is re-issued only when the target address changes.
pub struct I2cBus {
    file: File,
    selected: Option<u16>,
}

impl I2cBus {
    pub fn open(device: &str) -> Result<Self, EngineError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .map_err(|e| EngineError::Bus {
                bus: device.to_string(),
                source: e,
            })?;
        Ok(Self {
            file,
            selected: None,
        })
    }

    fn select(&mut self, addr: u16) -> Result<(), BusError> {
        if self.selected == Some(addr) {
            return Ok(());
        }
        let rc = unsafe {
            libc::ioctl(self.file.as_raw_fd(), I2C_SLAVE, libc::c_ulong::from(addr))
        };
        if rc < 0 {
            return Err(BusError::Select(io::Error::last_os_error()));
        }
        self.selected = Some(addr);
        Ok(())
    }
}

impl MotorBus for I2cBus {
    fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), BusError> {
        self.select(addr)?;
        let n = (&self.file).write(bytes).map_err(BusError::Write)?;
        if n != bytes.len() {
            return Err(BusError::Write(io::Error::other(format!(
                "short i2c write: {n} of {}",
                bytes.len()
            ))));
        }
        Ok(())
    }

    fn read_byte(&mut self, addr: u16) -> Result<u8, BusError> {
        self.select(addr)?;
        let mut byte = [0u8; 1];
        (&self.file).read_exact(&mut byte).map_err(BusError::Read)?;
        Ok(byte[0])
    }
}

/// In-memory bus for debug-without-hardware runs and tests. Records every
/// write and replays queued responses; an empty queue answers SUCCESS.
#[derive(Debug, Default)]
pub struct LoopbackBus {
    pub writes: Vec<(u16, Vec<u8>)>,
    pub responses: VecDeque<u8>,
    pub fail_after: Option<usize>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// All bytes written to one address, flattened in order.
    pub fn written_to(&self, addr: u16) -> Vec<u8> {
        self.writes
            .iter()
            .filter(|(a, _)| *a == addr)
            .flat_map(|(_, b)| b.iter().copied())
            .collect()
    }
}

impl MotorBus for LoopbackBus {
    fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), BusError> {
        if let Some(left) = self.fail_after {
            if left == 0 {
                return Err(BusError::Write(io::Error::other("injected failure")));
            }
            self.fail_after = Some(left - 1);
        }
        tracing::trace!("i2c 0x{addr:02X} <- {bytes:02X?}");
        self.writes.push((addr, bytes.to_vec()));
        Ok(())
    }

    fn read_byte(&mut self, _addr: u16) -> Result<u8, BusError> {
        Ok(self
            .responses
            .pop_front()
            .unwrap_or(super::command::status::SUCCESS))
    }
}
