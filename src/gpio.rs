// src/gpio.rs - sysfs GPIO inputs: edge interrupts and level probes
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use crate::error::EngineError;

const GPIO_ROOT: &str = "/sys/class/gpio";

fn gpio_dir(pin: u32) -> PathBuf {
    PathBuf::from(format!("{GPIO_ROOT}/gpio{pin}"))
}

/// Export a pin and configure it as an interrupt-capable input.
fn export_input(pin: u32, edge: &str) -> io::Result<()> {
    if !gpio_dir(pin).exists() {
        // EBUSY from a concurrent export is fine; anything else is not
        if let Err(e) = fs::write(format!("{GPIO_ROOT}/export"), pin.to_string()) {
            if e.raw_os_error() != Some(libc::EBUSY) {
                return Err(e);
            }
        }
    }
    fs::write(gpio_dir(pin).join("direction"), "in")?;
    fs::write(gpio_dir(pin).join("edge"), edge)?;
    Ok(())
}

/// An interrupt-driven GPIO input. The sysfs value file signals an edge as
/// exceptional readiness; each wake-up re-reads the level, which also
/// clears the condition.
pub struct GpioInterrupt {
    pin: u32,
    value: AsyncFd<File>,
}

impl GpioInterrupt {
    /// `edge` is the sysfs edge spec: "rising", "falling" or "both".
    pub fn open(pin: u32, edge: &str) -> Result<Self, EngineError> {
        let map_err = |source| EngineError::Gpio { pin, source };
        export_input(pin, edge).map_err(map_err)?;
        let file = OpenOptions::new()
            .read(true)
            .open(gpio_dir(pin).join("value"))
            .map_err(map_err)?;
        let value =
            AsyncFd::with_interest(file, Interest::PRIORITY | Interest::ERROR).map_err(map_err)?;
        let mut line = Self { pin, value };
        // Initial read so a stale edge does not fire immediately
        let _ = line.read_level();
        Ok(line)
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    fn read_level(&mut self) -> io::Result<u8> {
        let file = self.value.get_mut();
        file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 1];
        file.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Wait for the next edge and return the ASCII level (`b'0'`/`b'1'`)
    /// read after it.
    pub async fn interrupt(&mut self) -> io::Result<u8> {
        loop {
            let mut guard = self.value.ready(Interest::PRIORITY).await?;
            guard.clear_ready();
            drop(guard);
            match self.read_level() {
                Ok(level) => return Ok(level),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// A level-probed GPIO input, opened fresh on every read.
pub struct GpioProbe {
    pin: u32,
}

impl GpioProbe {
    pub fn open(pin: u32) -> Result<Self, EngineError> {
        export_input(pin, "none").map_err(|source| EngineError::Gpio { pin, source })?;
        Ok(Self { pin })
    }

    /// Current ASCII level.
    pub fn read(&self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        File::open(gpio_dir(self.pin).join("value"))?.read_exact(&mut buf)?;
        Ok(buf[0])
    }
}
