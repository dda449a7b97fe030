// src/projector.rs - DLP projector output
use std::fs::File;
use std::io;
use std::path::Path;

use framebuffer::Framebuffer;

use crate::error::EngineError;

/// The light engine as the state machine sees it. Every call either takes
/// effect or reports a hard failure; the engine decides severity.
pub trait Projector: Send {
    /// Display one slice image. The image stays up until replaced.
    fn show_layer(&mut self, image: &Path) -> io::Result<()>;

    /// Cut all light output.
    fn show_black(&mut self) -> io::Result<()>;

    /// Diagnostic pattern; callable regardless of printer state.
    fn show_test_pattern(&mut self) -> io::Result<()>;

    /// Lamp power. Fire-and-forget: failures are logged, not reported.
    fn set_powered(&mut self, on: bool);
}

/// Blits slice PNGs straight onto the DLP's framebuffer.
pub struct FramebufferProjector {
    fb: Framebuffer,
    width: u32,
    height: u32,
    bytes_per_pixel: u32,
    line_length: u32,
}

impl FramebufferProjector {
    pub fn open(device: &str) -> Result<Self, EngineError> {
        let fb = Framebuffer::new(device)
            .map_err(|e| EngineError::Projector(format!("{device}: {e:?}")))?;
        let width = fb.var_screen_info.xres;
        let height = fb.var_screen_info.yres;
        let bits = fb.var_screen_info.bits_per_pixel;
        let line_length = fb.fix_screen_info.line_length;
        if bits != 16 && bits != 32 {
            return Err(EngineError::Projector(format!(
                "unsupported framebuffer depth: {bits} bpp"
            )));
        }
        tracing::info!("projector framebuffer {width}x{height} at {bits} bpp");
        Ok(Self {
            fb,
            width,
            height,
            bytes_per_pixel: bits / 8,
            line_length,
        })
    }

    fn fill(&mut self, gray: impl Fn(u32, u32) -> u8) {
        let mut frame = vec![0u8; (self.line_length * self.height) as usize];
        for y in 0..self.height {
            for x in 0..self.width {
                let level = gray(x, y);
                let offset = (y * self.line_length + x * self.bytes_per_pixel) as usize;
                match self.bytes_per_pixel {
                    2 => {
                        // RGB565, gray replicated into each channel
                        let v = ((level as u16 >> 3) << 11)
                            | ((level as u16 >> 2) << 5)
                            | (level as u16 >> 3);
                        frame[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
                    }
                    _ => {
                        frame[offset] = level;
                        frame[offset + 1] = level;
                        frame[offset + 2] = level;
                    }
                }
            }
        }
        self.fb.write_frame(&frame);
    }

    fn decode(image: &Path) -> io::Result<(Vec<u8>, u32, u32)> {
        let decoder = png::Decoder::new(File::open(image)?);
        let mut reader = decoder.read_info().map_err(io::Error::other)?;
        let mut buf = vec![0; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf).map_err(io::Error::other)?;
        let channels = info.color_type.samples();
        // Reduce anything to 8-bit gray; slices are grayscale masks anyway
        let gray: Vec<u8> = match (info.bit_depth, channels) {
            (png::BitDepth::Eight, 1) => buf[..info.buffer_size()].to_vec(),
            (png::BitDepth::Eight, n) => buf[..info.buffer_size()]
                .chunks(n)
                .map(|px| px[0])
                .collect(),
            (depth, _) => {
                return Err(io::Error::other(format!(
                    "unsupported slice bit depth {depth:?}"
                )));
            }
        };
        Ok((gray, info.width, info.height))
    }
}

impl Projector for FramebufferProjector {
    fn show_layer(&mut self, image: &Path) -> io::Result<()> {
        let (gray, img_w, img_h) = Self::decode(image)?;
        // Center the slice; anything off-screen is clipped
        let dx = (self.width as i64 - img_w as i64) / 2;
        let dy = (self.height as i64 - img_h as i64) / 2;
        self.fill(|x, y| {
            let sx = x as i64 - dx;
            let sy = y as i64 - dy;
            if sx < 0 || sy < 0 || sx >= img_w as i64 || sy >= img_h as i64 {
                0
            } else {
                gray[(sy * img_w as i64 + sx) as usize]
            }
        });
        Ok(())
    }

    fn show_black(&mut self) -> io::Result<()> {
        self.fill(|_, _| 0);
        Ok(())
    }

    fn show_test_pattern(&mut self) -> io::Result<()> {
        self.fill(|x, y| if ((x / 64) + (y / 64)) % 2 == 0 { 0xFF } else { 0 });
        Ok(())
    }

    fn set_powered(&mut self, on: bool) {
        // Lamp control rides on the DLP's own supervisor; blanking the
        // framebuffer is what actually guarantees darkness.
        tracing::info!("projector power {}", if on { "on" } else { "off" });
        if !on {
            let _ = self.show_black();
        }
    }
}

/// What the stub last put on screen.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Shown {
    #[default]
    Nothing,
    Layer(std::path::PathBuf),
    Black,
    TestPattern,
}

/// Hardware-less projector for debug runs and tests.
#[derive(Debug, Default)]
pub struct StubProjector {
    pub shown: Shown,
    pub powered: bool,
    pub fail_show_layer: bool,
    pub fail_show_black: bool,
}

impl StubProjector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Projector for StubProjector {
    fn show_layer(&mut self, image: &Path) -> io::Result<()> {
        if self.fail_show_layer {
            return Err(io::Error::other("stub failure"));
        }
        tracing::debug!("stub projector showing {}", image.display());
        self.shown = Shown::Layer(image.to_path_buf());
        Ok(())
    }

    fn show_black(&mut self) -> io::Result<()> {
        if self.fail_show_black {
            return Err(io::Error::other("stub failure"));
        }
        self.shown = Shown::Black;
        Ok(())
    }

    fn show_test_pattern(&mut self) -> io::Result<()> {
        self.shown = Shown::TestPattern;
        Ok(())
    }

    fn set_powered(&mut self, on: bool) {
        self.powered = on;
    }
}
