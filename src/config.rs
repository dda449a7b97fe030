// src/config.rs - Engine settings loaded from TOML
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::EngineError;

/// I²C address that selects the in-memory loopback bus instead of real
/// hardware. Only honored in debug builds.
pub const DEBUG_NO_HARDWARE_ADDR: u16 = 0xFF;

/// Full engine configuration. A handle to this is passed into every
/// component constructor; reload happens as an event on the loop, never as
/// a process-wide mutation.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub printer: PrinterSettings,

    #[serde(default)]
    pub paths: PathSettings,

    #[serde(default)]
    pub exposure: ExposureSettings,

    #[serde(default)]
    pub motor: MotorSettings,

    #[serde(default)]
    pub z_axis: ZAxisSettings,

    #[serde(default)]
    pub rot_axis: RotAxisSettings,

    #[serde(default)]
    pub motion: MotionSettings,

    #[serde(default)]
    pub limits: LimitSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterSettings {
    /// Hardware revision. Rev 0 boards report the door switch inverted.
    #[serde(default = "default_hardware_rev")]
    pub hardware_rev: u32,

    /// Require a front panel confirmation before the first layer.
    #[serde(default)]
    pub prompt_before_print: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathSettings {
    #[serde(default = "default_status_pipe")]
    pub status_pipe: String,

    #[serde(default = "default_command_pipe")]
    pub command_pipe: String,

    /// Where upstream drops incoming slice bundles.
    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    /// Validated bundle ready to print.
    #[serde(default = "default_print_data_dir")]
    pub print_data_dir: String,

    /// DLP framebuffer device.
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExposureSettings {
    #[serde(default = "default_first_exposure")]
    pub first_exposure_sec: f64,

    #[serde(default = "default_burn_in_exposure")]
    pub burn_in_exposure_sec: f64,

    #[serde(default = "default_model_exposure")]
    pub model_exposure_sec: f64,

    #[serde(default = "default_burn_in_layers")]
    pub burn_in_layers: u32,

    /// One projector frame; subtracted from every exposure because the
    /// image is already lit while the timer is being armed.
    #[serde(default = "default_videoframe_sec")]
    pub videoframe_sec: f64,

    #[serde(default = "default_layer_thickness")]
    pub layer_thickness_microns: i32,

    /// Mechanical overhead (separate + approach) per layer, used for the
    /// remaining-time estimate only.
    #[serde(default = "default_layer_overhead")]
    pub layer_overhead_sec: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotorSettings {
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: String,

    /// 7-bit motor board slave address; 0xFF runs without hardware
    /// (debug builds only).
    #[serde(default = "default_motor_addr")]
    pub i2c_address: u16,

    /// 7-bit front panel (UI board) slave address.
    #[serde(default = "default_ui_addr")]
    pub ui_i2c_address: u16,

    #[serde(default = "default_motor_interrupt_gpio")]
    pub interrupt_gpio: u32,

    #[serde(default = "default_button_gpio")]
    pub button_gpio: u32,

    #[serde(default = "default_door_gpio")]
    pub door_gpio: u32,

    /// Watchdog armed around every interrupt-requesting batch.
    #[serde(default = "default_motor_timeout")]
    pub timeout_sec: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZAxisSettings {
    #[serde(default = "default_step_angle")]
    pub step_angle_millidegrees: i32,

    #[serde(default = "default_z_microns_per_rev")]
    pub microns_per_rev: i32,

    #[serde(default = "default_microstepping")]
    pub microstepping: i32,

    /// Build head position over the tray where a print begins, in microns
    /// relative to home.
    #[serde(default = "default_z_start_position")]
    pub start_position_microns: i32,

    /// Homing travel limit.
    #[serde(default = "default_z_max_travel")]
    pub max_travel_microns: i32,

    #[serde(default = "default_z_jerk")]
    pub home_jerk: i32,

    #[serde(default = "default_z_home_speed")]
    pub home_speed_um_s: i32,

    #[serde(default = "default_z_jerk")]
    pub start_jerk: i32,

    #[serde(default = "default_z_start_speed")]
    pub start_speed_um_s: i32,

    /// How far the head lifts clear of the tray for inspection.
    #[serde(default = "default_z_inspect_lift")]
    pub inspect_lift_microns: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RotAxisSettings {
    #[serde(default = "default_step_angle")]
    pub step_angle_millidegrees: i32,

    #[serde(default = "default_r_millidegrees_per_rev")]
    pub millidegrees_per_rev: i32,

    #[serde(default = "default_microstepping")]
    pub microstepping: i32,

    #[serde(default = "default_r_jerk")]
    pub home_jerk: i32,

    #[serde(default = "default_r_home_rpm")]
    pub home_rpm: i32,
}

/// Per-layer-class motion tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LayerMotion {
    /// Tray rotation for separation, millidegrees. Approach rotates back by
    /// the same amount.
    #[serde(default = "default_rotation")]
    pub rotation_millidegrees: i32,

    /// Build head lift during separation, microns.
    #[serde(default = "default_z_lift")]
    pub z_lift_microns: i32,

    #[serde(default = "default_r_jerk")]
    pub separation_rotation_jerk: i32,

    #[serde(default = "default_separation_rpm")]
    pub separation_rpm: i32,

    #[serde(default = "default_z_jerk")]
    pub separation_z_jerk: i32,

    #[serde(default = "default_separation_z_speed")]
    pub separation_z_speed_um_s: i32,

    #[serde(default = "default_r_jerk")]
    pub approach_rotation_jerk: i32,

    #[serde(default = "default_approach_rpm")]
    pub approach_rpm: i32,

    #[serde(default = "default_z_jerk")]
    pub approach_z_jerk: i32,

    #[serde(default = "default_approach_z_speed")]
    pub approach_z_speed_um_s: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct MotionSettings {
    #[serde(default)]
    pub first: LayerMotion,

    #[serde(default)]
    pub burn_in: LayerMotion,

    #[serde(default)]
    pub model: LayerMotion,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitSettings {
    #[serde(default = "default_min_rpm")]
    pub min_separation_rpm: i32,

    #[serde(default = "default_max_rpm")]
    pub max_separation_rpm: i32,
}

// Default value functions
fn default_hardware_rev() -> u32 { 1 }
fn default_status_pipe() -> String { "/tmp/resind/status".into() }
fn default_command_pipe() -> String { "/tmp/resind/command".into() }
fn default_download_dir() -> String { "/var/lib/resind/download".into() }
fn default_print_data_dir() -> String { "/var/lib/resind/print".into() }
fn default_frame_buffer() -> String { "/dev/fb0".into() }
fn default_first_exposure() -> f64 { 5.0 }
fn default_burn_in_exposure() -> f64 { 4.0 }
fn default_model_exposure() -> f64 { 2.5 }
fn default_burn_in_layers() -> u32 { 1 }
fn default_videoframe_sec() -> f64 { 1.0 / 30.0 }
fn default_layer_thickness() -> i32 { 25 }
fn default_layer_overhead() -> f64 { 6.0 }
fn default_i2c_bus() -> String { "/dev/i2c-2".into() }
fn default_motor_addr() -> u16 { 0x10 }
fn default_ui_addr() -> u16 { 0x11 }
fn default_motor_interrupt_gpio() -> u32 { 60 }
fn default_button_gpio() -> u32 { 30 }
fn default_door_gpio() -> u32 { 47 }
fn default_motor_timeout() -> f64 { 30.0 }
fn default_step_angle() -> i32 { 1800 }
fn default_z_microns_per_rev() -> i32 { 2000 }
fn default_microstepping() -> i32 { 6 }
fn default_z_start_position() -> i32 { -165_000 }
fn default_z_max_travel() -> i32 { 200_000 }
fn default_z_jerk() -> i32 { 500_000 }
fn default_z_home_speed() -> i32 { 4500 }
fn default_z_start_speed() -> i32 { 4500 }
fn default_z_inspect_lift() -> i32 { 60_000 }
fn default_r_millidegrees_per_rev() -> i32 { 360_000 }
fn default_r_jerk() -> i32 { 100_000 }
fn default_r_home_rpm() -> i32 { 5 }
fn default_rotation() -> i32 { 60_000 }
fn default_z_lift() -> i32 { 2_000 }
fn default_separation_rpm() -> i32 { 6 }
fn default_separation_z_speed() -> i32 { 5_000 }
fn default_approach_rpm() -> i32 { 6 }
fn default_approach_z_speed() -> i32 { 5_000 }
fn default_min_rpm() -> i32 { 1 }
fn default_max_rpm() -> i32 { 11 }

macro_rules! defaults_from_empty_toml {
    ($($ty:ty),* $(,)?) => {
        $(impl Default for $ty {
            fn default() -> Self {
                toml::from_str("").expect("defaults")
            }
        })*
    };
}

defaults_from_empty_toml!(
    PrinterSettings,
    PathSettings,
    ExposureSettings,
    MotorSettings,
    ZAxisSettings,
    RotAxisSettings,
    LayerMotion,
    LimitSettings,
);

impl Settings {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Settings(format!("{}: {e}", path.display())))?;
        let settings: Settings = toml::from_str(&contents)
            .map_err(|e| EngineError::Settings(format!("{}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.exposure.first_exposure_sec <= 0.0
            || self.exposure.burn_in_exposure_sec <= 0.0
            || self.exposure.model_exposure_sec <= 0.0
        {
            return Err(EngineError::Settings("exposure times must be positive".into()));
        }
        if self.exposure.layer_thickness_microns <= 0 {
            return Err(EngineError::Settings("layer thickness must be positive".into()));
        }
        if self.motor.timeout_sec <= 0.0 {
            return Err(EngineError::Settings("motor timeout must be positive".into()));
        }
        if self.limits.min_separation_rpm > self.limits.max_separation_rpm {
            return Err(EngineError::Settings("separation rpm limits inverted".into()));
        }
        if self.motor.i2c_address > 0x7F && self.motor.i2c_address != DEBUG_NO_HARDWARE_ADDR {
            return Err(EngineError::Settings("motor i2c address must be 7-bit".into()));
        }
        for m in [&self.motion.first, &self.motion.burn_in, &self.motion.model] {
            if m.z_lift_microns < self.exposure.layer_thickness_microns {
                return Err(EngineError::Settings(
                    "z lift must exceed layer thickness".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn hardware_present(&self) -> bool {
        self.motor.i2c_address != DEBUG_NO_HARDWARE_ADDR
    }
}
