// src/motor/mod.rs - Motor board protocol driver
pub mod bus;
pub mod command;

use thiserror::Error;
use tokio::time::{Duration, sleep};

use crate::config::{LayerMotion, RotAxisSettings, ZAxisSettings};

use bus::{BusError, MotorBus};
use command::{MotorCommand, R_SCALE_FACTOR, R_SPEED_FACTOR, Z_SPEED_FACTOR, action, reg};

#[derive(Debug, Error)]
#[error("motor command failed: {0}")]
pub struct MotorSendError(#[from] BusError);

/// What the next interrupt from the board means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// No interrupt outstanding.
    None,
    /// An action batch is in flight.
    Motion,
    /// A settings-only write awaits its SUCCESS ack.
    SettingAck,
}

/// Builds register-addressed command batches and transmits them eagerly,
/// one command per bus transaction.
///
/// A batch is settings writes, then action writes, then (when completion
/// matters) the INTERRUPT sentinel; the board raises the interrupt line
/// once when every action in the batch has finished. A transmission failure
/// aborts the batch immediately and no interrupt is expected afterwards.
pub struct MotorController<B: MotorBus> {
    bus: B,
    addr: u16,
    expect: Expectation,
}

impl<B: MotorBus> MotorController<B> {
    pub fn new(bus: B, addr: u16) -> Self {
        Self {
            bus,
            addr,
            expect: Expectation::None,
        }
    }

    pub fn expectation(&self) -> Expectation {
        self.expect
    }

    /// Called by the router once the outstanding interrupt is consumed.
    pub fn clear_expectation(&mut self) {
        self.expect = Expectation::None;
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// One-byte completion/fault status, read after the interrupt line
    /// fires.
    pub fn read_status(&mut self) -> Result<u8, MotorSendError> {
        Ok(self.bus.read_byte(self.addr)?)
    }

    fn send(&mut self, cmd: MotorCommand) -> Result<(), MotorSendError> {
        if let Err(e) = self.bus.write(self.addr, &cmd.encode()) {
            self.expect = Expectation::None;
            return Err(e.into());
        }
        Ok(())
    }

    fn send_batch(
        &mut self,
        cmds: &[MotorCommand],
        expect: Expectation,
    ) -> Result<(), MotorSendError> {
        for cmd in cmds {
            self.send(*cmd)?;
        }
        if expect != Expectation::None {
            self.send(MotorCommand::general(action::INTERRUPT))?;
        }
        self.expect = expect;
        Ok(())
    }

    pub fn enable(&mut self) -> Result<(), MotorSendError> {
        self.send(MotorCommand::general(action::ENABLE))
    }

    pub fn disable(&mut self) -> Result<(), MotorSendError> {
        self.send(MotorCommand::general(action::DISABLE))
    }

    pub fn pause(&mut self) -> Result<(), MotorSendError> {
        self.send(MotorCommand::general(action::PAUSE))
    }

    pub fn resume(&mut self) -> Result<(), MotorSendError> {
        self.send(MotorCommand::general(action::RESUME))
    }

    pub fn clear_pending(&mut self) -> Result<(), MotorSendError> {
        self.send(MotorCommand::general(action::CLEAR))
    }

    /// Emergency halt. Whatever interrupt was outstanding will not arrive.
    pub fn stop(&mut self) -> Result<(), MotorSendError> {
        let result = self.send(MotorCommand::general(action::STOP));
        self.expect = Expectation::None;
        result
    }

    /// Software-reset the board, give it time to come back, then program
    /// both axes and energize. Runs during bring-up only, before the event
    /// loop starts; the delay is the one acknowledged blocking region.
    pub async fn initialize(
        &mut self,
        z: &ZAxisSettings,
        r: &RotAxisSettings,
    ) -> Result<(), MotorSendError> {
        self.send(MotorCommand::general(action::RESET))?;
        sleep(Duration::from_millis(500)).await;

        let cmds = [
            MotorCommand::with_param(reg::Z_SETTINGS, action::STEP_ANGLE, z.step_angle_millidegrees),
            MotorCommand::with_param(reg::Z_SETTINGS, action::UNITS_PER_REV, z.microns_per_rev),
            MotorCommand::with_param(reg::Z_SETTINGS, action::MICROSTEPPING, z.microstepping),
            MotorCommand::with_param(
                reg::ROT_SETTINGS,
                action::STEP_ANGLE,
                r.step_angle_millidegrees,
            ),
            MotorCommand::with_param(
                reg::ROT_SETTINGS,
                action::UNITS_PER_REV,
                r.millidegrees_per_rev / R_SCALE_FACTOR,
            ),
            MotorCommand::with_param(reg::ROT_SETTINGS, action::MICROSTEPPING, r.microstepping),
        ];
        self.send_batch(&cmds, Expectation::None)?;
        self.enable()
    }

    /// Home both axes: rotation to the engaged stop, Z to the top limit.
    pub fn go_home(
        &mut self,
        z: &ZAxisSettings,
        r: &RotAxisSettings,
        with_interrupt: bool,
    ) -> Result<(), MotorSendError> {
        let cmds = [
            MotorCommand::with_param(reg::ROT_SETTINGS, action::JERK, r.home_jerk),
            MotorCommand::with_param(reg::ROT_SETTINGS, action::SPEED, r.home_rpm * R_SPEED_FACTOR),
            MotorCommand::with_param(reg::Z_SETTINGS, action::JERK, z.home_jerk),
            MotorCommand::with_param(
                reg::Z_SETTINGS,
                action::SPEED,
                z.home_speed_um_s * Z_SPEED_FACTOR,
            ),
            MotorCommand::with_param(
                reg::ROT_ACTION,
                action::HOME,
                r.millidegrees_per_rev / R_SCALE_FACTOR,
            ),
            MotorCommand::with_param(reg::Z_ACTION, action::HOME, z.max_travel_microns),
        ];
        let expect = if with_interrupt {
            Expectation::Motion
        } else {
            Expectation::None
        };
        self.send_batch(&cmds, expect)
    }

    /// Bring the build head to the start position over the tray.
    pub fn go_to_start_position(
        &mut self,
        z: &ZAxisSettings,
        r: &RotAxisSettings,
    ) -> Result<(), MotorSendError> {
        let cmds = [
            MotorCommand::with_param(reg::ROT_SETTINGS, action::JERK, r.home_jerk),
            MotorCommand::with_param(reg::ROT_SETTINGS, action::SPEED, r.home_rpm * R_SPEED_FACTOR),
            MotorCommand::with_param(reg::Z_SETTINGS, action::JERK, z.start_jerk),
            MotorCommand::with_param(
                reg::Z_SETTINGS,
                action::SPEED,
                z.start_speed_um_s * Z_SPEED_FACTOR,
            ),
            MotorCommand::with_param(
                reg::ROT_ACTION,
                action::HOME,
                r.millidegrees_per_rev / R_SCALE_FACTOR,
            ),
            MotorCommand::with_param(reg::Z_ACTION, action::MOVE, z.start_position_microns),
        ];
        self.send_batch(&cmds, Expectation::Motion)
    }

    /// Rotate the tray away from the fresh layer, then lift the head.
    pub fn separate(&mut self, m: &LayerMotion) -> Result<(), MotorSendError> {
        let mut cmds = vec![
            MotorCommand::with_param(reg::ROT_SETTINGS, action::JERK, m.separation_rotation_jerk),
            MotorCommand::with_param(
                reg::ROT_SETTINGS,
                action::SPEED,
                m.separation_rpm * R_SPEED_FACTOR,
            ),
            MotorCommand::with_param(reg::Z_SETTINGS, action::JERK, m.separation_z_jerk),
            MotorCommand::with_param(
                reg::Z_SETTINGS,
                action::SPEED,
                m.separation_z_speed_um_s * Z_SPEED_FACTOR,
            ),
        ];
        push_move(
            &mut cmds,
            reg::ROT_ACTION,
            -(m.rotation_millidegrees / R_SCALE_FACTOR),
        );
        push_move(&mut cmds, reg::Z_ACTION, m.z_lift_microns);
        self.send_batch(&cmds, Expectation::Motion)
    }

    /// Rotate the tray back under the head and descend to the next layer
    /// height. With `un_jam_first` the rotary axis is re-homed and returned
    /// to the separated angle before the approach proper.
    pub fn approach(
        &mut self,
        m: &LayerMotion,
        r: &RotAxisSettings,
        thickness_microns: i32,
        un_jam_first: bool,
    ) -> Result<(), MotorSendError> {
        let mut cmds = Vec::new();
        if un_jam_first {
            push_un_jam(&mut cmds, m, r);
        }
        cmds.extend([
            MotorCommand::with_param(reg::ROT_SETTINGS, action::JERK, m.approach_rotation_jerk),
            MotorCommand::with_param(
                reg::ROT_SETTINGS,
                action::SPEED,
                m.approach_rpm * R_SPEED_FACTOR,
            ),
            MotorCommand::with_param(reg::Z_SETTINGS, action::JERK, m.approach_z_jerk),
            MotorCommand::with_param(
                reg::Z_SETTINGS,
                action::SPEED,
                m.approach_z_speed_um_s * Z_SPEED_FACTOR,
            ),
        ]);
        push_move(
            &mut cmds,
            reg::ROT_ACTION,
            m.rotation_millidegrees / R_SCALE_FACTOR,
        );
        push_move(&mut cmds, reg::Z_ACTION, thickness_microns - m.z_lift_microns);
        self.send_batch(&cmds, Expectation::Motion)
    }

    /// Re-home the rotary axis and rotate back to the separated angle, as
    /// its own interrupt batch.
    pub fn un_jam(
        &mut self,
        m: &LayerMotion,
        r: &RotAxisSettings,
        with_interrupt: bool,
    ) -> Result<(), MotorSendError> {
        let mut cmds = Vec::new();
        push_un_jam(&mut cmds, m, r);
        let expect = if with_interrupt {
            Expectation::Motion
        } else {
            Expectation::None
        };
        self.send_batch(&cmds, expect)
    }

    /// Rotate the tray clear and lift the head so the user can look at the
    /// print.
    pub fn pause_and_inspect(
        &mut self,
        m: &LayerMotion,
        z: &ZAxisSettings,
    ) -> Result<(), MotorSendError> {
        let mut cmds = vec![
            MotorCommand::with_param(reg::ROT_SETTINGS, action::JERK, m.separation_rotation_jerk),
            MotorCommand::with_param(
                reg::ROT_SETTINGS,
                action::SPEED,
                m.separation_rpm * R_SPEED_FACTOR,
            ),
            MotorCommand::with_param(reg::Z_SETTINGS, action::JERK, z.start_jerk),
            MotorCommand::with_param(
                reg::Z_SETTINGS,
                action::SPEED,
                z.home_speed_um_s * Z_SPEED_FACTOR,
            ),
        ];
        push_move(
            &mut cmds,
            reg::ROT_ACTION,
            -(m.rotation_millidegrees / R_SCALE_FACTOR),
        );
        push_move(&mut cmds, reg::Z_ACTION, z.inspect_lift_microns);
        self.send_batch(&cmds, Expectation::Motion)
    }

    /// Reverse of `pause_and_inspect`: descend, then swing the tray back.
    pub fn resume_from_inspect(
        &mut self,
        m: &LayerMotion,
        z: &ZAxisSettings,
    ) -> Result<(), MotorSendError> {
        let mut cmds = vec![
            MotorCommand::with_param(reg::ROT_SETTINGS, action::JERK, m.approach_rotation_jerk),
            MotorCommand::with_param(
                reg::ROT_SETTINGS,
                action::SPEED,
                m.approach_rpm * R_SPEED_FACTOR,
            ),
            MotorCommand::with_param(reg::Z_SETTINGS, action::JERK, z.start_jerk),
            MotorCommand::with_param(
                reg::Z_SETTINGS,
                action::SPEED,
                z.home_speed_um_s * Z_SPEED_FACTOR,
            ),
        ];
        push_move(&mut cmds, reg::Z_ACTION, -z.inspect_lift_microns);
        push_move(
            &mut cmds,
            reg::ROT_ACTION,
            m.rotation_millidegrees / R_SCALE_FACTOR,
        );
        self.send_batch(&cmds, Expectation::Motion)
    }

    /// One settings-only write; the board acks it with SUCCESS on the
    /// interrupt line before the next pending setting may be sent.
    pub fn send_setting(&mut self, cmd: MotorCommand) -> Result<(), MotorSendError> {
        self.send_batch(&[cmd], Expectation::SettingAck)
    }
}

/// Append a MOVE, leaving zero-distance moves out entirely; the board
/// treats an explicit zero as a parameter fault.
fn push_move(cmds: &mut Vec<MotorCommand>, register: u8, distance: i32) {
    if distance != 0 {
        cmds.push(MotorCommand::with_param(register, action::MOVE, distance));
    }
}

fn push_un_jam(cmds: &mut Vec<MotorCommand>, m: &LayerMotion, r: &RotAxisSettings) {
    cmds.extend([
        MotorCommand::with_param(reg::ROT_SETTINGS, action::JERK, r.home_jerk),
        MotorCommand::with_param(reg::ROT_SETTINGS, action::SPEED, r.home_rpm * R_SPEED_FACTOR),
        // Home with a full revolution as the travel limit
        MotorCommand::with_param(
            reg::ROT_ACTION,
            action::HOME,
            r.millidegrees_per_rev / R_SCALE_FACTOR,
        ),
    ]);
    push_move(
        cmds,
        reg::ROT_ACTION,
        -(m.rotation_millidegrees / R_SCALE_FACTOR),
    );
}
