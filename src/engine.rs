// src/engine.rs - Event router, error handler and the readiness wait
//
// One task owns every hardware handle. Watcher tasks only signal readiness
// into channels; translation of raw payloads into state machine events and
// every state transition happen here, run to completion, one event at a
// time. The `biased` select encodes the fixed cross-source priority:
// injected faults (including gpio watcher failures) > motor timeout > door
// > motor interrupt > exposure timer > buttons > commands.
use std::collections::VecDeque;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use crate::config::Settings;
use crate::error::{EngineError, ErrorCode};
use crate::event::{Command, Event, UnknownCommand, button_event};
use crate::gpio::{GpioInterrupt, GpioProbe};
use crate::layers::LayerTracker;
use crate::motor::bus::{I2cBus, LoopbackBus, MotorBus};
use crate::motor::command::{MotorCommand, R_SPEED_FACTOR, action, reg, status as motor_status};
use crate::motor::{Expectation, MotorController, MotorSendError};
use crate::print_data::{ActivePrint, PrintDataManager};
use crate::projector::{FramebufferProjector, Projector, StubProjector};
use crate::state::{EngineOps, StateMachine};
use crate::status::{PrinterStatus, StateCode, StatusChange, StatusPipe, UiSubState};
use crate::timer::OneShotTimer;

/// The state machine's window onto the hardware: timers, motor batches,
/// projector, status pipe and layer accounting, plus the error handler.
pub struct EngineCore<B: MotorBus, P: Projector> {
    settings: Settings,
    motor: MotorController<B>,
    ui_addr: u16,
    projector: P,
    status: PrinterStatus,
    last_code: StateCode,
    pipe: StatusPipe,
    exposure_timer: OneShotTimer,
    motor_timer: OneShotTimer,
    layers: LayerTracker,
    print_data: PrintDataManager,
    current_print: Option<ActivePrint>,
    pending_settings: VecDeque<(&'static str, MotorCommand)>,
    injected: VecDeque<Event>,
    jam_recovery: bool,
}

impl<B: MotorBus, P: Projector> EngineCore<B, P> {
    fn arm_motor_watchdog(&mut self) {
        self.motor_timer.arm(self.settings.motor.timeout_sec);
    }

    /// Run a motor batch under the watchdog. A transmission failure is a
    /// non-fatal motor error; no interrupt will follow.
    fn motor_op(&mut self, result: Result<(), MotorSendError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                self.motor_timer.disarm();
                tracing::debug!("motor transmission failed: {e}");
                self.raise(ErrorCode::MotorError, false, None);
                false
            }
        }
    }

    /// Fire-and-forget motor command; failures are logged and latched but
    /// nothing waits on them.
    fn motor_aside(&mut self, result: Result<(), MotorSendError>) {
        if let Err(e) = result {
            tracing::debug!("motor command failed: {e}");
            self.raise(ErrorCode::MotorError, false, None);
        }
    }

    fn set_substate(&mut self, substate: UiSubState) {
        self.status.ui_substate = substate;
        self.publish(self.last_code, StatusChange::NoChange);
    }

    /// Build the pending-settings list from the staged print's overrides.
    /// Out-of-range values are skipped with a warning; the rest of the list
    /// still goes out.
    fn build_pending_settings(&mut self) {
        self.pending_settings.clear();
        let Some(active) = &self.current_print else {
            return;
        };
        let o = active.overrides();
        let per_class = [
            ("first separation rpm", o.first_separation_rpm),
            ("burn-in separation rpm", o.burn_in_separation_rpm),
            ("model separation rpm", o.model_separation_rpm),
        ];
        let (min, max) = (
            self.settings.limits.min_separation_rpm,
            self.settings.limits.max_separation_rpm,
        );
        let mut out = VecDeque::new();
        for (key, value) in per_class {
            let Some(rpm) = value else { continue };
            if rpm < min || rpm > max {
                self.raise(ErrorCode::SeparationRpmOutOfRange, false, Some(rpm));
                continue;
            }
            out.push_back((
                key,
                MotorCommand::with_param(reg::ROT_SETTINGS, action::SPEED, rpm * R_SPEED_FACTOR),
            ));
        }
        self.pending_settings = out;
    }
}

impl<B: MotorBus, P: Projector> EngineOps for EngineCore<B, P> {
    fn arm_exposure_timer(&mut self, seconds: f64) {
        self.exposure_timer.arm(seconds);
    }

    fn disarm_exposure_timer(&mut self) {
        self.exposure_timer.disarm();
    }

    fn exposure_remaining(&mut self) -> f64 {
        self.exposure_timer.remaining_secs_f64()
    }

    fn disarm_motor_timeout(&mut self) {
        self.motor_timer.disarm();
    }

    fn motor_go_home(&mut self) -> bool {
        self.arm_motor_watchdog();
        let r = self
            .motor
            .go_home(&self.settings.z_axis, &self.settings.rot_axis, true);
        self.motor_op(r)
    }

    fn motor_go_to_start_position(&mut self) -> bool {
        self.arm_motor_watchdog();
        let r = self
            .motor
            .go_to_start_position(&self.settings.z_axis, &self.settings.rot_axis);
        self.motor_op(r)
    }

    fn motor_separate(&mut self) -> bool {
        self.arm_motor_watchdog();
        let motion = self.layers.motion(&self.settings);
        let r = self.motor.separate(&motion);
        self.motor_op(r)
    }

    fn motor_approach(&mut self, un_jam_first: bool) -> bool {
        self.arm_motor_watchdog();
        let motion = self.layers.motion(&self.settings);
        let thickness = self.layers.layer_thickness_microns(&self.settings);
        let r = self
            .motor
            .approach(&motion, &self.settings.rot_axis, thickness, un_jam_first);
        self.motor_op(r)
    }

    fn motor_pause(&mut self) {
        let r = self.motor.pause();
        self.motor_aside(r);
    }

    fn motor_resume(&mut self) {
        let r = self.motor.resume();
        self.motor_aside(r);
    }

    fn motor_pause_and_inspect(&mut self) -> bool {
        self.arm_motor_watchdog();
        let motion = self.layers.motion(&self.settings);
        let r = self.motor.pause_and_inspect(&motion, &self.settings.z_axis);
        self.motor_op(r)
    }

    fn motor_resume_from_inspect(&mut self) -> bool {
        self.arm_motor_watchdog();
        let motion = self.layers.motion(&self.settings);
        let r = self.motor.resume_from_inspect(&motion, &self.settings.z_axis);
        self.motor_op(r)
    }

    fn stop_motor(&mut self) {
        self.motor_timer.disarm();
        let r = self.motor.stop();
        self.motor_aside(r);
        let r = self.motor.clear_pending();
        self.motor_aside(r);
    }

    fn send_next_pending_setting(&mut self) -> bool {
        while let Some((key, cmd)) = self.pending_settings.pop_front() {
            self.arm_motor_watchdog();
            match self.motor.send_setting(cmd) {
                Ok(()) => {
                    tracing::debug!("sent per-print setting: {key}");
                    return true;
                }
                Err(e) => {
                    self.motor_timer.disarm();
                    tracing::debug!("setting write failed: {e}");
                    self.raise(ErrorCode::MotorError, false, None);
                }
            }
        }
        false
    }

    fn motion_in_flight(&self) -> bool {
        self.motor.expectation() == Expectation::Motion
    }

    fn show_current_layer(&mut self) -> bool {
        let layer = self.layers.current_layer();
        let path = self
            .current_print
            .as_ref()
            .and_then(|active| active.slice_path(layer));
        let Some(path) = path else {
            self.raise(ErrorCode::NoImageForLayer, true, Some(layer as i32));
            return false;
        };
        match self.projector.show_layer(&path) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("show_layer failed: {e}");
                self.raise(ErrorCode::CantShowImage, true, None);
                false
            }
        }
    }

    fn show_black(&mut self) {
        if let Err(e) = self.projector.show_black() {
            tracing::debug!("show_black failed: {e}");
            self.projector.set_powered(false);
            self.raise(ErrorCode::CantShowBlack, true, None);
        }
    }

    fn projector_power(&mut self, on: bool) {
        self.projector.set_powered(on);
    }

    fn start_print_job(&mut self) -> bool {
        match self.print_data.active() {
            Err(e) => {
                tracing::debug!("print data unavailable: {e}");
                self.raise(e.code(), false, None);
                false
            }
            Ok(active) => {
                self.layers.start(active.num_layers(), active.overrides().clone());
                self.current_print = Some(active);
                self.build_pending_settings();
                true
            }
        }
    }

    fn begin_first_layer(&mut self) {
        self.layers.begin_first_layer();
    }

    fn advance_layer(&mut self) -> bool {
        self.layers.advance()
    }

    fn finish_print(&mut self) {
        self.layers.finish();
    }

    fn cancel_print(&mut self) {
        self.exposure_timer.disarm();
        self.layers.cancel();
        self.pending_settings.clear();
        self.current_print = None;
        self.jam_recovery = false;
    }

    fn prompt_before_first_layer(&self) -> bool {
        self.settings.printer.prompt_before_print
    }

    fn exposure_seconds(&self) -> f64 {
        self.layers.armed_exposure_sec(&self.settings)
    }

    fn set_jam_recovery(&mut self, on: bool) {
        self.jam_recovery = on;
    }

    fn jam_recovery(&self) -> bool {
        self.jam_recovery
            || self
                .current_print
                .as_ref()
                .is_some_and(|a| a.overrides().un_jam_on_approach == Some(true))
    }

    fn publish(&mut self, state: StateCode, change: StatusChange) {
        self.status.state = state;
        self.status.change = change;
        self.status.current_layer = self.layers.current_layer();
        self.status.num_layers = self.layers.num_layers();
        self.status.estimated_seconds_remaining =
            self.layers.estimated_seconds_remaining(&self.settings);
        self.last_code = state;
        self.pipe.write_record(&self.status);
        // An error rides along on exactly one record
        if self.status.is_error {
            self.status.is_error = false;
            self.status.error_code = ErrorCode::Success;
            self.status.errno = 0;
        }
    }

    fn raise(&mut self, code: ErrorCode, fatal: bool, detail: Option<i32>) {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        match (fatal, detail) {
            (true, Some(d)) => tracing::error!("{code} ({d})"),
            (true, None) => tracing::error!("{code}"),
            (false, Some(d)) => tracing::warn!("{code} ({d})"),
            (false, None) => tracing::warn!("{code}"),
        }
        self.status.error_code = code;
        self.status.errno = errno;
        self.status.is_error = true;
        self.publish(self.last_code, StatusChange::NoChange);
        if fatal {
            self.injected.push_back(Event::Error { fatal: true });
        }
    }
}

/// The print engine: owns the core, the state machine and every event
/// source.
pub struct Engine<B: MotorBus, P: Projector> {
    core: EngineCore<B, P>,
    sm: StateMachine,
    config_path: Option<PathBuf>,
    gpio_fault_rx: mpsc::Receiver<u32>,
    _gpio_fault_tx: mpsc::Sender<u32>,
    door_rx: mpsc::Receiver<u8>,
    _door_tx: mpsc::Sender<u8>,
    motor_irq_rx: mpsc::Receiver<()>,
    _motor_irq_tx: mpsc::Sender<()>,
    button_irq_rx: mpsc::Receiver<()>,
    _button_irq_tx: mpsc::Sender<()>,
    cmd_rx: mpsc::Receiver<Result<Command, UnknownCommand>>,
    cmd_tx: mpsc::Sender<Result<Command, UnknownCommand>>,
    door_closed: bool,
}

impl Engine<I2cBus, FramebufferProjector> {
    /// Bring up the engine against real hardware. Failures here are
    /// unrecoverable and expected to terminate the process.
    pub fn with_hardware(
        settings: Settings,
        config_path: Option<PathBuf>,
    ) -> Result<Self, EngineError> {
        let bus = I2cBus::open(&settings.motor.i2c_bus)?;
        let projector = FramebufferProjector::open(&settings.paths.frame_buffer)?;
        let mut engine = Engine::assemble(settings, config_path, bus, projector)?;

        let pins = engine.core.settings.motor.clone();
        let motor_irq = GpioInterrupt::open(pins.interrupt_gpio, "falling")?;
        let button_irq = GpioInterrupt::open(pins.button_gpio, "falling")?;
        let door = GpioInterrupt::open(pins.door_gpio, "both")?;
        let door_probe = GpioProbe::open(pins.door_gpio)?;

        let initially_closed = door_probe
            .read()
            .map(|raw| engine.door_closed_from_raw(raw))
            .unwrap_or(true);
        engine.door_closed = initially_closed;

        let fault_tx = engine._gpio_fault_tx.clone();
        spawn_edge_watcher(motor_irq, engine._motor_irq_tx.clone(), fault_tx.clone(), |_| ());
        spawn_edge_watcher(button_irq, engine._button_irq_tx.clone(), fault_tx.clone(), |_| ());
        spawn_edge_watcher(door, engine._door_tx.clone(), fault_tx, |level| level);
        Ok(engine)
    }
}

impl Engine<LoopbackBus, StubProjector> {
    /// Debug bring-up without any hardware attached: loopback bus, stub
    /// projector, no GPIO watchers.
    pub fn without_hardware(settings: Settings) -> Result<Self, EngineError> {
        Engine::assemble(settings, None, LoopbackBus::new(), StubProjector::new())
    }
}

impl<B: MotorBus, P: Projector> Engine<B, P> {
    fn assemble(
        settings: Settings,
        config_path: Option<PathBuf>,
        bus: B,
        projector: P,
    ) -> Result<Self, EngineError> {
        let pipe = StatusPipe::create(Path::new(&settings.paths.status_pipe))?;
        let print_data =
            PrintDataManager::new(&settings.paths.download_dir, &settings.paths.print_data_dir);
        let motor = MotorController::new(bus, settings.motor.i2c_address);
        let ui_addr = settings.motor.ui_i2c_address;

        let (gpio_fault_tx, gpio_fault_rx) = mpsc::channel(4);
        let (door_tx, door_rx) = mpsc::channel(8);
        let (motor_irq_tx, motor_irq_rx) = mpsc::channel(8);
        let (button_irq_tx, button_irq_rx) = mpsc::channel(8);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        Ok(Self {
            core: EngineCore {
                settings,
                motor,
                ui_addr,
                projector,
                status: PrinterStatus::new(),
                last_code: StateCode::Initializing,
                pipe,
                exposure_timer: OneShotTimer::new(),
                motor_timer: OneShotTimer::new(),
                layers: LayerTracker::new(),
                print_data,
                current_print: None,
                pending_settings: VecDeque::new(),
                injected: VecDeque::new(),
                jam_recovery: false,
            },
            sm: StateMachine::new(),
            config_path,
            gpio_fault_rx,
            _gpio_fault_tx: gpio_fault_tx,
            door_rx,
            _door_tx: door_tx,
            motor_irq_rx,
            _motor_irq_tx: motor_irq_tx,
            button_irq_rx,
            _button_irq_tx: button_irq_tx,
            cmd_rx,
            cmd_tx,
            door_closed: true,
        })
    }

    /// Hand-deliver commands, bypassing the command pipe. Used by tests and
    /// embedders.
    pub fn command_sender(&self) -> mpsc::Sender<Result<Command, UnknownCommand>> {
        self.cmd_tx.clone()
    }

    pub fn status_pipe_path(&self) -> &Path {
        self.core.pipe.path()
    }

    fn door_closed_from_raw(&self, raw: u8) -> bool {
        // Rev 0 boards wired the switch the other way around
        if self.core.settings.printer.hardware_rev == 0 {
            raw == b'1'
        } else {
            raw == b'0'
        }
    }

    /// Bring up the hardware and run the loop until an Exit command.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        spawn_command_reader(
            PathBuf::from(&self.core.settings.paths.command_pipe),
            self.cmd_tx.clone(),
        )?;

        // Initializing entry: clean slate, then home with the watchdog
        // armed. The post-reset delay below is the only blocking region and
        // happens before any event is accepted.
        self.core.status = PrinterStatus::new();
        self.core.publish(StateCode::Initializing, StatusChange::Entering);
        let init = self
            .core
            .motor
            .initialize(&self.core.settings.z_axis, &self.core.settings.rot_axis)
            .await;
        if self.core.motor_op(init) {
            if !self.core.motor_go_home() {
                self.core
                    .injected
                    .push_back(Event::MotionCompleted { success: false });
            }
        } else {
            self.core
                .injected
                .push_back(Event::MotionCompleted { success: false });
        }

        loop {
            while let Some(event) = self.core.injected.pop_front() {
                self.sm.handle(&mut self.core, event);
            }

            tokio::select! {
                biased;

                // A dead watcher means its signal can never arrive again;
                // the door line in particular must not fail silently.
                pin = self.gpio_fault_rx.recv() => {
                    if let Some(pin) = pin {
                        self.core.raise(ErrorCode::GpioInput, true, Some(pin as i32));
                    }
                }
                _ = self.core.motor_timer.fired() => {
                    self.core.motor.clear_expectation();
                    self.core.raise(ErrorCode::MotorTimeoutError, true, None);
                    self.core.injected.push_back(Event::MotionCompleted { success: false });
                }
                level = self.door_rx.recv() => {
                    if let Some(raw) = level {
                        self.on_door_level(raw);
                    }
                }
                irq = self.motor_irq_rx.recv() => {
                    if irq.is_some() {
                        self.on_motor_interrupt();
                    }
                }
                _ = self.core.exposure_timer.fired() => {
                    self.sm.handle(&mut self.core, Event::Exposed);
                }
                irq = self.button_irq_rx.recv() => {
                    if irq.is_some() {
                        self.on_button_interrupt();
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    if let Some(cmd) = cmd {
                        if self.on_command(cmd) {
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn on_door_level(&mut self, raw: u8) {
        let closed = self.door_closed_from_raw(raw);
        if closed == self.door_closed {
            return;
        }
        self.door_closed = closed;
        let event = if closed {
            Event::DoorClosed
        } else {
            Event::DoorOpened
        };
        self.sm.handle(&mut self.core, event);
    }

    fn on_motor_interrupt(&mut self) {
        let expected = self.core.motor.expectation();
        let status = match self.core.motor.read_status() {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!("motor status read failed: {e}");
                self.core.raise(ErrorCode::MotorError, false, None);
                if expected != Expectation::None {
                    self.core.motor.clear_expectation();
                    self.sm
                        .handle(&mut self.core, Event::MotionCompleted { success: false });
                }
                return;
            }
        };
        self.core.motor.clear_expectation();
        match status {
            motor_status::SUCCESS => match expected {
                Expectation::SettingAck => self.sm.handle(&mut self.core, Event::GotSetting),
                Expectation::Motion => self
                    .sm
                    .handle(&mut self.core, Event::MotionCompleted { success: true }),
                Expectation::None => {
                    tracing::warn!("unexpected motor interrupt, no batch outstanding");
                }
            },
            motor_status::ERROR => {
                self.core.raise(ErrorCode::MotorError, false, None);
                if expected != Expectation::None {
                    self.sm
                        .handle(&mut self.core, Event::MotionCompleted { success: false });
                }
            }
            other => {
                self.core
                    .raise(ErrorCode::UnknownMotorStatus, false, Some(other as i32));
            }
        }
    }

    fn on_button_interrupt(&mut self) {
        let byte = match self.core.motor.bus_mut().read_byte(self.core.ui_addr) {
            Ok(byte) => byte,
            Err(e) => {
                tracing::debug!("front panel read failed: {e}");
                self.core
                    .raise(ErrorCode::UnknownFrontPanelStatus, false, None);
                return;
            }
        };
        if byte == motor_status::ERROR {
            self.core.raise(ErrorCode::FrontPanelError, false, None);
            return;
        }
        match button_event(byte) {
            Some(event) => self.sm.handle(&mut self.core, event),
            None => {
                if byte & 0x0F != 0 {
                    tracing::debug!("unbound button byte 0x{byte:02X}");
                }
            }
        }
    }

    /// Returns true when the engine should exit.
    fn on_command(&mut self, cmd: Result<Command, UnknownCommand>) -> bool {
        let cmd = match cmd {
            Ok(cmd) => cmd,
            Err(UnknownCommand(text)) => {
                tracing::warn!("unrecognized command input: {text:?}");
                self.core.raise(ErrorCode::UnknownCommandInput, false, None);
                return false;
            }
        };
        tracing::debug!("command {cmd:?}");
        match cmd {
            Command::Start => self.sm.handle(&mut self.core, Event::StartPrint),
            Command::Cancel => self.sm.handle(&mut self.core, Event::Cancel),
            Command::Pause => self.sm.handle(&mut self.core, Event::Pause),
            Command::Resume => self.sm.handle(&mut self.core, Event::Resume),
            Command::Reset => self.sm.handle(&mut self.core, Event::Reset),
            Command::StartRegistering => self.sm.handle(&mut self.core, Event::Connected),
            Command::RegistrationSucceeded => self.sm.handle(&mut self.core, Event::Registered),
            Command::Test => {
                // Bypasses the state machine entirely
                if let Err(e) = self.core.projector.show_test_pattern() {
                    tracing::debug!("test pattern failed: {e}");
                    self.core.raise(ErrorCode::CantShowImage, false, None);
                }
            }
            Command::GetStatus => {
                self.core
                    .publish(self.core.last_code, StatusChange::NoChange);
            }
            Command::RefreshSettings => self.refresh_settings(),
            Command::ApplyPrintSettings => self.apply_print_settings(),
            Command::StartPrintDataLoad => {
                if self.sm.print_data_mutable() {
                    // A new download replaces whatever was staged; make room
                    // for it up front.
                    if let Err(e) = self.core.print_data.clear() {
                        tracing::debug!("could not discard staged print data: {e}");
                        self.core.raise(e.code(), false, None);
                    }
                    self.core.set_substate(UiSubState::Downloading);
                } else {
                    self.core
                        .raise(ErrorCode::IllegalStateForPrintData, false, None);
                }
            }
            Command::ProcessPrintData => self.process_print_data(),
            Command::GetSetting(_)
            | Command::SetSetting(..)
            | Command::RestoreSetting(_)
            | Command::GetLogs
            | Command::SetFirmware
            | Command::GetFWVersion
            | Command::GetBoardNum => {
                tracing::info!("{cmd:?} is answered by the upper layers");
            }
            Command::Exit => return true,
        }
        false
    }

    fn refresh_settings(&mut self) {
        let Some(path) = &self.config_path else {
            tracing::warn!("no settings file to refresh from");
            return;
        };
        match Settings::load(path) {
            Ok(settings) => {
                tracing::info!("settings reloaded from {}", path.display());
                self.core.settings = settings;
            }
            Err(e) => tracing::error!("settings refresh failed, keeping old values: {e}"),
        }
    }

    fn apply_print_settings(&mut self) {
        if !self.sm.print_data_mutable() {
            self.core
                .raise(ErrorCode::IllegalStateForPrintData, false, None);
            return;
        }
        if let Err(e) = self.core.print_data.reload_overrides() {
            tracing::debug!("apply print settings failed: {e}");
            let code = match &e {
                crate::print_data::PrintDataError::Settings(_) => {
                    ErrorCode::CantLoadPrintSettingsFile
                }
                other => other.code(),
            };
            self.core.raise(code, false, None);
        }
    }

    fn process_print_data(&mut self) {
        if !self.sm.print_data_mutable() {
            self.core
                .raise(ErrorCode::IllegalStateForPrintData, false, None);
            return;
        }
        match self.core.print_data.process_incoming() {
            Ok(()) => self.core.set_substate(UiSubState::Downloaded),
            Err(e) => {
                tracing::debug!("print data processing failed: {e}");
                self.core.raise(e.code(), false, None);
                self.core.set_substate(UiSubState::DownloadFailed);
            }
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("shutting down print engine");
        if let Err(e) = self.core.motor.disable() {
            tracing::warn!("could not disable motors: {e}");
        }
        let _ = self.core.projector.show_black();
        self.core.projector.set_powered(false);
        let _ = std::fs::remove_file(&self.core.settings.paths.command_pipe);
        // The status pipe is unlinked when the core drops
    }
}

/// Forward GPIO edges into a channel until the engine goes away. A read
/// failure is reported on the fault channel before the watcher dies, so the
/// router can escalate it instead of losing the signal silently.
fn spawn_edge_watcher<T: Send + 'static>(
    mut line: GpioInterrupt,
    tx: mpsc::Sender<T>,
    fault_tx: mpsc::Sender<u32>,
    map: impl Fn(u8) -> T + Send + 'static,
) {
    tokio::spawn(async move {
        loop {
            match line.interrupt().await {
                Ok(level) => {
                    if tx.send(map(level)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("gpio {} watcher failed: {e}", line.pin());
                    let _ = fault_tx.send(line.pin()).await;
                    break;
                }
            }
        }
    });
}

/// Feed newline-delimited commands from the command pipe into the loop.
/// A detached OS thread does the blocking reads (runtime shutdown must not
/// wait on an open with no writer); the pipe is reopened whenever the
/// writer goes away.
fn spawn_command_reader(
    path: PathBuf,
    tx: mpsc::Sender<Result<Command, UnknownCommand>>,
) -> Result<(), EngineError> {
    crate::status::mkfifo(&path).map_err(EngineError::CommandPipe)?;
    std::thread::spawn(move || {
        loop {
            let file = match std::fs::File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    tracing::error!("command pipe open failed: {e}");
                    return;
                }
            };
            for line in std::io::BufReader::new(file).lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if tx.blocking_send(line.parse::<Command>()).is_err() {
                    return;
                }
            }
            // Writer closed; block on a fresh open for the next one
        }
    });
    Ok(())
}
