// src/state.rs - The printer state machine
//
// All sequencing lives here: home/start/expose/separate/approach cycles,
// pause and inspect, cancellation, door and fault precedence. The machine
// acts on the world only through the narrow `EngineOps` capability, so the
// whole thing is drivable from tests without hardware.
use crate::error::ErrorCode;
use crate::event::Event;
use crate::status::{StateCode, StatusChange};

/// Everything the state machine may do to the rest of the engine.
///
/// Motor operations return whether the batch was transmitted; the
/// implementation raises the matching error itself, so a `false` only means
/// "take the failure path". Every interrupt-requesting batch arms the motor
/// watchdog on the engine side.
pub trait EngineOps {
    fn arm_exposure_timer(&mut self, seconds: f64);
    fn disarm_exposure_timer(&mut self);
    /// Seconds left on a running exposure, for pausing.
    fn exposure_remaining(&mut self) -> f64;
    fn disarm_motor_timeout(&mut self);

    fn motor_go_home(&mut self) -> bool;
    fn motor_go_to_start_position(&mut self) -> bool;
    fn motor_separate(&mut self) -> bool;
    fn motor_approach(&mut self, un_jam_first: bool) -> bool;
    fn motor_pause(&mut self);
    fn motor_resume(&mut self);
    fn motor_pause_and_inspect(&mut self) -> bool;
    fn motor_resume_from_inspect(&mut self) -> bool;
    /// Emergency stop; also disarms the watchdog and forgets any expected
    /// interrupt.
    fn stop_motor(&mut self);
    /// Transmit the next pending per-print setting. False when the list is
    /// exhausted.
    fn send_next_pending_setting(&mut self) -> bool;
    /// True while an interrupt batch is outstanding on the motor board.
    fn motion_in_flight(&self) -> bool;

    fn show_current_layer(&mut self) -> bool;
    fn show_black(&mut self);
    fn projector_power(&mut self, on: bool);

    /// Stage layer accounting and the pending-settings list for a new
    /// print. False (with the error already raised) when there is nothing
    /// to print.
    fn start_print_job(&mut self) -> bool;
    fn begin_first_layer(&mut self);
    fn advance_layer(&mut self) -> bool;
    fn finish_print(&mut self);
    /// Abandon the print: exposure timer disarmed, zero layers loaded.
    fn cancel_print(&mut self);
    fn prompt_before_first_layer(&self) -> bool;
    /// Armed exposure for the current layer (video-frame corrected).
    fn exposure_seconds(&self) -> f64;
    fn set_jam_recovery(&mut self, on: bool);
    fn jam_recovery(&self) -> bool;

    fn publish(&mut self, state: StateCode, change: StatusChange);
    fn raise(&mut self, code: ErrorCode, fatal: bool, detail: Option<i32>);
}

/// Where a paused print picks back up.
#[derive(Debug, Clone, PartialEq)]
pub enum PauseResume {
    /// Re-show the image and finish the captured remainder.
    Exposure { remaining_sec: f64 },
    /// The separate batch had finished; approach is next.
    BeforeApproach,
    /// The approach batch had finished; exposure is next.
    BeforeExpose,
}

/// Pre-print phases between Start and the first approach.
#[derive(Debug, Clone, PartialEq)]
pub enum Prep {
    /// Homing first because the print started from `Idle`.
    Homing,
    /// Consuming the pending-settings list, one ack at a time.
    SendingSettings,
    /// Travelling to the start position over the tray.
    MovingToStart,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Printing {
    Preparing(Prep),
    /// Waiting for the user to confirm the first layer.
    PressingButton,
    Exposing,
    Separating,
    Approaching,
    PausedByUser(PauseResume),
    Inspecting { arrived: bool, resume: PauseResume },
    ConfirmingResume { returning: bool, resume: PauseResume },
}

/// What is on screen while the door is closed.
#[derive(Debug, Clone, PartialEq)]
pub enum Screen {
    Idle,
    Home,
    Registering,
    ConfirmingCancel(PauseResume),
    Printing(Printing),
    AwaitingCancelation,
    EndingPrint,
    ShowingVersion { from_home: bool },
    Calibrating { leaving: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrinterState {
    Initializing,
    DoorClosed(Screen),
    DoorOpen {
        resume: Screen,
        /// A completion that slipped in while the door was open, replayed
        /// once it closes again.
        deferred: Option<Event>,
    },
    Error,
}

/// UI request that arrived while a motor batch was in flight; honored when
/// the batch completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeferredUi {
    Pause,
    ConfirmCancel,
}

pub struct StateMachine {
    state: PrinterState,
    deferred_ui: Option<DeferredUi>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: PrinterState::Initializing,
            deferred_ui: None,
        }
    }

    pub fn state(&self) -> &PrinterState {
        &self.state
    }

    pub fn code(&self) -> StateCode {
        code_of(&self.state)
    }

    /// True in every state where print data may be swapped out safely.
    pub fn print_data_mutable(&self) -> bool {
        matches!(
            self.state,
            PrinterState::DoorClosed(Screen::Idle)
                | PrinterState::DoorClosed(Screen::Home)
                | PrinterState::DoorClosed(Screen::Registering)
                | PrinterState::DoorClosed(Screen::ShowingVersion { .. })
        )
    }

    pub fn handle(&mut self, ops: &mut dyn EngineOps, event: Event) {
        tracing::debug!("event {event:?} in {:?}", self.code());

        // Fatal faults preempt everything else.
        if let Event::Error { fatal } = event {
            if fatal && self.state != PrinterState::Error {
                ops.stop_motor();
                ops.cancel_print();
                ops.show_black();
                ops.projector_power(false);
                self.deferred_ui = None;
                self.goto(ops, PrinterState::Error);
            }
            return;
        }

        // Door precedence: opening wins over whatever was in progress.
        match event {
            Event::DoorOpened => {
                match &self.state {
                    PrinterState::DoorClosed(screen) => {
                        let resume = screen.clone();
                        ops.disarm_exposure_timer();
                        ops.show_black();
                        ops.projector_power(false);
                        ops.motor_pause();
                        self.goto(
                            ops,
                            PrinterState::DoorOpen {
                                resume,
                                deferred: None,
                            },
                        );
                    }
                    PrinterState::DoorOpen { .. } => {}
                    _ => tracing::warn!("door opened in {:?}, ignored", self.code()),
                }
                return;
            }
            Event::DoorClosed => {
                if let PrinterState::DoorOpen { resume, deferred } = &self.state {
                    let resume = resume.clone();
                    let deferred = deferred.clone();
                    ops.motor_resume();
                    self.restore_after_door(ops, resume);
                    if let Some(ev) = deferred {
                        self.handle(ops, ev);
                    }
                } else {
                    tracing::debug!("door closed in {:?}, ignored", self.code());
                }
                return;
            }
            _ => {}
        }

        // The watchdog pairs with exactly one completion per batch.
        if matches!(event, Event::MotionCompleted { .. }) {
            ops.disarm_motor_timeout();
        }

        match &self.state {
            PrinterState::Initializing => self.in_initializing(ops, event),
            PrinterState::DoorClosed(_) => self.in_door_closed(ops, event),
            PrinterState::DoorOpen { .. } => self.in_door_open(ops, event),
            PrinterState::Error => {
                if event == Event::Reset {
                    self.goto(ops, PrinterState::DoorClosed(Screen::Idle));
                } else {
                    tracing::debug!("{event:?} ignored in Error");
                }
            }
        }
    }

    fn in_initializing(&mut self, ops: &mut dyn EngineOps, event: Event) {
        match event {
            Event::MotionCompleted { success: true } => {
                self.goto(ops, PrinterState::DoorClosed(Screen::Home));
            }
            Event::MotionCompleted { success: false } => {
                // Never reached home; the position is unknown.
                self.goto(ops, PrinterState::DoorClosed(Screen::Idle));
            }
            other => tracing::warn!("{other:?} ignored during initialization"),
        }
    }

    fn in_door_open(&mut self, ops: &mut dyn EngineOps, event: Event) {
        match event {
            ev @ (Event::MotionCompleted { .. } | Event::GotSetting) => {
                if let PrinterState::DoorOpen { deferred, .. } = &mut self.state {
                    if deferred.is_some() {
                        tracing::warn!("second completion while door open, dropping {ev:?}");
                    } else {
                        *deferred = Some(ev);
                    }
                }
            }
            Event::Cancel => {
                // Roll back without moving; homing starts once the door
                // closes again.
                ops.stop_motor();
                ops.cancel_print();
                ops.show_black();
                self.deferred_ui = None;
                if let PrinterState::DoorOpen { resume, deferred } = &mut self.state {
                    *resume = Screen::AwaitingCancelation;
                    *deferred = None;
                }
                ops.publish(StateCode::DoorOpen, StatusChange::NoChange);
            }
            other => tracing::debug!("{other:?} ignored while door open"),
        }
    }

    fn in_door_closed(&mut self, ops: &mut dyn EngineOps, event: Event) {
        let PrinterState::DoorClosed(screen) = &self.state else {
            unreachable!();
        };
        match (screen.clone(), event) {
            // ---- Idle / Home: waiting for work ----
            (Screen::Idle, Event::StartPrint | Event::RightButton) => {
                self.start_print(ops, false);
            }
            (Screen::Home, Event::StartPrint | Event::RightButton) => {
                self.start_print(ops, true);
            }
            (Screen::Idle | Screen::Home, Event::Cancel) => {
                // Absorbing: nothing to cancel.
            }
            (Screen::Idle, Event::LeftAndRightButton) => {
                self.goto_screen(ops, Screen::ShowingVersion { from_home: false });
            }
            (Screen::Home, Event::LeftAndRightButton) => {
                self.goto_screen(ops, Screen::ShowingVersion { from_home: true });
            }
            (Screen::Idle | Screen::Home, Event::Connected) => {
                self.goto_screen(ops, Screen::Registering);
            }
            (Screen::Home, Event::RightButtonHold) => {
                if ops.motor_go_to_start_position() {
                    self.goto_screen(ops, Screen::Calibrating { leaving: false });
                }
            }

            // ---- Version screen ----
            (
                Screen::ShowingVersion { from_home },
                Event::LeftButton
                | Event::RightButton
                | Event::LeftAndRightButton
                | Event::Cancel,
            ) => {
                let back = if from_home { Screen::Home } else { Screen::Idle };
                self.goto_screen(ops, back);
            }

            // ---- Registration ----
            (Screen::Registering, Event::Registered) => {
                self.goto_screen(ops, Screen::Home);
            }
            (Screen::Registering, Event::Cancel | Event::LeftButton) => {
                self.goto_screen(ops, Screen::Home);
            }
            (Screen::Registering, Event::Connected) => {
                ops.publish(StateCode::Registering, StatusChange::NoChange);
            }

            // ---- Calibration ----
            (Screen::Calibrating { leaving: false }, Event::MotionCompleted { success: true }) => {
                ops.publish(StateCode::Calibrating, StatusChange::NoChange);
            }
            (Screen::Calibrating { leaving: true }, Event::MotionCompleted { success: true }) => {
                self.goto_screen(ops, Screen::Home);
            }
            (Screen::Calibrating { .. }, Event::MotionCompleted { success: false }) => {
                self.begin_cancel(ops);
            }
            (
                Screen::Calibrating { leaving: false },
                Event::LeftButton | Event::RightButton | Event::Cancel,
            ) => {
                if ops.motor_go_home() {
                    self.set_screen(Screen::Calibrating { leaving: true });
                    ops.publish(StateCode::Calibrating, StatusChange::NoChange);
                } else {
                    self.goto_screen(ops, Screen::Home);
                }
            }

            // ---- Cancel convergence ----
            (Screen::Printing(_), Event::Cancel) => self.begin_cancel(ops),
            (Screen::AwaitingCancelation | Screen::EndingPrint, Event::Cancel) => {
                // Already rolling back or finishing.
            }
            (Screen::AwaitingCancelation, Event::MotionCompleted { .. }) => {
                // Best effort: however the homing batch ended, settle down.
                self.goto_screen(ops, Screen::Home);
            }
            (Screen::EndingPrint, Event::MotionCompleted { success: true }) => {
                ops.finish_print();
                self.goto_screen(ops, Screen::Home);
            }
            (Screen::EndingPrint, Event::MotionCompleted { success: false }) => {
                self.goto_screen(ops, Screen::Home);
            }
            (Screen::ConfirmingCancel(_), Event::Cancel | Event::LeftButton) => {
                self.begin_cancel(ops);
            }
            (Screen::ConfirmingCancel(resume), Event::RightButton | Event::Resume) => {
                self.resume_from(ops, resume);
            }

            // ---- The print cycle proper ----
            (Screen::Printing(printing), event) => self.in_printing(ops, printing, event),

            (screen, event) => {
                tracing::warn!("{event:?} has no effect in {screen:?}");
            }
        }
    }

    fn in_printing(&mut self, ops: &mut dyn EngineOps, printing: Printing, event: Event) {
        match (printing, event) {
            // ---- Preparation ----
            (Printing::Preparing(Prep::Homing), Event::MotionCompleted { success: true }) => {
                self.enter_settings_phase(ops);
            }
            (Printing::Preparing(Prep::SendingSettings), Event::GotSetting) => {
                if !ops.send_next_pending_setting() {
                    self.enter_moving_to_start(ops);
                }
            }
            (
                Printing::Preparing(Prep::MovingToStart),
                Event::MotionCompleted { success: true },
            ) => {
                ops.begin_first_layer();
                if ops.prompt_before_first_layer() {
                    self.goto_screen(ops, Screen::Printing(Printing::PressingButton));
                } else {
                    self.enter_approaching(ops);
                }
            }

            // ---- First-layer confirmation ----
            (Printing::PressingButton, Event::RightButton | Event::StartPrint) => {
                self.enter_approaching(ops);
            }
            (Printing::PressingButton, Event::LeftButton) => {
                self.begin_cancel(ops);
            }

            // ---- Exposure ----
            (Printing::Exposing, Event::Exposed) => {
                ops.show_black();
                self.enter_separating(ops);
            }
            (Printing::Exposing, Event::Pause | Event::RightButton) => {
                let resume = self.freeze_exposure(ops);
                self.goto_screen(ops, Screen::Printing(Printing::PausedByUser(resume)));
            }
            (Printing::Exposing, Event::LeftButton) => {
                let resume = self.freeze_exposure(ops);
                self.goto_screen(ops, Screen::ConfirmingCancel(resume));
            }

            // ---- Motion phases ----
            (
                Printing::Separating | Printing::Approaching,
                Event::Pause | Event::RightButton,
            ) => {
                self.deferred_ui = Some(DeferredUi::Pause);
            }
            (Printing::Separating | Printing::Approaching, Event::LeftButton) => {
                self.deferred_ui = Some(DeferredUi::ConfirmCancel);
            }
            (Printing::Separating, Event::MotionCompleted { success: true }) => {
                if ops.advance_layer() {
                    match self.deferred_ui.take() {
                        None => self.enter_approaching(ops),
                        Some(DeferredUi::Pause) => self.goto_screen(
                            ops,
                            Screen::Printing(Printing::PausedByUser(PauseResume::BeforeApproach)),
                        ),
                        Some(DeferredUi::ConfirmCancel) => self.goto_screen(
                            ops,
                            Screen::ConfirmingCancel(PauseResume::BeforeApproach),
                        ),
                    }
                } else {
                    self.enter_ending_print(ops);
                }
            }
            (Printing::Approaching, Event::MotionCompleted { success: true }) => {
                match self.deferred_ui.take() {
                    None => self.enter_exposing(ops),
                    Some(DeferredUi::Pause) => self.goto_screen(
                        ops,
                        Screen::Printing(Printing::PausedByUser(PauseResume::BeforeExpose)),
                    ),
                    Some(DeferredUi::ConfirmCancel) => {
                        self.goto_screen(ops, Screen::ConfirmingCancel(PauseResume::BeforeExpose))
                    }
                }
            }

            // ---- Pause, inspect, resume ----
            (Printing::PausedByUser(resume), Event::Resume | Event::RightButton) => {
                self.resume_from(ops, resume);
            }
            (Printing::PausedByUser(resume), Event::LeftButton) => {
                self.goto_screen(ops, Screen::ConfirmingCancel(resume));
            }
            (Printing::PausedByUser(resume), Event::RightButtonHold) => {
                if ops.motor_pause_and_inspect() {
                    self.goto_screen(
                        ops,
                        Screen::Printing(Printing::Inspecting {
                            arrived: false,
                            resume,
                        }),
                    );
                } else {
                    self.begin_cancel(ops);
                }
            }
            (
                Printing::Inspecting { arrived: false, resume },
                Event::MotionCompleted { success: true },
            ) => {
                self.set_screen(Screen::Printing(Printing::Inspecting {
                    arrived: true,
                    resume,
                }));
                ops.publish(StateCode::Inspecting, StatusChange::NoChange);
            }
            (
                Printing::Inspecting { arrived: true, resume },
                Event::Resume | Event::RightButton,
            ) => {
                self.goto_screen(
                    ops,
                    Screen::Printing(Printing::ConfirmingResume {
                        returning: false,
                        resume,
                    }),
                );
            }
            (Printing::Inspecting { .. }, Event::LeftButton) => {
                self.begin_cancel(ops);
            }
            (
                Printing::ConfirmingResume { returning: false, resume },
                Event::Resume | Event::RightButton,
            ) => {
                if ops.motor_resume_from_inspect() {
                    self.set_screen(Screen::Printing(Printing::ConfirmingResume {
                        returning: true,
                        resume,
                    }));
                    ops.publish(StateCode::ConfirmingResume, StatusChange::NoChange);
                } else {
                    self.begin_cancel(ops);
                }
            }
            (
                Printing::ConfirmingResume { returning: false, resume },
                Event::LeftButton,
            ) => {
                self.goto_screen(
                    ops,
                    Screen::Printing(Printing::Inspecting {
                        arrived: true,
                        resume,
                    }),
                );
            }
            (
                Printing::ConfirmingResume { returning: true, resume },
                Event::MotionCompleted { success: true },
            ) => {
                // The rotary axis was disturbed while inspecting; re-home
                // it before the next approach.
                ops.set_jam_recovery(true);
                self.resume_from(ops, resume);
            }

            // ---- Failed motion: non-fatal error plus immediate cancel ----
            (_, Event::MotionCompleted { success: false }) => {
                self.begin_cancel(ops);
            }

            (printing, event) => {
                tracing::warn!("{event:?} has no effect in {printing:?}");
            }
        }
    }

    /// Begin a print. `homed` distinguishes Home (go straight to the
    /// settings handshake) from Idle (home first).
    fn start_print(&mut self, ops: &mut dyn EngineOps, homed: bool) {
        if !ops.start_print_job() {
            return;
        }
        if homed {
            self.enter_settings_phase(ops);
        } else if ops.motor_go_home() {
            self.goto_screen(ops, Screen::Printing(Printing::Preparing(Prep::Homing)));
        }
    }

    fn enter_settings_phase(&mut self, ops: &mut dyn EngineOps) {
        if ops.send_next_pending_setting() {
            self.goto_screen(
                ops,
                Screen::Printing(Printing::Preparing(Prep::SendingSettings)),
            );
        } else {
            self.enter_moving_to_start(ops);
        }
    }

    fn enter_moving_to_start(&mut self, ops: &mut dyn EngineOps) {
        if ops.motor_go_to_start_position() {
            self.goto_screen(
                ops,
                Screen::Printing(Printing::Preparing(Prep::MovingToStart)),
            );
        } else {
            self.begin_cancel(ops);
        }
    }

    fn enter_approaching(&mut self, ops: &mut dyn EngineOps) {
        let un_jam = ops.jam_recovery();
        if ops.motor_approach(un_jam) {
            ops.set_jam_recovery(false);
            self.goto_screen(ops, Screen::Printing(Printing::Approaching));
        } else {
            self.begin_cancel(ops);
        }
    }

    fn enter_separating(&mut self, ops: &mut dyn EngineOps) {
        if ops.motor_separate() {
            self.goto_screen(ops, Screen::Printing(Printing::Separating));
        } else {
            self.begin_cancel(ops);
        }
    }

    fn enter_exposing(&mut self, ops: &mut dyn EngineOps) {
        ops.projector_power(true);
        if !ops.show_current_layer() {
            // Fatal already queued; it will land us in Error.
            return;
        }
        ops.arm_exposure_timer(ops.exposure_seconds());
        self.goto_screen(ops, Screen::Printing(Printing::Exposing));
    }

    fn resume_exposing(&mut self, ops: &mut dyn EngineOps, remaining_sec: f64) {
        if remaining_sec <= 0.0 {
            // The exposure had effectively finished when it was paused.
            ops.show_black();
            self.enter_separating(ops);
            return;
        }
        ops.projector_power(true);
        if !ops.show_current_layer() {
            return;
        }
        ops.arm_exposure_timer(remaining_sec);
        self.goto_screen(ops, Screen::Printing(Printing::Exposing));
    }

    fn enter_ending_print(&mut self, ops: &mut dyn EngineOps) {
        if ops.motor_go_home() {
            self.goto_screen(ops, Screen::EndingPrint);
        } else {
            ops.finish_print();
            self.goto_screen(ops, Screen::Home);
        }
    }

    /// Stop the light, capture what is left of the exposure.
    fn freeze_exposure(&mut self, ops: &mut dyn EngineOps) -> PauseResume {
        let remaining_sec = ops.exposure_remaining();
        ops.disarm_exposure_timer();
        ops.show_black();
        PauseResume::Exposure { remaining_sec }
    }

    fn resume_from(&mut self, ops: &mut dyn EngineOps, resume: PauseResume) {
        match resume {
            PauseResume::Exposure { remaining_sec } => self.resume_exposing(ops, remaining_sec),
            PauseResume::BeforeApproach => self.enter_approaching(ops),
            PauseResume::BeforeExpose => self.enter_exposing(ops),
        }
    }

    /// Roll the machine back to Home through AwaitingCancelation.
    fn begin_cancel(&mut self, ops: &mut dyn EngineOps) {
        ops.disarm_exposure_timer();
        ops.show_black();
        ops.stop_motor();
        ops.cancel_print();
        self.deferred_ui = None;
        if ops.motor_go_home() {
            self.goto_screen(ops, Screen::AwaitingCancelation);
        } else {
            self.goto_screen(ops, Screen::Home);
        }
    }

    fn restore_after_door(&mut self, ops: &mut dyn EngineOps, resume: Screen) {
        match resume {
            Screen::Printing(Printing::Exposing) => {
                // Exposure is aborted, not resumed: restart it whole.
                ops.projector_power(true);
                if !ops.show_current_layer() {
                    return;
                }
                ops.arm_exposure_timer(ops.exposure_seconds());
                self.goto(
                    ops,
                    PrinterState::DoorClosed(Screen::Printing(Printing::Exposing)),
                );
            }
            Screen::AwaitingCancelation => {
                // A cancel requested while the door was open still owes the
                // homing move.
                if ops.motion_in_flight() || ops.motor_go_home() {
                    self.goto(ops, PrinterState::DoorClosed(Screen::AwaitingCancelation));
                } else {
                    self.goto(ops, PrinterState::DoorClosed(Screen::Home));
                }
            }
            screen => self.goto(ops, PrinterState::DoorClosed(screen)),
        }
    }

    fn goto_screen(&mut self, ops: &mut dyn EngineOps, screen: Screen) {
        self.goto(ops, PrinterState::DoorClosed(screen));
    }

    /// Replace the screen without publishing; used for payload-only changes
    /// that publish a NoChange record themselves.
    fn set_screen(&mut self, screen: Screen) {
        self.state = PrinterState::DoorClosed(screen);
    }

    fn goto(&mut self, ops: &mut dyn EngineOps, next: PrinterState) {
        ops.publish(code_of(&self.state), StatusChange::Leaving);
        tracing::info!("{:?} -> {:?}", code_of(&self.state), code_of(&next));
        self.state = next;
        ops.publish(code_of(&self.state), StatusChange::Entering);
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

pub fn code_of(state: &PrinterState) -> StateCode {
    match state {
        PrinterState::Initializing => StateCode::Initializing,
        PrinterState::Error => StateCode::Error,
        PrinterState::DoorOpen { .. } => StateCode::DoorOpen,
        PrinterState::DoorClosed(screen) => match screen {
            Screen::Idle => StateCode::Idle,
            Screen::Home => StateCode::Home,
            Screen::Registering => StateCode::Registering,
            Screen::ConfirmingCancel(_) => StateCode::ConfirmingCancel,
            Screen::AwaitingCancelation => StateCode::AwaitingCancelation,
            Screen::EndingPrint => StateCode::EndingPrint,
            Screen::ShowingVersion { .. } => StateCode::ShowingVersion,
            Screen::Calibrating { .. } => StateCode::Calibrating,
            Screen::Printing(printing) => match printing {
                Printing::Preparing(Prep::Homing) => StateCode::Homing,
                Printing::Preparing(_) => StateCode::Preparing,
                Printing::PressingButton => StateCode::PressingButton,
                Printing::Exposing => StateCode::Exposing,
                Printing::Separating => StateCode::Separating,
                Printing::Approaching => StateCode::Approaching,
                Printing::PausedByUser(_) => StateCode::PausedByUser,
                Printing::Inspecting { .. } => StateCode::Inspecting,
                Printing::ConfirmingResume { .. } => StateCode::ConfirmingResume,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted EngineOps that records every side effect.
    struct MockOps {
        calls: Vec<String>,
        statuses: Vec<(StateCode, StatusChange)>,
        errors: Vec<(ErrorCode, bool)>,
        current_layer: u32,
        num_layers: u32,
        staged_layers: u32,
        pending_settings: usize,
        exposure_armed: Option<f64>,
        exposure_left: f64,
        motor_ok: bool,
        show_ok: bool,
        prompt: bool,
        jam: bool,
        in_flight: bool,
        watchdog_armed: bool,
    }

    impl MockOps {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                statuses: Vec::new(),
                errors: Vec::new(),
                current_layer: 0,
                num_layers: 0,
                staged_layers: 3,
                pending_settings: 0,
                exposure_armed: None,
                exposure_left: 0.0,
                motor_ok: true,
                show_ok: true,
                prompt: false,
                jam: false,
                in_flight: false,
                watchdog_armed: false,
            }
        }

        fn motor_op(&mut self, name: &str) -> bool {
            self.calls.push(name.to_string());
            if self.motor_ok {
                self.watchdog_armed = true;
                self.in_flight = true;
                true
            } else {
                self.errors.push((ErrorCode::MotorError, false));
                false
            }
        }

        fn entered(&self) -> Vec<StateCode> {
            self.statuses
                .iter()
                .filter(|(_, c)| *c == StatusChange::Entering)
                .map(|(s, _)| *s)
                .collect()
        }
    }

    impl EngineOps for MockOps {
        fn arm_exposure_timer(&mut self, seconds: f64) {
            self.calls.push(format!("arm_exposure({seconds:.2})"));
            self.exposure_armed = Some(seconds);
            self.exposure_left = seconds;
        }
        fn disarm_exposure_timer(&mut self) {
            self.calls.push("disarm_exposure".into());
            self.exposure_armed = None;
        }
        fn exposure_remaining(&mut self) -> f64 {
            self.exposure_left
        }
        fn disarm_motor_timeout(&mut self) {
            self.watchdog_armed = false;
            self.in_flight = false;
        }
        fn motor_go_home(&mut self) -> bool {
            self.motor_op("go_home")
        }
        fn motor_go_to_start_position(&mut self) -> bool {
            self.motor_op("go_to_start")
        }
        fn motor_separate(&mut self) -> bool {
            self.motor_op("separate")
        }
        fn motor_approach(&mut self, un_jam_first: bool) -> bool {
            self.motor_op(if un_jam_first { "approach+unjam" } else { "approach" })
        }
        fn motor_pause(&mut self) {
            self.calls.push("motor_pause".into());
        }
        fn motor_resume(&mut self) {
            self.calls.push("motor_resume".into());
        }
        fn motor_pause_and_inspect(&mut self) -> bool {
            self.motor_op("pause_and_inspect")
        }
        fn motor_resume_from_inspect(&mut self) -> bool {
            self.motor_op("resume_from_inspect")
        }
        fn stop_motor(&mut self) {
            self.calls.push("stop_motor".into());
            self.watchdog_armed = false;
            self.in_flight = false;
        }
        fn send_next_pending_setting(&mut self) -> bool {
            if self.pending_settings > 0 {
                self.pending_settings -= 1;
                self.calls.push("send_setting".into());
                true
            } else {
                false
            }
        }
        fn motion_in_flight(&self) -> bool {
            self.in_flight
        }
        fn show_current_layer(&mut self) -> bool {
            self.calls.push(format!("show_layer({})", self.current_layer));
            if !self.show_ok {
                self.errors.push((ErrorCode::CantShowImage, true));
            }
            self.show_ok
        }
        fn show_black(&mut self) {
            self.calls.push("show_black".into());
        }
        fn projector_power(&mut self, on: bool) {
            self.calls.push(format!("power({on})"));
        }
        fn start_print_job(&mut self) -> bool {
            if self.staged_layers == 0 {
                self.errors.push((ErrorCode::NoPrintDataAvailable, false));
                return false;
            }
            self.num_layers = self.staged_layers;
            self.current_layer = 0;
            true
        }
        fn begin_first_layer(&mut self) {
            self.current_layer = 1;
        }
        fn advance_layer(&mut self) -> bool {
            if self.current_layer < self.num_layers {
                self.current_layer += 1;
                true
            } else {
                false
            }
        }
        fn finish_print(&mut self) {
            self.current_layer = 0;
        }
        fn cancel_print(&mut self) {
            self.calls.push("cancel_print".into());
            self.exposure_armed = None;
            self.current_layer = 0;
            self.num_layers = 0;
        }
        fn prompt_before_first_layer(&self) -> bool {
            self.prompt
        }
        fn exposure_seconds(&self) -> f64 {
            2.0
        }
        fn set_jam_recovery(&mut self, on: bool) {
            self.jam = on;
        }
        fn jam_recovery(&self) -> bool {
            self.jam
        }
        fn publish(&mut self, state: StateCode, change: StatusChange) {
            self.statuses.push((state, change));
        }
        fn raise(&mut self, code: ErrorCode, fatal: bool, _detail: Option<i32>) {
            self.errors.push((code, fatal));
        }
    }

    fn at_home() -> (StateMachine, MockOps) {
        let mut sm = StateMachine::new();
        let mut ops = MockOps::new();
        sm.handle(&mut ops, Event::MotionCompleted { success: true });
        assert_eq!(sm.code(), StateCode::Home);
        (sm, ops)
    }

    /// Drive a freshly-started print up to the Exposing state of layer 1.
    fn exposing_layer_one(sm: &mut StateMachine, ops: &mut MockOps) {
        sm.handle(ops, Event::StartPrint);
        assert_eq!(sm.code(), StateCode::Preparing);
        sm.handle(ops, Event::MotionCompleted { success: true }); // start position
        assert_eq!(sm.code(), StateCode::Approaching);
        sm.handle(ops, Event::MotionCompleted { success: true }); // approach L1
        assert_eq!(sm.code(), StateCode::Exposing);
    }

    #[test]
    fn start_without_data_stays_home() {
        let (mut sm, mut ops) = at_home();
        ops.staged_layers = 0;
        sm.handle(&mut ops, Event::StartPrint);
        assert_eq!(sm.code(), StateCode::Home);
        assert_eq!(ops.errors, vec![(ErrorCode::NoPrintDataAvailable, false)]);
        assert_eq!(ops.num_layers, 0);
    }

    #[test]
    fn happy_three_layer_print() {
        let (mut sm, mut ops) = at_home();
        ops.staged_layers = 3;
        ops.pending_settings = 2;

        sm.handle(&mut ops, Event::StartPrint);
        assert_eq!(sm.code(), StateCode::Preparing);
        // Two pending settings: first sent on entry, next per ack, then the
        // exhausted list triggers the travel to the start position.
        sm.handle(&mut ops, Event::GotSetting);
        assert_eq!(sm.code(), StateCode::Preparing);
        sm.handle(&mut ops, Event::GotSetting);
        assert!(ops.calls.contains(&"go_to_start".to_string()));

        sm.handle(&mut ops, Event::MotionCompleted { success: true }); // at start
        for layer in 1..=3u32 {
            assert_eq!(sm.code(), StateCode::Approaching);
            sm.handle(&mut ops, Event::MotionCompleted { success: true });
            assert_eq!(sm.code(), StateCode::Exposing);
            assert_eq!(ops.current_layer, layer);
            assert!(ops.exposure_armed.is_some());
            sm.handle(&mut ops, Event::Exposed);
            assert_eq!(sm.code(), StateCode::Separating);
            sm.handle(&mut ops, Event::MotionCompleted { success: true });
        }
        // After the last separate the machine homes and finishes.
        assert_eq!(sm.code(), StateCode::EndingPrint);
        sm.handle(&mut ops, Event::MotionCompleted { success: true });
        assert_eq!(sm.code(), StateCode::Home);
        assert_eq!(ops.current_layer, 0);
        assert_eq!(ops.num_layers, 3);
        assert!(ops.errors.is_empty());
    }

    #[test]
    fn every_interrupt_batch_is_watchdog_paired() {
        let (mut sm, mut ops) = at_home();
        exposing_layer_one(&mut sm, &mut ops);
        // The approach batch armed the watchdog and its completion disarmed
        // it before anything else was issued.
        assert!(!ops.watchdog_armed);
        sm.handle(&mut ops, Event::Exposed);
        assert!(ops.watchdog_armed); // separate in flight
        sm.handle(&mut ops, Event::MotionCompleted { success: true });
        assert!(ops.watchdog_armed); // next approach in flight
    }

    #[test]
    fn fatal_error_stops_motor_and_lands_in_error() {
        let (mut sm, mut ops) = at_home();
        exposing_layer_one(&mut sm, &mut ops);
        sm.handle(&mut ops, Event::Exposed); // separating now
        ops.calls.clear();

        sm.handle(&mut ops, Event::Error { fatal: true });
        assert_eq!(sm.code(), StateCode::Error);
        assert!(ops.calls.contains(&"stop_motor".to_string()));
        assert!(ops.calls.contains(&"cancel_print".to_string()));
        assert!(ops.calls.contains(&"show_black".to_string()));
        assert_eq!(ops.num_layers, 0);

        // Only Reset leaves Error
        sm.handle(&mut ops, Event::StartPrint);
        sm.handle(&mut ops, Event::Cancel);
        assert_eq!(sm.code(), StateCode::Error);
        sm.handle(&mut ops, Event::Reset);
        assert_eq!(sm.code(), StateCode::Idle);
    }

    #[test]
    fn print_from_idle_homes_first() {
        let mut sm = StateMachine::new();
        let mut ops = MockOps::new();
        sm.handle(&mut ops, Event::MotionCompleted { success: false });
        assert_eq!(sm.code(), StateCode::Idle);

        sm.handle(&mut ops, Event::StartPrint);
        assert_eq!(sm.code(), StateCode::Homing);
        assert!(ops.calls.contains(&"go_home".to_string()));
        sm.handle(&mut ops, Event::MotionCompleted { success: true });
        // No pending settings: straight to the start position
        assert_eq!(sm.code(), StateCode::Preparing);
        assert!(ops.calls.contains(&"go_to_start".to_string()));
    }

    #[test]
    fn door_open_mid_exposure_blacks_and_restarts_exposure() {
        let (mut sm, mut ops) = at_home();
        ops.staged_layers = 3;
        exposing_layer_one(&mut sm, &mut ops);
        sm.handle(&mut ops, Event::Exposed);
        sm.handle(&mut ops, Event::MotionCompleted { success: true }); // approach L2
        sm.handle(&mut ops, Event::MotionCompleted { success: true }); // exposing L2
        assert_eq!(sm.code(), StateCode::Exposing);
        assert_eq!(ops.current_layer, 2);
        ops.calls.clear();

        sm.handle(&mut ops, Event::DoorOpened);
        assert_eq!(sm.code(), StateCode::DoorOpen);
        assert_eq!(
            ops.calls,
            vec!["disarm_exposure", "show_black", "power(false)", "motor_pause"]
        );
        assert!(ops.exposure_armed.is_none());

        ops.calls.clear();
        sm.handle(&mut ops, Event::DoorClosed);
        assert_eq!(sm.code(), StateCode::Exposing);
        // Same layer, fresh full exposure, light back on
        assert_eq!(ops.current_layer, 2);
        assert_eq!(ops.exposure_armed, Some(2.0));
        assert!(ops.calls.contains(&"power(true)".to_string()));
        assert!(ops.calls.contains(&"show_layer(2)".to_string()));
    }

    #[test]
    fn door_pairing_restores_motion_states_with_deferred_completion() {
        let (mut sm, mut ops) = at_home();
        exposing_layer_one(&mut sm, &mut ops);
        sm.handle(&mut ops, Event::Exposed);
        assert_eq!(sm.code(), StateCode::Separating);

        sm.handle(&mut ops, Event::DoorOpened);
        // The batch completes while the door is open: no new motion may be
        // issued yet.
        let issued_before = ops.calls.len();
        sm.handle(&mut ops, Event::MotionCompleted { success: true });
        assert_eq!(sm.code(), StateCode::DoorOpen);
        assert_eq!(ops.calls.len(), issued_before);

        sm.handle(&mut ops, Event::DoorClosed);
        // Restored to Separating, then the deferred completion advanced us.
        assert_eq!(sm.code(), StateCode::Approaching);
        assert_eq!(ops.current_layer, 2);
    }

    #[test]
    fn cancel_converges_to_home_from_printing_states() {
        // From Exposing
        let (mut sm, mut ops) = at_home();
        exposing_layer_one(&mut sm, &mut ops);
        sm.handle(&mut ops, Event::Cancel);
        assert_eq!(sm.code(), StateCode::AwaitingCancelation);
        assert!(ops.calls.contains(&"stop_motor".to_string()));
        assert_eq!(ops.num_layers, 0);
        sm.handle(&mut ops, Event::MotionCompleted { success: true });
        assert_eq!(sm.code(), StateCode::Home);

        // Cancel is absorbing at Home
        let calls = ops.calls.len();
        sm.handle(&mut ops, Event::Cancel);
        assert_eq!(sm.code(), StateCode::Home);
        assert_eq!(ops.calls.len(), calls);
    }

    #[test]
    fn failed_motion_is_cancel() {
        let (mut sm, mut ops) = at_home();
        exposing_layer_one(&mut sm, &mut ops);
        sm.handle(&mut ops, Event::Exposed);
        sm.handle(&mut ops, Event::MotionCompleted { success: false });
        assert_eq!(sm.code(), StateCode::AwaitingCancelation);
        sm.handle(&mut ops, Event::MotionCompleted { success: true });
        assert_eq!(sm.code(), StateCode::Home);
    }

    #[test]
    fn pause_during_exposure_keeps_the_remainder() {
        let (mut sm, mut ops) = at_home();
        exposing_layer_one(&mut sm, &mut ops);
        ops.exposure_left = 1.25;

        sm.handle(&mut ops, Event::Pause);
        assert_eq!(sm.code(), StateCode::PausedByUser);
        assert!(ops.exposure_armed.is_none());
        assert!(ops.calls.contains(&"show_black".to_string()));

        ops.calls.clear();
        sm.handle(&mut ops, Event::Resume);
        assert_eq!(sm.code(), StateCode::Exposing);
        assert_eq!(ops.exposure_armed, Some(1.25));
    }

    #[test]
    fn pause_during_separation_waits_for_the_batch() {
        let (mut sm, mut ops) = at_home();
        exposing_layer_one(&mut sm, &mut ops);
        sm.handle(&mut ops, Event::Exposed);
        assert_eq!(sm.code(), StateCode::Separating);

        sm.handle(&mut ops, Event::Pause);
        // Still separating; the pause lands at the batch boundary.
        assert_eq!(sm.code(), StateCode::Separating);
        sm.handle(&mut ops, Event::MotionCompleted { success: true });
        assert_eq!(sm.code(), StateCode::PausedByUser);
        assert_eq!(ops.current_layer, 2);

        sm.handle(&mut ops, Event::Resume);
        assert_eq!(sm.code(), StateCode::Approaching);
    }

    #[test]
    fn inspect_flow_sets_jam_recovery_for_next_approach() {
        let (mut sm, mut ops) = at_home();
        exposing_layer_one(&mut sm, &mut ops);
        sm.handle(&mut ops, Event::Exposed);
        sm.handle(&mut ops, Event::Pause);
        sm.handle(&mut ops, Event::MotionCompleted { success: true }); // paused before approach

        sm.handle(&mut ops, Event::RightButtonHold);
        assert_eq!(sm.code(), StateCode::Inspecting);
        assert!(ops.calls.contains(&"pause_and_inspect".to_string()));
        // Resume before arrival does nothing
        sm.handle(&mut ops, Event::Resume);
        assert_eq!(sm.code(), StateCode::Inspecting);

        sm.handle(&mut ops, Event::MotionCompleted { success: true }); // arrived
        sm.handle(&mut ops, Event::Resume);
        assert_eq!(sm.code(), StateCode::ConfirmingResume);
        sm.handle(&mut ops, Event::Resume);
        assert!(ops.calls.contains(&"resume_from_inspect".to_string()));
        sm.handle(&mut ops, Event::MotionCompleted { success: true }); // back in place
        // The approach after an inspect re-homes the rotary axis first.
        assert_eq!(sm.code(), StateCode::Approaching);
        assert!(ops.calls.contains(&"approach+unjam".to_string()));
        assert!(!ops.jam, "jam recovery is one-shot");
    }

    #[test]
    fn confirming_cancel_can_resume_or_confirm() {
        let (mut sm, mut ops) = at_home();
        exposing_layer_one(&mut sm, &mut ops);
        ops.exposure_left = 0.5;

        sm.handle(&mut ops, Event::LeftButton);
        assert_eq!(sm.code(), StateCode::ConfirmingCancel);
        // Right button declines and resumes the exposure remainder
        sm.handle(&mut ops, Event::RightButton);
        assert_eq!(sm.code(), StateCode::Exposing);
        assert_eq!(ops.exposure_armed, Some(0.5));

        sm.handle(&mut ops, Event::LeftButton);
        sm.handle(&mut ops, Event::LeftButton);
        assert_eq!(sm.code(), StateCode::AwaitingCancelation);
    }

    #[test]
    fn version_screen_round_trip() {
        let (mut sm, mut ops) = at_home();
        sm.handle(&mut ops, Event::LeftAndRightButton);
        assert_eq!(sm.code(), StateCode::ShowingVersion);
        sm.handle(&mut ops, Event::RightButton);
        assert_eq!(sm.code(), StateCode::Home);
    }

    #[test]
    fn registration_round_trip() {
        let (mut sm, mut ops) = at_home();
        sm.handle(&mut ops, Event::Connected);
        assert_eq!(sm.code(), StateCode::Registering);
        sm.handle(&mut ops, Event::Registered);
        assert_eq!(sm.code(), StateCode::Home);
    }

    #[test]
    fn unknown_events_do_not_transition() {
        let (mut sm, mut ops) = at_home();
        let statuses = ops.statuses.len();
        sm.handle(&mut ops, Event::Exposed);
        sm.handle(&mut ops, Event::GotSetting);
        sm.handle(&mut ops, Event::Resume);
        assert_eq!(sm.code(), StateCode::Home);
        assert_eq!(ops.statuses.len(), statuses);
        assert!(ops.errors.is_empty());
    }

    #[test]
    fn entry_is_published_after_leave() {
        let (mut sm, mut ops) = at_home();
        ops.statuses.clear();
        sm.handle(&mut ops, Event::StartPrint);
        assert_eq!(
            ops.statuses,
            vec![
                (StateCode::Home, StatusChange::Leaving),
                (StateCode::Preparing, StatusChange::Entering),
            ]
        );
    }

    #[test]
    fn show_image_failure_leaves_exposure_to_the_fault_path() {
        let (mut sm, mut ops) = at_home();
        ops.show_ok = false;
        sm.handle(&mut ops, Event::StartPrint);
        sm.handle(&mut ops, Event::MotionCompleted { success: true }); // at start
        assert_eq!(sm.code(), StateCode::Approaching);
        sm.handle(&mut ops, Event::MotionCompleted { success: true }); // approach done
        // Still not exposing; the fatal CantShowImage was raised instead.
        assert_ne!(sm.code(), StateCode::Exposing);
        assert_eq!(ops.errors, vec![(ErrorCode::CantShowImage, true)]);
        sm.handle(&mut ops, Event::Error { fatal: true });
        assert_eq!(sm.code(), StateCode::Error);
    }

    #[test]
    fn cancel_while_door_open_homes_after_closing() {
        let (mut sm, mut ops) = at_home();
        exposing_layer_one(&mut sm, &mut ops);
        sm.handle(&mut ops, Event::DoorOpened);
        ops.calls.clear();

        sm.handle(&mut ops, Event::Cancel);
        assert_eq!(sm.code(), StateCode::DoorOpen);
        assert!(ops.calls.contains(&"stop_motor".to_string()));
        assert!(!ops.calls.contains(&"go_home".to_string()));

        sm.handle(&mut ops, Event::DoorClosed);
        assert_eq!(sm.code(), StateCode::AwaitingCancelation);
        assert!(ops.calls.contains(&"go_home".to_string()));
        sm.handle(&mut ops, Event::MotionCompleted { success: true });
        assert_eq!(sm.code(), StateCode::Home);
    }

    #[test]
    fn calibration_from_home_and_back() {
        let (mut sm, mut ops) = at_home();
        sm.handle(&mut ops, Event::RightButtonHold);
        assert_eq!(sm.code(), StateCode::Calibrating);
        sm.handle(&mut ops, Event::MotionCompleted { success: true }); // arrived
        assert_eq!(sm.code(), StateCode::Calibrating);
        sm.handle(&mut ops, Event::RightButton); // leave
        sm.handle(&mut ops, Event::MotionCompleted { success: true });
        assert_eq!(sm.code(), StateCode::Home);
    }

    #[test]
    fn prompted_print_waits_for_the_button() {
        let (mut sm, mut ops) = at_home();
        ops.prompt = true;
        sm.handle(&mut ops, Event::StartPrint);
        sm.handle(&mut ops, Event::MotionCompleted { success: true }); // at start
        assert_eq!(sm.code(), StateCode::PressingButton);
        assert_eq!(ops.current_layer, 1);
        sm.handle(&mut ops, Event::RightButton);
        assert_eq!(sm.code(), StateCode::Approaching);
    }
}
