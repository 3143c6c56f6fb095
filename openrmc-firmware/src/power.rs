//! Power rail and reset line control.
//!
//! Rail startup is a state machine polled from a background task: each
//! regulator is enabled and its power-good sense is awaited with a bounded
//! timeout, so no interrupt context ever busy-waits on a rail. The
//! auxiliary 4.5 V rail follows the same scheme on demand from the bus
//! master; its completion is reported through the status word.

use openrmc_proto::board::UsbPort;
use stm32f1xx_hal::gpio::{ErasedPin, Input, Output};

use crate::{Duration, Instant};

/// Time allowed for a regulator to report power good.
const RAIL_TIMEOUT: Duration = Duration::millis(500);

/// MANRES assertion hold time during a light reset.
const RESET_HOLD: Duration = Duration::millis(100);

/// Regulator enable line with its power-good sense.
pub struct Rail {
    pub name: &'static str,
    pub enable: ErasedPin<Output>,
    pub good: ErasedPin<Input>,
}

impl Rail {
    fn start(&mut self) {
        self.enable.set_high();
    }

    fn stop(&mut self) {
        self.enable.set_low();
    }

    fn is_good(&self) -> bool {
        self.good.is_high()
    }
}

/// Main rail startup sequence progress.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Waiting { rail: usize, since: Instant },
    Done,
    Failed,
}

/// Auxiliary 4.5 V rail state.
#[derive(Clone, Copy, PartialEq, Eq)]
enum AuxState {
    Off,
    Starting { since: Instant },
    On,
}

/// Outcome of an auxiliary rail poll.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum AuxEvent {
    /// Power good seen; the status word bit may be set.
    Ready,
    /// The rail did not come up in time and was disabled again.
    TimedOut,
}

/// Power rail, USB power and reset line control.
pub struct PowerControl {
    /// Main rails in their required startup order.
    rails: [Rail; 7],
    phase: Phase,
    aux: Rail,
    aux_state: AuxState,
    /// USB port power switches, active low.
    usb_pwron: [ErasedPin<Output>; 2],
    cfg_ctrl: ErasedPin<Output>,
    manres: ErasedPin<Output>,
    reset_asserted: Option<Instant>,
    hard_reset_pending: bool,
    bootloader_pending: bool,
}

impl PowerControl {
    pub fn new(
        rails: [Rail; 7], aux: Rail, usb_pwron: [ErasedPin<Output>; 2], cfg_ctrl: ErasedPin<Output>,
        manres: ErasedPin<Output>,
    ) -> Self {
        Self {
            rails,
            phase: Phase::Idle,
            aux,
            aux_state: AuxState::Off,
            usb_pwron,
            cfg_ctrl,
            manres,
            reset_asserted: None,
            hard_reset_pending: false,
            bootloader_pending: false,
        }
    }

    /// Begins the main rail startup sequence.
    pub fn start_sequence(&mut self, now: Instant) {
        defmt::info!("starting power rail sequence");
        self.rails[0].start();
        self.phase = Phase::Waiting { rail: 0, since: now };
    }

    /// Advances the rail sequence. Returns true once all rails are up.
    pub fn poll_sequence(&mut self, now: Instant) -> bool {
        match self.phase {
            Phase::Waiting { rail, since } => {
                if self.rails[rail].is_good() {
                    defmt::debug!("rail {} power good", self.rails[rail].name);
                    match rail + 1 {
                        next if next < self.rails.len() => {
                            self.rails[next].start();
                            self.phase = Phase::Waiting { rail: next, since: now };
                        }
                        _ => {
                            defmt::info!("all power rails up");
                            self.phase = Phase::Done;
                        }
                    }
                } else if now.checked_duration_since(since).map(|d| d > RAIL_TIMEOUT).unwrap_or(false) {
                    defmt::error!("rail {} did not report power good", self.rails[rail].name);
                    self.disable_all();
                    self.phase = Phase::Failed;
                }
                self.phase == Phase::Done
            }
            Phase::Done => true,
            Phase::Idle | Phase::Failed => false,
        }
    }

    /// Shuts down all main rails in reverse order.
    pub fn disable_all(&mut self) {
        for rail in self.rails.iter_mut().rev() {
            rail.stop();
        }
        self.phase = Phase::Idle;
    }

    /// Requests startup of the auxiliary 4.5 V rail.
    pub fn request_aux(&mut self, now: Instant) {
        if self.aux_state == AuxState::Off {
            self.aux.start();
            self.aux_state = AuxState::Starting { since: now };
        }
    }

    /// Disables the auxiliary rail immediately.
    pub fn disable_aux(&mut self) {
        self.aux.stop();
        self.aux_state = AuxState::Off;
    }

    /// Polls the auxiliary rail startup.
    pub fn poll_aux(&mut self, now: Instant) -> Option<AuxEvent> {
        match self.aux_state {
            AuxState::Starting { since } => {
                if self.aux.is_good() {
                    defmt::info!("auxiliary rail power good");
                    self.aux_state = AuxState::On;
                    Some(AuxEvent::Ready)
                } else if now.checked_duration_since(since).map(|d| d > RAIL_TIMEOUT).unwrap_or(false)
                {
                    defmt::error!("auxiliary rail start timed out");
                    self.disable_aux();
                    Some(AuxEvent::TimedOut)
                } else {
                    None
                }
            }
            AuxState::Off | AuxState::On => None,
        }
    }

    /// Switches a USB port power switch (active low).
    pub fn set_usb_power(&mut self, port: UsbPort, on: bool) {
        let pin = &mut self.usb_pwron[port as usize];
        if on {
            pin.set_low();
        } else {
            pin.set_high();
        }
    }

    /// Performs the light reset line sequence.
    ///
    /// CFG_CTRL must be driven high before MANRES is asserted so the main
    /// CPU samples its boot configuration from the controller. MANRES is
    /// released by the background task after the hold time.
    pub fn light_reset(&mut self, now: Instant) {
        self.cfg_ctrl.set_high();
        self.manres.set_low();
        self.reset_asserted = Some(now);
    }

    /// Releases the manual reset line once its hold time has passed.
    pub fn poll_reset(&mut self, now: Instant) {
        if let Some(since) = self.reset_asserted {
            if now.checked_duration_since(since).map(|d| d > RESET_HOLD).unwrap_or(false) {
                self.manres.set_high();
                self.reset_asserted = None;
            }
        }
    }

    /// Latches a hard reset request for the main loop.
    pub fn request_hard_reset(&mut self) {
        self.hard_reset_pending = true;
    }

    /// Latches a bootloader entry request for the main loop.
    pub fn request_bootloader(&mut self) {
        self.bootloader_pending = true;
    }

    /// Takes a pending hard reset request.
    pub fn take_hard_reset(&mut self) -> bool {
        core::mem::take(&mut self.hard_reset_pending)
    }

    /// Takes a pending bootloader entry request.
    pub fn take_bootloader(&mut self) -> bool {
        core::mem::take(&mut self.bootloader_pending)
    }
}
