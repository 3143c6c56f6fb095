//! Board wiring of the protocol engine's collaborator contract.

use core::ptr;

use openrmc_proto::board::{
    Board, ExtControlLine, LedMode, LedPattern, LedTarget, NvKey, NvStatus, Rgb, UsbPort, VERSION_LEN,
};
use stm32f1xx_hal::gpio::{ErasedPin, Input, Output};

use crate::{app::monotonics, leds::Leds, nvstore::NvStore, power::PowerControl, watchman::Watchman};

/// Flash location of the bootloader version blob.
const BOOTLOADER_VERSION_ADDR: usize = 0x0800_00c0;

/// Hardware senses read live into the status words.
pub struct Senses {
    /// Card detect, active low.
    pub card_det: ErasedPin<Input>,
    /// High when the detected card is mSATA.
    pub msata_ind: ErasedPin<Input>,
    /// USB port overcurrent, active low.
    pub usb_ovc: [ErasedPin<Input>; 2],
    /// SFP module detect, active low.
    pub sfp_ndet: ErasedPin<Input>,
}

/// Board state and peripherals behind the protocol engine.
pub struct RmcBoard {
    pub power: PowerControl,
    pub leds: Leds,
    pub nv: NvStore,
    pub watchman: Watchman,
    senses: Senses,
    /// Peripheral control lines indexed by [`ExtControlLine`].
    ext: [ErasedPin<Output>; 9],
    sfp_disable: ErasedPin<Output>,
    /// User regulator voltage select lines, present on supported revisions.
    voltage_sel: Option<[ErasedPin<Output>; 2]>,
    watchdog_status: u8,
    firmware_version: [u8; VERSION_LEN],
}

impl RmcBoard {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        power: PowerControl, leds: Leds, nv: NvStore, watchman: Watchman, senses: Senses,
        ext: [ErasedPin<Output>; 9], sfp_disable: ErasedPin<Output>,
        voltage_sel: Option<[ErasedPin<Output>; 2]>, watchdog_status: u8,
    ) -> Self {
        Self {
            power,
            leds,
            nv,
            watchman,
            senses,
            ext,
            sfp_disable,
            voltage_sel,
            watchdog_status,
            firmware_version: crate::VERSION,
        }
    }

    /// Persisted watchdog enable status.
    pub fn watchdog_status(&self) -> u8 {
        self.watchdog_status
    }
}

impl Board for RmcBoard {
    fn firmware_version(&self) -> &[u8; VERSION_LEN] {
        &self.firmware_version
    }

    fn bootloader_version(&self) -> [u8; VERSION_LEN] {
        let mut version = [0; VERSION_LEN];
        for (i, b) in version.iter_mut().enumerate() {
            *b = unsafe { ptr::read_volatile((BOOTLOADER_VERSION_ADDR + i) as *const u8) };
        }
        version
    }

    fn card_detected(&self) -> bool {
        self.senses.card_det.is_low()
    }

    fn msata_inserted(&self) -> bool {
        self.senses.msata_ind.is_high()
    }

    fn usb_overcurrent(&self, port: UsbPort) -> bool {
        self.senses.usb_ovc[port as usize].is_low()
    }

    fn sfp_detected(&self) -> bool {
        self.senses.sfp_ndet.is_low()
    }

    fn led_states(&self) -> u32 {
        self.leds.packed_states()
    }

    fn set_usb_power(&mut self, port: UsbPort, on: bool) {
        self.power.set_usb_power(port, on);
    }

    fn request_aux_rail(&mut self) {
        self.power.request_aux(monotonics::now());
    }

    fn disable_aux_rail(&mut self) {
        self.power.disable_aux();
    }

    fn set_user_voltage(&mut self, value: u8) {
        match &mut self.voltage_sel {
            Some(sel) => {
                let bits = value.saturating_sub(1);
                sel[0].set_state((bits & 0b01 != 0).into());
                sel[1].set_state((bits & 0b10 != 0).into());
            }
            None => defmt::warn!("user regulator not present on this board"),
        }
    }

    fn light_reset(&mut self) {
        self.power.light_reset(monotonics::now());
    }

    fn request_hard_reset(&mut self) {
        self.power.request_hard_reset();
    }

    fn request_bootloader(&mut self) {
        self.power.request_bootloader();
    }

    fn set_sfp_disable(&mut self, disable: bool) {
        self.sfp_disable.set_state(disable.into());
    }

    fn set_ext_control(&mut self, line: ExtControlLine, asserted: bool) {
        self.ext[line as usize].set_state(asserted.into());
    }

    fn set_led_mode(&mut self, target: LedTarget, mode: LedMode) {
        self.leds.set_mode(target, mode);
    }

    fn set_led_state(&mut self, target: LedTarget, on: bool) {
        self.leds.set_state(target, on);
    }

    fn set_led_colour(&mut self, target: LedTarget, colour: Rgb) {
        self.leds.set_colour(target, colour);
    }

    fn set_led_color_correction(&mut self, target: LedTarget, enable: bool) {
        self.leds.set_correction(target, enable);
    }

    fn set_led_pattern(&mut self, target: LedTarget, pattern: LedPattern) {
        self.leds.set_pattern(target, pattern);
    }

    fn set_brightness(&mut self, value: u8) {
        self.leds.set_brightness(value);
    }

    fn brightness(&self) -> u8 {
        self.leds.brightness()
    }

    fn watchdog_state(&self) -> u8 {
        self.watchman.state()
    }

    fn set_watchdog_state(&mut self, state: u8) {
        self.watchman.set_state(state);
    }

    fn set_watchdog_status(&mut self, status: u8) {
        self.watchdog_status = status;
    }

    fn write_nv(&mut self, key: NvKey, value: u16) -> NvStatus {
        self.nv.write(key, value)
    }
}
