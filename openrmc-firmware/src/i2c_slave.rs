//! Dual-address I2C slave driver with interrupt support.
//!
//! The driver owns the peripheral and translates its status flags into
//! protocol events in a fixed priority order: error conditions first, then
//! address match, stop, received byte and byte request. Transaction state
//! lives in the protocol engine; the driver only clears hardware flags and
//! applies the engine's bus-level actions.

use core::{convert::Infallible, ops::Deref};

use openrmc_proto::{Action, BusIdentity, Direction, Event};
use stm32f1xx_hal::{
    afio::MAPR,
    gpio::{self, Alternate, OpenDrain},
    pac::{I2C1, RCC},
    rcc::{BusClock, Clocks, Enable, Reset},
    time::Hertz,
};

/// Helper trait to ensure that the correct I2C pins are used for the
/// corresponding interface.
pub trait Pins<I2C> {
    const REMAP: bool;
}

impl Pins<I2C1> for (gpio::PB6<Alternate<OpenDrain>>, gpio::PB7<Alternate<OpenDrain>>) {
    const REMAP: bool = false;
}

impl Pins<I2C1> for (gpio::PB8<Alternate<OpenDrain>>, gpio::PB9<Alternate<OpenDrain>>) {
    const REMAP: bool = true;
}

pub trait Instance: Deref<Target = stm32f1xx_hal::pac::i2c1::RegisterBlock> + Enable + Reset + BusClock {}

impl Instance for I2C1 {}

/// I2C peripheral operating in slave mode on two 7-bit addresses.
///
/// The primary address carries the full command set; the secondary address
/// is the LED emulator identity.
pub struct I2cSlave<I2C, PINS> {
    i2c: I2C,
    pins: PINS,
    addr: u8,
    addr2: u8,
    pclk1: Hertz,
}

impl<PINS> I2cSlave<I2C1, PINS> {
    /// Creates an I2C1 slave on pins PB6 and PB7 or PB8 and PB9 (if remapped).
    pub fn i2c1(i2c: I2C1, pins: PINS, mapr: &mut MAPR, addr: u8, addr2: u8, clocks: Clocks) -> Self
    where
        PINS: Pins<I2C1>,
    {
        mapr.modify_mapr(|_, w| w.i2c1_remap().bit(PINS::REMAP));

        let rcc = unsafe { &(*RCC::ptr()) };
        I2C1::enable(rcc);
        I2C1::reset(rcc);

        let mut slave = Self { i2c, pins, addr, addr2, pclk1: I2C1::clock(&clocks) };
        slave.reset();
        slave
    }
}

impl<I2C, PINS> I2cSlave<I2C, PINS>
where
    I2C: Instance,
{
    /// Initializes the peripheral for dual-address slave operation.
    fn init(&mut self) {
        self.i2c.cr1.write(|w| w.pe().clear_bit());

        let pclk1_mhz = self.pclk1.to_MHz() as u16;
        self.i2c.cr2.write(|w| unsafe { w.freq().bits(pclk1_mhz as u8) });

        self.i2c.oar1.write(|w| w.add().bits((self.addr as u16) << 1));
        self.i2c.oar2.write(|w| w.add2().bits(self.addr2).endual().set_bit());

        self.i2c.cr1.modify(|_, w| w.pe().enabled().ack().ack());
    }

    /// Performs an I2C software reset.
    pub fn reset(&mut self) {
        self.i2c.cr1.write(|w| w.pe().set_bit().swrst().set_bit());
        self.i2c.cr1.reset();
        self.init();
    }

    /// Gets the next event.
    ///
    /// Error flags are cleared here; recovery is the engine's job, so the
    /// event sources stay armed for the next transaction.
    pub fn event(&mut self) -> nb::Result<Event, Infallible> {
        let sr1 = self.i2c.sr1.read();

        if sr1.berr().is_error() {
            self.i2c.sr1.modify(|_, w| w.berr().clear_bit());
            return Ok(Event::BusError);
        }
        if sr1.ovr().bit_is_set() {
            // Overrun means a byte was lost; handled like a bus error.
            self.i2c.sr1.modify(|_, w| w.ovr().clear_bit());
            return Ok(Event::BusError);
        }
        if sr1.arlo().bit_is_set() {
            self.i2c.sr1.modify(|_, w| w.arlo().clear_bit());
            return Ok(Event::ArbitrationLost);
        }
        if sr1.af().is_failure() {
            self.i2c.sr1.modify(|_, w| w.af().no_failure());
            return Ok(Event::AckFailure);
        }

        if sr1.addr().is_match() {
            // Cleared by reading SR1 followed by SR2, which also tells us
            // the matched address and the transfer direction.
            self.i2c.sr1.read();
            let sr2 = self.i2c.sr2.read();
            let identity =
                if sr2.dualf().bit_is_set() { BusIdentity::Emulator } else { BusIdentity::Primary };
            let direction = if sr2.tra().bit_is_set() { Direction::Read } else { Direction::Write };
            return Ok(Event::AddressMatched { identity, direction });
        }

        if sr1.stopf().is_stop() {
            // Cleared by reading SR1 followed by a CR1 write.
            self.i2c.sr1.read();
            self.i2c.cr1.modify(|_, w| w.pe().enabled());
            return Ok(Event::Stop);
        }

        if sr1.rx_ne().is_not_empty() {
            let value = self.i2c.dr.read().dr().bits();
            return Ok(Event::ByteReceived(value));
        }
        if sr1.tx_e().is_empty() {
            return Ok(Event::ByteRequested);
        }
        if sr1.btf().bit_is_set() {
            return Ok(Event::TransferComplete);
        }

        Err(nb::Error::WouldBlock)
    }

    /// Applies the engine's reaction to the bus.
    pub fn apply(&mut self, action: Action) {
        match action {
            Action::None => (),
            Action::Ack => self.i2c.cr1.modify(|_, w| w.ack().ack()),
            Action::Nack => self.i2c.cr1.modify(|_, w| w.ack().nak()),
            Action::Transmit(value) => self.i2c.dr.write(|w| w.dr().bits(value)),
        }
    }

    /// Enables triggering the event interrupt (I2Cx_EV) when the transmit
    /// buffer is empty or the receive buffer is not empty.
    pub fn listen_buffer(&mut self) {
        self.i2c.cr2.modify(|_, w| w.itbufen().enabled());
    }

    /// Enables triggering the event interrupt (I2Cx_EV) when the address is
    /// matched, stop is detected or the byte transfer is finished.
    pub fn listen_event(&mut self) {
        self.i2c.cr2.modify(|_, w| w.itevten().enabled());
    }

    /// Enables triggering the error interrupt (I2Cx_ER) when an error is
    /// detected.
    pub fn listen_error(&mut self) {
        self.i2c.cr2.modify(|_, w| w.iterren().enabled());
    }

    /// Releases the I2C peripheral and associated pins.
    pub fn release(self) -> (I2C, PINS) {
        (self.i2c, self.pins)
    }
}
