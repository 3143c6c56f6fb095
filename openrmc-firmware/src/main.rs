//! OpenRMC Firmware.
//!
//! Supervisory MCU firmware for the router board: exposes the command
//! protocol on the I2C bus to the main CPU and manages power rails, reset
//! lines, front LEDs, the button, the watchdog and the non-volatile store.

#![no_std]
#![no_main]

mod board;
mod i2c_slave;
mod leds;
mod nvstore;
mod power;
mod watchman;

use defmt_rtt as _;
use panic_probe as _;

use cortex_m::peripheral::{NVIC, SCB};
use defmt::unwrap;
use embedded_hal::blocking::spi::Write as _;
use openrmc_proto::{
    board::{ButtonMode, McuType, NvKey, BOOTLOADER_REQ, VERSION_LEN},
    status::{Config, FeaturesWord, LedStateExt},
    Engine,
};
use stm32f1::stm32f103::Interrupt;
use stm32f1xx_hal::{
    gpio::{Alternate, ErasedPin, Input, OpenDrain, Output, Pin},
    pac::{I2C1, SPI1},
    prelude::*,
    spi::{NoMiso, Spi, Spi1NoRemap, MODE_0},
    watchdog::IndependentWatchdog,
};
use systick_monotonic::*;

use crate::{
    board::{RmcBoard, Senses},
    i2c_slave::I2cSlave,
    leds::Leds,
    nvstore::NvStore,
    power::{AuxEvent, PowerControl, Rail},
    watchman::Watchman,
};

/// Primary 7-bit slave address (0x55/0x54 on the wire).
const I2C_ADDR: u8 = 0x2a;

/// LED emulator 7-bit slave address (0x57/0x56 on the wire).
const I2C_ADDR_EMULATOR: u8 = 0x2b;

/// Firmware version, zero padded to the protocol's fixed blob length.
pub static VERSION: [u8; VERSION_LEN] = padded_version();

const fn padded_version() -> [u8; VERSION_LEN] {
    let src = env!("CARGO_PKG_VERSION").as_bytes();
    let mut out = [0; VERSION_LEN];
    let mut i = 0;
    while i < src.len() && i < VERSION_LEN {
        out[i] = src[i];
        i += 1;
    }
    out
}

/// Instant in time.
pub type Instant = systick_monotonic::fugit::Instant<u64, 1, 100>;

/// Time duration.
pub type Duration = systick_monotonic::fugit::Duration<u64, 1, 100>;

/// I2C slave on its fixed pins.
type Slave = I2cSlave<I2C1, (Pin<'B', 6, Alternate<OpenDrain>>, Pin<'B', 7, Alternate<OpenDrain>>)>;

/// SPI bus shifting LED frames out to the driver chain.
type LedSpi = Spi<SPI1, Spi1NoRemap, (Pin<'A', 5, Alternate>, NoMiso, Pin<'A', 7, Alternate>), u8>;

/// Live activity senses feeding the LEDs in default mode.
pub struct ActivityPins {
    pub wan: ErasedPin<Input>,
    pub lan: ErasedPin<Input>,
    pub pci: ErasedPin<Input>,
}

impl ActivityPins {
    /// Maps the senses onto the LED positions. The LAN switch and PCIe
    /// senses each drive a group of LEDs; the power LED is always on.
    fn mask(&self) -> u16 {
        let mut mask = 1 << 11;
        if self.wan.is_high() {
            mask |= 1 << 10;
        }
        if self.lan.is_high() {
            mask |= 0xff << 2;
        }
        if self.pci.is_high() {
            mask |= 0b11;
        }
        mask
    }
}

#[rtic::app(device = stm32f1::stm32f103, peripherals = true, dispatchers = [SPI2, USART1, USART2])]
mod app {
    use super::*;

    /// System timer.
    #[monotonic(binds = SysTick, default = true)]
    type MyMono = Systick<100>;

    /// Shared resources.
    #[shared]
    struct Shared {
        /// Protocol engine owning the board state.
        engine: Engine<RmcBoard>,
    }

    /// Exclusive resources.
    #[local]
    struct Local {
        /// I2C slave.
        i2c_slave: Slave,
        /// LED driver chain bus.
        led_spi: LedSpi,
        led_latch: ErasedPin<Output>,
        /// Front button, active low.
        button: ErasedPin<Input>,
        activity: ActivityPins,
    }

    /// Initialization (entry point).
    #[init]
    fn init(cx: init::Context) -> (Shared, Local, init::Monotonics) {
        defmt::info!("OpenRMC version {:a}", env!("CARGO_PKG_VERSION").as_bytes());

        let dp = cx.device;

        // Create HAL objects.
        let rcc = dp.RCC.constrain();
        let mut flash = dp.FLASH.constrain();
        let mut afio = dp.AFIO.constrain();
        let clocks = rcc.cfgr.freeze(&mut flash.acr);
        let mono = Systick::new(cx.core.SYST, clocks.sysclk().to_Hz());
        let mut gpioa = dp.GPIOA.split();
        let mut gpiob = dp.GPIOB.split();
        let mut gpioc = dp.GPIOC.split();
        let (pa15, pb3, pb4) = afio.mapr.disable_jtag(gpioa.pa15, gpiob.pb3, gpiob.pb4);

        // Open the non-volatile store and fetch the persisted state.
        let mut nv = match NvStore::new(flash) {
            Ok(nv) => nv,
            Err(_) => defmt::panic!("non-volatile store unusable"),
        };
        let reset_flag = nv.read(NvKey::Reset).unwrap_or(0);
        if reset_flag != 0 {
            let _ = nv.write(NvKey::Reset, 0);
        }
        // Nonzero when the previous reset was requested by the master.
        let reset_type = u8::from(reset_flag == BOOTLOADER_REQ);
        let watchdog_status = nv.read(NvKey::WatchdogStatus).unwrap_or(1) as u8;
        defmt::info!("reset type:      {}", reset_type);
        defmt::info!("watchdog status: {}", watchdog_status);

        // Power rails in their required startup order.
        let rails = [
            Rail {
                name: "5V",
                enable: gpiob.pb0.into_push_pull_output(&mut gpiob.crl).erase(),
                good: gpioa.pa0.into_floating_input(&mut gpioa.crl).erase(),
            },
            Rail {
                name: "3V3",
                enable: gpiob.pb1.into_push_pull_output(&mut gpiob.crl).erase(),
                good: gpioa.pa1.into_floating_input(&mut gpioa.crl).erase(),
            },
            Rail {
                name: "1V8",
                enable: gpiob.pb2.into_push_pull_output(&mut gpiob.crl).erase(),
                good: gpioa.pa2.into_floating_input(&mut gpioa.crl).erase(),
            },
            Rail {
                name: "1V5",
                enable: gpiob.pb5.into_push_pull_output(&mut gpiob.crl).erase(),
                good: gpioa.pa3.into_floating_input(&mut gpioa.crl).erase(),
            },
            Rail {
                name: "1V35",
                enable: gpiob.pb8.into_push_pull_output(&mut gpiob.crh).erase(),
                good: gpioa.pa6.into_floating_input(&mut gpioa.crl).erase(),
            },
            Rail {
                name: "VTT",
                enable: gpiob.pb9.into_push_pull_output(&mut gpiob.crh).erase(),
                good: gpioa.pa8.into_floating_input(&mut gpioa.crh).erase(),
            },
            Rail {
                name: "1V2",
                enable: gpiob.pb10.into_push_pull_output(&mut gpiob.crh).erase(),
                good: gpioa.pa9.into_floating_input(&mut gpioa.crh).erase(),
            },
        ];
        let aux = Rail {
            name: "4V5",
            enable: gpiob.pb11.into_push_pull_output(&mut gpiob.crh).erase(),
            good: gpioa.pa10.into_floating_input(&mut gpioa.crh).erase(),
        };
        let usb_pwron = [
            gpiob.pb12.into_push_pull_output_with_state(&mut gpiob.crh, stm32f1xx_hal::gpio::PinState::High).erase(),
            gpiob.pb13.into_push_pull_output_with_state(&mut gpiob.crh, stm32f1xx_hal::gpio::PinState::High).erase(),
        ];
        let cfg_ctrl = gpioa.pa11.into_push_pull_output(&mut gpioa.crh).erase();
        let manres =
            gpioa.pa12.into_open_drain_output_with_state(&mut gpioa.crh, stm32f1xx_hal::gpio::PinState::High).erase();

        let mut power = PowerControl::new(rails, aux, usb_pwron, cfg_ctrl, manres);
        power.start_sequence(monotonics::now());

        // Hardware senses.
        let senses = Senses {
            card_det: gpioc.pc13.into_floating_input(&mut gpioc.crh).erase(),
            msata_ind: gpioc.pc14.into_floating_input(&mut gpioc.crh).erase(),
            usb_ovc: [
                gpiob.pb14.into_floating_input(&mut gpiob.crh).erase(),
                gpiob.pb15.into_floating_input(&mut gpiob.crh).erase(),
            ],
            sfp_ndet: gpioc.pc12.into_floating_input(&mut gpioc.crh).erase(),
        };

        // Peripheral control lines.
        let ext = [
            gpioc.pc0.into_push_pull_output(&mut gpioc.crl).erase(),
            gpioc.pc1.into_push_pull_output(&mut gpioc.crl).erase(),
            gpioc.pc2.into_push_pull_output(&mut gpioc.crl).erase(),
            gpioc.pc3.into_push_pull_output(&mut gpioc.crl).erase(),
            gpioc.pc4.into_push_pull_output(&mut gpioc.crl).erase(),
            gpioc.pc5.into_push_pull_output(&mut gpioc.crl).erase(),
            gpioc.pc6.into_push_pull_output(&mut gpioc.crl).erase(),
            gpioc.pc7.into_push_pull_output(&mut gpioc.crl).erase(),
            gpioc.pc8.into_push_pull_output(&mut gpioc.crh).erase(),
        ];
        let sfp_disable = gpioc.pc9.into_push_pull_output(&mut gpioc.crh).erase();
        let voltage_sel = Some([
            gpioc.pc10.into_push_pull_output(&mut gpioc.crh).erase(),
            gpioc.pc11.into_push_pull_output(&mut gpioc.crh).erase(),
        ]);

        // Start the watchdog and its manager.
        let dog = IndependentWatchdog::new(dp.IWDG);
        let watchman = Watchman::new(dog, 120u64.secs(), watchdog_status & 1);
        unwrap!(watchdog_petter::spawn());

        // Protocol engine around the board.
        let cfg = Config {
            mcu_type: McuType::Stm32,
            features: FeaturesWord::new(true, true, false, LedStateExt::V32),
            user_regulator_supported: voltage_sel.is_some(),
            reset_type,
        };
        let board =
            RmcBoard::new(power, Leds::new(), nv, watchman, senses, ext, sfp_disable, voltage_sel, watchdog_status);
        let engine = Engine::new(board, &cfg);

        // LED driver chain.
        let sck = gpioa.pa5.into_alternate_push_pull(&mut gpioa.crl);
        let mosi = gpioa.pa7.into_alternate_push_pull(&mut gpioa.crl);
        let led_spi = Spi::spi1(dp.SPI1, (sck, NoMiso, mosi), &mut afio.mapr, MODE_0, 2.MHz(), clocks);
        let led_latch = gpioa.pa4.into_push_pull_output(&mut gpioa.crl).erase();

        // Activity senses and button.
        let activity = ActivityPins {
            wan: pa15.into_floating_input(&mut gpioa.crh).erase(),
            lan: pb3.into_floating_input(&mut gpiob.crl).erase(),
            pci: pb4.into_floating_input(&mut gpiob.crl).erase(),
        };
        let button = gpioc.pc15.into_floating_input(&mut gpioc.crh).erase();

        // Enable the I2C slave on both addresses.
        let scl = gpiob.pb6.into_alternate_open_drain(&mut gpiob.crl);
        let sda = gpiob.pb7.into_alternate_open_drain(&mut gpiob.crl);
        let mut i2c_slave =
            I2cSlave::i2c1(dp.I2C1, (scl, sda), &mut afio.mapr, I2C_ADDR, I2C_ADDR_EMULATOR, clocks);
        i2c_slave.listen_buffer();
        i2c_slave.listen_error();
        i2c_slave.listen_event();
        unsafe { NVIC::unmask(Interrupt::I2C1_ER) };
        unsafe { NVIC::unmask(Interrupt::I2C1_EV) };

        unwrap!(power_sequencer::spawn());
        unwrap!(led_refresh::spawn());
        unwrap!(button_poll::spawn());

        defmt::debug!("init done");
        (
            Shared { engine },
            Local { i2c_slave, led_spi, led_latch, button, activity },
            init::Monotonics(mono),
        )
    }

    /// Idle task: sleeps and performs latched reset requests.
    #[idle(shared = [engine])]
    fn idle(mut cx: idle::Context) -> ! {
        loop {
            let reset = cx.shared.engine.lock(|engine| {
                let power = &mut engine.board_mut().power;
                // The bootloader request flag is already persisted; entry
                // happens through a plain system reset.
                power.take_bootloader() || power.take_hard_reset()
            });
            if reset {
                defmt::info!("resetting system");
                SCB::sys_reset();
            }
            rtic::export::wfi();
        }
    }

    /// Pets the independent hardware watchdog.
    #[task(shared = [engine], priority = 1)]
    fn watchdog_petter(mut cx: watchdog_petter::Context) {
        cx.shared.engine.lock(|engine| engine.board_mut().watchman.pet_hardware_watchdog());
        unwrap!(watchdog_petter::spawn_after(Watchman::pet_interval()));
    }

    /// Polls the power rail sequencer and the reset line hold time.
    #[task(shared = [engine], priority = 1)]
    fn power_sequencer(mut cx: power_sequencer::Context) {
        cx.shared.engine.lock(|engine| {
            let now = monotonics::now();
            engine.board_mut().power.poll_sequence(now);
            engine.board_mut().power.poll_reset(now);
            match engine.board_mut().power.poll_aux(now) {
                Some(AuxEvent::Ready) => engine.status_mut().set_aux_rail(true),
                Some(AuxEvent::TimedOut) => engine.status_mut().set_aux_rail(false),
                None => (),
            }
        });
        unwrap!(power_sequencer::spawn_after(10u64.millis()));
    }

    /// Refreshes the LED frame: activity senses, pattern playback, output.
    #[task(shared = [engine], local = [led_spi, led_latch, activity], priority = 1)]
    fn led_refresh(mut cx: led_refresh::Context) {
        let led_refresh::LocalResources { led_spi, led_latch, activity } = cx.local;

        let frame = cx.shared.engine.lock(|engine| {
            let leds = &mut engine.board_mut().leds;
            leds.set_activity(activity.mask());
            leds.tick();
            leds.frame()
        });

        let mut data = [0; 36];
        for (n, rgb) in frame.iter().enumerate() {
            data[3 * n] = rgb.r;
            data[3 * n + 1] = rgb.g;
            data[3 * n + 2] = rgb.b;
        }
        if led_spi.write(&data).is_err() {
            defmt::warn!("LED frame write failed");
        }
        led_latch.set_high();
        led_latch.set_low();

        unwrap!(led_refresh::spawn_after(20u64.millis()));
    }

    /// Debounces the front button and feeds presses to the status model.
    #[task(shared = [engine], local = [button, stable: u8 = 0, pressed: bool = false], priority = 1)]
    fn button_poll(mut cx: button_poll::Context) {
        *cx.local.stable = (*cx.local.stable << 1) | u8::from(cx.local.button.is_low());
        let debounced = match *cx.local.stable {
            0xff => true,
            0x00 => false,
            _ => *cx.local.pressed,
        };

        if debounced && !*cx.local.pressed {
            cx.shared.engine.lock(|engine| {
                if engine.status().button_mode() == ButtonMode::User {
                    engine.status_mut().register_button_press();
                } else {
                    engine.board_mut().leds.step_brightness();
                }
            });
        }
        *cx.local.pressed = debounced;

        unwrap!(button_poll::spawn_after(10u64.millis()));
    }

    /// I2C error interrupt handler.
    #[task(binds = I2C1_ER, priority = 2)]
    fn i2c1_er(_cx: i2c1_er::Context) {
        NVIC::pend(Interrupt::I2C1_EV);
    }

    /// I2C event interrupt handler: pumps bus events through the engine.
    #[task(binds = I2C1_EV, local = [i2c_slave], shared = [engine], priority = 2)]
    fn i2c1_ev(mut cx: i2c1_ev::Context) {
        loop {
            match cx.local.i2c_slave.event() {
                Ok(event) => {
                    let action = cx.shared.engine.lock(|engine| engine.handle_event(event));
                    cx.local.i2c_slave.apply(action);
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(err)) => match err {},
            }
        }
    }
}
