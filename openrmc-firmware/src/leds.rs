//! RGB LED state and frame computation.
//!
//! Holds the logical state of the 12 front LEDs: per-LED mode, user on/off
//! state, colour, colour correction flag and pattern playback, plus the
//! global brightness. The refresh task feeds in the live activity senses,
//! advances pattern playback and shifts the computed frame out to the LED
//! driver chain.

use openrmc_proto::board::{LedMode, LedPattern, LedTarget, Rgb, LED_COUNT};

/// Maximum global brightness in percent.
pub const BRIGHTNESS_MAX: u8 = 100;

/// White-balance scaling applied when colour correction is enabled.
const CORRECTION: Rgb = Rgb { r: 0xff, g: 0xbe, b: 0xa0 };

/// Running pattern playback of one LED.
#[derive(Clone, Copy)]
struct Playback {
    params: LedPattern,
    step: u16,
    ticks: u32,
    repeats_left: u16,
}

impl Playback {
    fn new(params: LedPattern) -> Self {
        Self { params, step: params.pos, ticks: 0, repeats_left: params.repeat }
    }

    /// Advances playback by one refresh tick. Returns false when finished.
    fn tick(&mut self) -> bool {
        self.ticks += 1;
        if self.ticks < self.params.pos_t.max(1) {
            return true;
        }
        self.ticks = 0;
        self.step += 1;
        if self.step >= self.params.len.max(1) {
            self.step = 0;
            // Repeat count zero plays forever.
            if self.params.repeat != 0 {
                self.repeats_left = self.repeats_left.saturating_sub(1);
                if self.repeats_left == 0 {
                    return false;
                }
            }
        }
        true
    }

    /// LED on/off output at the current playback step.
    fn output(&self) -> bool {
        self.params.pattern & (1 << (self.step % 8)) != 0
    }
}

#[derive(Clone, Copy)]
struct Led {
    mode: LedMode,
    state: bool,
    colour: Rgb,
    correction: bool,
    playback: Option<Playback>,
}

impl Led {
    const fn new() -> Self {
        Self {
            mode: LedMode::Default,
            state: false,
            colour: Rgb { r: 0xff, g: 0xff, b: 0xff },
            correction: false,
            playback: None,
        }
    }
}

/// Logical state of the LED chain.
pub struct Leds {
    leds: [Led; LED_COUNT as usize],
    brightness: u8,
    /// Live activity senses, one bit per LED, driven in default mode.
    activity: u16,
}

impl Leds {
    pub fn new() -> Self {
        Self { leds: [Led::new(); LED_COUNT as usize], brightness: BRIGHTNESS_MAX, activity: 0 }
    }

    fn for_target(&mut self, target: LedTarget, mut f: impl FnMut(&mut Led)) {
        match target {
            LedTarget::Single(n) => f(&mut self.leds[n as usize]),
            LedTarget::All => self.leds.iter_mut().for_each(f),
        }
    }

    pub fn set_mode(&mut self, target: LedTarget, mode: LedMode) {
        self.for_target(target, |led| led.mode = mode);
    }

    pub fn set_state(&mut self, target: LedTarget, on: bool) {
        self.for_target(target, |led| led.state = on);
    }

    pub fn set_colour(&mut self, target: LedTarget, colour: Rgb) {
        self.for_target(target, |led| led.colour = colour);
    }

    pub fn set_correction(&mut self, target: LedTarget, enable: bool) {
        self.for_target(target, |led| led.correction = enable);
    }

    pub fn set_pattern(&mut self, target: LedTarget, pattern: LedPattern) {
        self.for_target(target, |led| led.playback = Some(Playback::new(pattern)));
    }

    pub fn set_brightness(&mut self, value: u8) {
        self.brightness = value.min(BRIGHTNESS_MAX);
    }

    pub fn brightness(&self) -> u8 {
        self.brightness
    }

    /// Steps the global brightness, wrapping around. Used by the front
    /// button in default mode.
    pub fn step_brightness(&mut self) {
        self.brightness =
            if self.brightness >= BRIGHTNESS_MAX { 0 } else { (self.brightness + 20).min(BRIGHTNESS_MAX) };
    }

    /// Updates the live activity senses.
    pub fn set_activity(&mut self, activity: u16) {
        self.activity = activity;
    }

    /// Advances pattern playback by one refresh tick.
    pub fn tick(&mut self) {
        for led in &mut self.leds {
            if let Some(playback) = &mut led.playback {
                if !playback.tick() {
                    led.playback = None;
                }
            }
        }
    }

    fn is_on(&self, n: usize) -> bool {
        let led = &self.leds[n];
        match led.mode {
            LedMode::Default => self.activity & (1 << n) != 0,
            LedMode::User => match &led.playback {
                Some(playback) => playback.output(),
                None => led.state,
            },
        }
    }

    /// Current on/off states packed one bit per LED, for the extended
    /// status word.
    pub fn packed_states(&self) -> u32 {
        let mut states = 0;
        for n in 0..LED_COUNT as usize {
            if self.is_on(n) {
                states |= 1 << n;
            }
        }
        states
    }

    /// Computes the output frame with brightness and correction applied.
    pub fn frame(&self) -> [Rgb; LED_COUNT as usize] {
        let mut frame = [Rgb { r: 0, g: 0, b: 0 }; LED_COUNT as usize];
        for (n, out) in frame.iter_mut().enumerate() {
            if self.is_on(n) {
                let led = &self.leds[n];
                *out = scale(led.colour, self.brightness, led.correction);
            }
        }
        frame
    }
}

fn scale(colour: Rgb, brightness: u8, correction: bool) -> Rgb {
    let apply = |c: u8, corr: u8| {
        let mut v = u16::from(c) * u16::from(brightness) / u16::from(BRIGHTNESS_MAX);
        if correction {
            v = v * u16::from(corr) / 0xff;
        }
        v as u8
    };
    Rgb {
        r: apply(colour.r, CORRECTION.r),
        g: apply(colour.g, CORRECTION.g),
        b: apply(colour.b, CORRECTION.b),
    }
}
