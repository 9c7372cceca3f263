//! Memory-mapped I/O devices (C5): console keyboard, console screen, clock.
//!
//! Grounded on `original_source/spym/vm/devices/*.py` for register layout and tick semantics,
//! and on the teacher's own `src/devices.rs` for the `Device` trait shape and (for the clock)
//! the `chrono`-based wall-time tick pattern used by its `Timer`.
//!
//! `original_source/spym/vm/core.py`'s device loop constructs each device as
//! `device(len(self.devices_list), **params)`, i.e. a device's interrupt level is simply its
//! registration order — the same convention `DeviceTable::attach` follows here.

use crate::error::Trap;
use std::collections::VecDeque;
use std::io::{self, Write};

pub const SCREEN_DELAY_TICKS: u32 = 5;

pub trait Device {
    /// The word-aligned addresses this device answers to.
    fn addresses(&self) -> &'static [u32];
    /// Advance internal state by one engine turn; returns `true` if this tick causes an
    /// interrupt condition to latch. The interrupt *level* isn't this device's concern — it's
    /// assigned by `DeviceTable` from registration order, matching the original.
    fn tick(&mut self) -> bool;
    fn read(&mut self, addr: u32) -> u32;
    fn write(&mut self, addr: u32, value: u32);
}

/// Masks the bottom two bits of a device access address, per SPEC_FULL.md §4.5.
pub fn word_align(addr: u32) -> u32 {
    addr & !0x3
}

pub struct Keyboard {
    control: u32,
    data: u32,
    pending: VecDeque<u8>,
}

impl Keyboard {
    pub const CONTROL: u32 = 0xFFFF_0000;
    pub const DATA: u32 = 0xFFFF_0004;

    pub fn new() -> Self {
        Keyboard { control: 0, data: 0, pending: VecDeque::new() }
    }

    /// Feeds a character into the device's input queue; consumed one-per-tick. This replaces
    /// literal non-blocking stdin polling so that device behavior is reproducible under test
    /// (SPEC_FULL.md §8.1) — an external front-end is expected to pump real stdin into this
    /// queue itself.
    pub fn feed(&mut self, byte: u8) {
        self.pending.push_back(byte);
    }
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Keyboard {
    fn addresses(&self) -> &'static [u32] {
        &[Self::CONTROL, Self::DATA]
    }

    fn tick(&mut self) -> bool {
        if self.control & 0x1 != 0 {
            return false; // ready bit already set; wait for it to be read
        }
        if let Some(byte) = self.pending.pop_front() {
            self.data = byte as u32;
            self.control |= 0x1;
            if self.control & 0x2 != 0 {
                return true;
            }
        }
        false
    }

    fn read(&mut self, addr: u32) -> u32 {
        match word_align(addr) {
            Self::CONTROL => self.control,
            Self::DATA => {
                let value = self.data;
                self.control &= !0x1;
                value
            }
            _ => 0,
        }
    }

    fn write(&mut self, addr: u32, value: u32) {
        if word_align(addr) == Self::CONTROL {
            self.control = value;
        }
    }
}

pub struct Screen {
    control: u32,
    data: u32,
    delay: Option<u32>,
    latched: u8,
}

impl Screen {
    pub const CONTROL: u32 = 0xFFFF_0008;
    pub const DATA: u32 = 0xFFFF_000C;

    pub fn new() -> Self {
        Screen { control: 0x1, data: 0, delay: None, latched: 0 }
    }
}

impl Default for Screen {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Screen {
    fn addresses(&self) -> &'static [u32] {
        &[Self::CONTROL, Self::DATA]
    }

    fn tick(&mut self) -> bool {
        if let Some(remaining) = self.delay {
            if remaining == 0 {
                print!("{}", self.latched as char);
                let _ = io::stdout().flush();
                self.control |= 0x1;
                self.delay = None;
                if self.control & 0x2 != 0 {
                    return true;
                }
            } else {
                self.delay = Some(remaining - 1);
            }
        }
        false
    }

    fn read(&mut self, addr: u32) -> u32 {
        match word_align(addr) {
            Self::CONTROL => self.control,
            _ => 0,
        }
    }

    fn write(&mut self, addr: u32, value: u32) {
        match word_align(addr) {
            Self::CONTROL => self.control = value,
            Self::DATA => {
                if self.control & 0x1 != 0 {
                    self.data = value & 0xFF;
                    self.latched = self.data as u8;
                    self.control &= !0x1;
                    self.delay = Some(SCREEN_DELAY_TICKS);
                }
                // writing while ready=0 is a no-op, per SPEC_FULL.md §8 invariant 12.
            }
            _ => {}
        }
    }
}

pub struct Clock {
    control: u32,
    period: u32,
    counter: u32,
}

impl Clock {
    pub const CONTROL: u32 = 0xFFFF_0010;

    pub fn new(period_ticks: u32) -> Self {
        Clock { control: 0, period: period_ticks.max(1), counter: period_ticks.max(1) }
    }
}

impl Device for Clock {
    fn addresses(&self) -> &'static [u32] {
        &[Self::CONTROL]
    }

    fn tick(&mut self) -> bool {
        if self.counter == 0 {
            self.counter = self.period;
        }
        self.counter -= 1;
        if self.counter == 0 {
            self.control |= 0x2;
            if self.control & 0x1 != 0 {
                return true;
            }
        }
        false
    }

    fn read(&mut self, addr: u32) -> u32 {
        match word_align(addr) {
            Self::CONTROL => self.control,
            _ => 0,
        }
    }

    fn write(&mut self, addr: u32, value: u32) {
        if word_align(addr) == Self::CONTROL {
            self.control = value;
        }
    }
}

pub struct DeviceTable {
    devices: Vec<Box<dyn Device>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        DeviceTable { devices: Vec::new() }
    }

    pub fn attach(&mut self, device: Box<dyn Device>) {
        self.devices.push(device);
    }

    pub fn mapped(&self, addr: u32) -> bool {
        let addr = word_align(addr);
        self.devices.iter().any(|d| d.addresses().contains(&addr))
    }

    pub fn read(&mut self, addr: u32) -> u32 {
        let masked = word_align(addr);
        for device in &mut self.devices {
            if device.addresses().contains(&masked) {
                return device.read(addr);
            }
        }
        0
    }

    pub fn write(&mut self, addr: u32, value: u32) {
        let masked = word_align(addr);
        for device in &mut self.devices {
            if device.addresses().contains(&masked) {
                device.write(addr, value);
                return;
            }
        }
    }

    /// Ticks every device (every device gets its turn regardless of an earlier one firing, unlike
    /// the original's loop which stops at the first raised exception), returning the lowest-level
    /// interrupt raised this turn, if any — level assigned by registration order, per
    /// `original_source/spym/vm/core.py`'s `device(len(self.devices_list), ...)` convention.
    pub fn tick(&mut self) -> Option<Trap> {
        let mut raised = None;
        for (level, device) in self.devices.iter_mut().enumerate() {
            if device.tick() && raised.is_none() {
                raised = Some(Trap::Interrupt(level as u32));
            }
        }
        raised
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_write_while_not_ready_is_noop() {
        let mut screen = Screen::new();
        screen.control = 0; // clear ready
        screen.write(Screen::DATA, b'x' as u32);
        assert!(screen.delay.is_none());
    }

    #[test]
    fn screen_print_sets_ready_after_delay() {
        let mut screen = Screen::new();
        screen.write(Screen::DATA, b'A' as u32);
        assert_eq!(screen.control & 0x1, 0);
        for _ in 0..SCREEN_DELAY_TICKS {
            screen.tick();
        }
        assert_eq!(screen.control & 0x1, 1);
    }

    #[test]
    fn keyboard_feed_sets_ready_then_read_clears_it() {
        let mut kb = Keyboard::new();
        kb.feed(b'q');
        kb.tick();
        assert_eq!(kb.control & 0x1, 1);
        let value = kb.read(Keyboard::DATA);
        assert_eq!(value, b'q' as u32);
        assert_eq!(kb.control & 0x1, 0);
    }

    #[test]
    fn device_table_tags_the_interrupt_with_the_raising_devices_registration_order() {
        let mut clock = Clock::new(1);
        clock.write(Clock::CONTROL, 0x1); // enable clock interrupts
        let mut table = DeviceTable::new();
        table.attach(Box::new(Keyboard::new())); // level 0, never raises here
        table.attach(Box::new(clock)); // level 1
        assert_eq!(table.tick(), Some(Trap::Interrupt(1)));
    }
}
