//! PS/2 mouse driver.
//!
//! IRQ12 delivers one packet byte at a time; the driver reassembles 3-byte
//! packets (4-byte once the Intellimouse rate dance unlocks the scroll
//! wheel), sign-extends the deltas from byte 0 bits 4/5, drops packets with
//! the overflow bits set, clamps the cursor to the screen, and accumulates
//! wheel movement instead of overwriting it.

use crate::arch::RegisterFrame;
use crate::sync::IrqMutex;

/// Button bit assignments in packet byte 0 (and [`MouseSnapshot::buttons`]).
pub const BUTTON_LEFT: u8 = 0x01;
pub const BUTTON_RIGHT: u8 = 0x02;
pub const BUTTON_MIDDLE: u8 = 0x04;

/// What the compositor sees when it polls the mouse each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseSnapshot {
    pub x: i32,
    pub y: i32,
    pub buttons: u8,
    /// Buttons as of the previous snapshot, for edge detection.
    pub prev_buttons: u8,
    /// Accumulated wheel movement since the previous snapshot.
    pub scroll: i32,
}

impl MouseSnapshot {
    /// Left button went down between the last two snapshots.
    pub fn left_pressed(&self) -> bool {
        self.buttons & BUTTON_LEFT != 0 && self.prev_buttons & BUTTON_LEFT == 0
    }

    /// Left button went up between the last two snapshots.
    pub fn left_released(&self) -> bool {
        self.buttons & BUTTON_LEFT == 0 && self.prev_buttons & BUTTON_LEFT != 0
    }

    /// Left button currently held.
    pub fn left_held(&self) -> bool {
        self.buttons & BUTTON_LEFT != 0
    }
}

/// Packet reassembly and cursor state.
pub struct MouseState {
    packet: [u8; 4],
    packet_len: usize,
    packet_size: usize,
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    buttons: u8,
    prev_buttons: u8,
    scroll_accum: i32,
    discarded: u64,
}

impl MouseState {
    pub const fn new() -> Self {
        Self {
            packet: [0; 4],
            packet_len: 0,
            packet_size: 3,
            x: 0,
            y: 0,
            width: 640,
            height: 480,
            buttons: 0,
            prev_buttons: 0,
            scroll_accum: 0,
            discarded: 0,
        }
    }

    /// Adopt the framebuffer extents and center the cursor.
    pub fn set_bounds(&mut self, width: i32, height: i32) {
        self.width = width.max(1);
        self.height = height.max(1);
        self.x = self.width / 2;
        self.y = self.height / 2;
    }

    /// Switch to 4-byte Intellimouse packets.
    pub fn enable_wheel(&mut self) {
        self.packet_size = 4;
        self.packet_len = 0;
    }

    /// Feed one byte from the controller.
    pub fn process_byte(&mut self, byte: u8) {
        if self.packet_len == 0 && byte & 0x08 == 0 {
            // Byte 0 always has bit 3 set; anything else means we are out
            // of sync with the device. Drop until alignment returns.
            self.discarded += 1;
            return;
        }
        self.packet[self.packet_len] = byte;
        self.packet_len += 1;
        if self.packet_len == self.packet_size {
            self.packet_len = 0;
            self.process_packet();
        }
    }

    fn process_packet(&mut self) {
        let b0 = self.packet[0];

        // Overflow packets carry garbage deltas; position and buttons stay
        // untouched.
        if b0 & 0xC0 != 0 {
            self.discarded += 1;
            return;
        }

        let mut dx = self.packet[1] as i32;
        if b0 & 0x10 != 0 {
            dx -= 256;
        }
        let mut dy = self.packet[2] as i32;
        if b0 & 0x20 != 0 {
            dy -= 256;
        }

        self.buttons = b0 & 0x07;
        self.x = (self.x + dx).clamp(0, self.width - 1);
        // Device Y grows upward, screen Y grows downward.
        self.y = (self.y - dy).clamp(0, self.height - 1);

        if self.packet_size == 4 {
            // Low nibble of byte 3 is a signed wheel delta.
            let z = (self.packet[3] & 0x0F) as i32;
            let z = if z > 7 { z - 16 } else { z };
            self.scroll_accum += z;
        }
    }

    /// Current state; moves `buttons` into `prev_buttons` and drains the
    /// scroll accumulator.
    pub fn take_snapshot(&mut self) -> MouseSnapshot {
        let snapshot = MouseSnapshot {
            x: self.x,
            y: self.y,
            buttons: self.buttons,
            prev_buttons: self.prev_buttons,
            scroll: self.scroll_accum,
        };
        self.prev_buttons = self.buttons;
        self.scroll_accum = 0;
        snapshot
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

impl Default for MouseState {
    fn default() -> Self {
        Self::new()
    }
}

static MOUSE: IrqMutex<MouseState> = IrqMutex::new(MouseState::new());

fn mouse_irq(_frame: &mut RegisterFrame) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        // SAFETY: IRQ12 fired; the aux output buffer holds our byte.
        let byte = unsafe { crate::arch::x86::port::inb(0x60) };
        MOUSE.lock().process_byte(byte);
    }
}

/// Feed a byte outside IRQ context (tests, polled controllers).
pub fn process_byte(byte: u8) {
    MOUSE.lock().process_byte(byte);
}

/// Poll current cursor/button/scroll state.
pub fn snapshot() -> MouseSnapshot {
    MOUSE.lock().take_snapshot()
}

/// Set cursor clamping bounds (called when the framebuffer comes up).
pub fn set_bounds(width: i32, height: i32) {
    MOUSE.lock().set_bounds(width, height);
}

/// Initialize the PS/2 auxiliary device and hook IRQ12.
pub fn init() -> crate::error::KernelResult<()> {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        if hw::init_controller() {
            MOUSE.lock().enable_wheel();
            log::info!("mouse: Intellimouse wheel unlocked (4-byte packets)");
        } else {
            log::info!("mouse: standard 3-byte packets");
        }
    }
    crate::irq::install(12, mouse_irq)?;
    Ok(())
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod hw {
    //! PS/2 controller programming for the auxiliary port.

    use crate::arch::x86::port::{inb, outb};

    const STATUS: u16 = 0x64;
    const DATA: u16 = 0x60;

    fn wait_write() {
        for _ in 0..10_000 {
            // SAFETY: status register read.
            if unsafe { inb(STATUS) } & 0x02 == 0 {
                return;
            }
        }
    }

    fn wait_read() -> bool {
        for _ in 0..10_000 {
            // SAFETY: status register read.
            if unsafe { inb(STATUS) } & 0x01 != 0 {
                return true;
            }
        }
        false
    }

    fn aux_command(cmd: u8) -> Option<u8> {
        wait_write();
        // SAFETY: 0xD4 routes the next data byte to the aux device.
        unsafe { outb(STATUS, 0xD4) };
        wait_write();
        // SAFETY: data port write, protocol per command.
        unsafe { outb(DATA, cmd) };
        if wait_read() {
            // SAFETY: ack byte from the device.
            Some(unsafe { inb(DATA) })
        } else {
            None
        }
    }

    fn set_sample_rate(rate: u8) {
        aux_command(0xF3);
        aux_command(rate);
    }

    /// Bring up the aux port. Returns true if the Intellimouse sequence
    /// unlocked 4-byte packets.
    pub fn init_controller() -> bool {
        wait_write();
        // SAFETY: controller command: enable aux port.
        unsafe { outb(STATUS, 0xA8) };

        // Enable IRQ12 in the controller config byte.
        wait_write();
        // SAFETY: controller command: read config byte.
        unsafe { outb(STATUS, 0x20) };
        if wait_read() {
            // SAFETY: config byte read, then write-back with aux IRQ on.
            unsafe {
                let config = (inb(DATA) | 0x02) & !0x20;
                wait_write();
                outb(STATUS, 0x60);
                wait_write();
                outb(DATA, config);
            }
        }

        aux_command(0xF6); // defaults
        aux_command(0xF4); // enable reporting

        // Magic 200/100/80 sample-rate sequence; a device that answers ID 3
        // afterwards speaks 4-byte packets.
        set_sample_rate(200);
        set_sample_rate(100);
        set_sample_rate(80);
        aux_command(0xF2);
        let id = if wait_read() {
            // SAFETY: device ID byte.
            Some(unsafe { inb(DATA) })
        } else {
            None
        };
        id == Some(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(width: i32, height: i32) -> MouseState {
        let mut m = MouseState::new();
        m.set_bounds(width, height);
        m
    }

    #[test]
    fn motion_packet_moves_cursor() {
        let mut m = fresh(640, 480);
        let (x0, y0) = m.position();
        // byte0: bit3 set, no sign bits; dx=+10, dy=+5 (moves up on screen)
        m.process_byte(0x08);
        m.process_byte(10);
        m.process_byte(5);
        assert_eq!(m.position(), (x0 + 10, y0 - 5));
    }

    #[test]
    fn negative_motion_sign_extends() {
        let mut m = fresh(640, 480);
        let (x0, y0) = m.position();
        // dx sign bit (0x10): dx = 0xF6 - 256 = -10. dy sign bit (0x20):
        // dy = 0xFB - 256 = -5 -> cursor moves down.
        m.process_byte(0x08 | 0x10 | 0x20);
        m.process_byte(0xF6);
        m.process_byte(0xFB);
        assert_eq!(m.position(), (x0 - 10, y0 + 5));
    }

    #[test]
    fn overflow_packet_is_discarded() {
        let mut m = fresh(640, 480);
        m.process_byte(0x08);
        m.process_byte(3);
        m.process_byte(0);
        let before = m.position();
        let buttons_before = m.take_snapshot().buttons;

        m.process_byte(0x08 | 0x40); // X overflow
        m.process_byte(100);
        m.process_byte(100);
        assert_eq!(m.position(), before);
        assert_eq!(m.take_snapshot().buttons, buttons_before);
        assert_eq!(m.discarded(), 1);
    }

    #[test]
    fn cursor_clamps_to_bounds() {
        let mut m = fresh(100, 100);
        for _ in 0..10 {
            m.process_byte(0x08);
            m.process_byte(127);
            m.process_byte(0);
        }
        assert_eq!(m.position().0, 99);
        for _ in 0..10 {
            m.process_byte(0x08 | 0x10);
            m.process_byte(0x80); // -128
            m.process_byte(0);
        }
        assert_eq!(m.position().0, 0);
    }

    #[test]
    fn buttons_edge_detection() {
        let mut m = fresh(640, 480);
        m.process_byte(0x08 | BUTTON_LEFT);
        m.process_byte(0);
        m.process_byte(0);
        let snap = m.take_snapshot();
        assert!(snap.left_pressed());
        assert!(snap.left_held());

        m.process_byte(0x08);
        m.process_byte(0);
        m.process_byte(0);
        let snap = m.take_snapshot();
        assert!(snap.left_released());
        assert!(!snap.left_held());
    }

    #[test]
    fn scroll_accumulates_across_packets() {
        let mut m = fresh(640, 480);
        m.enable_wheel();
        for _ in 0..3 {
            m.process_byte(0x08);
            m.process_byte(0);
            m.process_byte(0);
            m.process_byte(0x01); // wheel +1
        }
        m.process_byte(0x08);
        m.process_byte(0);
        m.process_byte(0);
        m.process_byte(0x0F); // wheel -1
        let snap = m.take_snapshot();
        assert_eq!(snap.scroll, 2);
        // Drained after the snapshot.
        assert_eq!(m.take_snapshot().scroll, 0);
    }

    #[test]
    fn out_of_sync_bytes_are_dropped_until_alignment() {
        let mut m = fresh(640, 480);
        let (x0, y0) = m.position();
        m.process_byte(0x02); // bit 3 clear: not a valid first byte
        m.process_byte(0x08);
        m.process_byte(4);
        m.process_byte(0);
        assert_eq!(m.position(), (x0 + 4, y0));
        assert_eq!(m.discarded(), 1);
    }
}
