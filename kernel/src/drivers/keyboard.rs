//! PS/2 keyboard driver.
//!
//! IRQ1 reads raw scancodes from port 0x60; decoding goes through the
//! `pc_keyboard` state machine (ScancodeSet1, US 104-key layout), which owns
//! the modifier/caps-lock tracking and the 0xE0 extended-prefix handling.
//! Decoded [`KeyEvent`]s land in a fixed ring that overwrites its oldest
//! entry on overflow — input latency beats input completeness here.

use pc_keyboard::{layouts, DecodedKey, HandleControl, KeyCode, KeyState, Keyboard, ScancodeSet1};

use crate::arch::RegisterFrame;
use crate::sync::{IrqMutex, OnceLock};

/// Decoded keyboard event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    /// Raw set-1 scancode that completed this event.
    pub scancode: u8,
    /// Printable translation, if the key has one under current modifiers.
    pub character: Option<char>,
    /// Special (non-printing) key, for line-editor cursor motion.
    pub special: Option<SpecialKey>,
    /// True for make, false for break.
    pub pressed: bool,
    /// Uptime stamp.
    pub timestamp_ms: u64,
}

/// Non-printing keys the line editor and window manager care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKey {
    ArrowLeft,
    ArrowRight,
    ArrowUp,
    ArrowDown,
    Home,
    End,
    Delete,
    Escape,
}

const RING_CAPACITY: usize = 128;

/// Drop-oldest event ring. Single producer (IRQ1), single consumer (the
/// focused reader), both serialized by the IrqMutex around the driver.
struct EventRing {
    events: [KeyEvent; RING_CAPACITY],
    head: usize,
    len: usize,
}

impl EventRing {
    const fn new() -> Self {
        const EMPTY: KeyEvent = KeyEvent {
            scancode: 0,
            character: None,
            special: None,
            pressed: false,
            timestamp_ms: 0,
        };
        Self {
            events: [EMPTY; RING_CAPACITY],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, event: KeyEvent) {
        let slot = (self.head + self.len) % RING_CAPACITY;
        self.events[slot] = event;
        if self.len == RING_CAPACITY {
            // Full: the slot we just wrote replaced the oldest entry.
            self.head = (self.head + 1) % RING_CAPACITY;
        } else {
            self.len += 1;
        }
    }

    fn pop(&mut self) -> Option<KeyEvent> {
        if self.len == 0 {
            return None;
        }
        let event = self.events[self.head];
        self.head = (self.head + 1) % RING_CAPACITY;
        self.len -= 1;
        Some(event)
    }
}

struct KeyboardDriver {
    decoder: Keyboard<layouts::Us104Key, ScancodeSet1>,
    ring: EventRing,
}

static DRIVER: IrqMutex<Option<KeyboardDriver>> = IrqMutex::new(None);

/// Called while a blocking read waits; the desktop registers its
/// recomposite-and-poll step here.
static IDLE_HOOK: OnceLock<fn()> = OnceLock::new();

/// Initialize decoding state and hook IRQ1.
pub fn init() -> crate::error::KernelResult<()> {
    *DRIVER.lock() = Some(KeyboardDriver {
        decoder: Keyboard::new(
            ScancodeSet1::new(),
            layouts::Us104Key,
            HandleControl::MapLettersToUnicode,
        ),
        ring: EventRing::new(),
    });
    crate::irq::install(1, keyboard_irq)?;
    Ok(())
}

/// Register the GUI-refresh hook used by [`getchar`].
pub fn set_idle_hook(hook: fn()) {
    let _ = IDLE_HOOK.set(hook);
}

fn keyboard_irq(_frame: &mut RegisterFrame) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        // SAFETY: IRQ1 fired, so the output buffer has a byte for us.
        let scancode = unsafe { crate::arch::x86::port::inb(0x60) };
        process_scancode(scancode);
    }
}

fn special_for(code: KeyCode) -> Option<SpecialKey> {
    match code {
        KeyCode::ArrowLeft => Some(SpecialKey::ArrowLeft),
        KeyCode::ArrowRight => Some(SpecialKey::ArrowRight),
        KeyCode::ArrowUp => Some(SpecialKey::ArrowUp),
        KeyCode::ArrowDown => Some(SpecialKey::ArrowDown),
        KeyCode::Home => Some(SpecialKey::Home),
        KeyCode::End => Some(SpecialKey::End),
        KeyCode::Delete => Some(SpecialKey::Delete),
        KeyCode::Escape => Some(SpecialKey::Escape),
        _ => None,
    }
}

/// Feed one raw scancode through the decoder. IRQ path on hardware; tests
/// call it directly.
pub fn process_scancode(scancode: u8) {
    let mut guard = DRIVER.lock();
    let driver = match guard.as_mut() {
        Some(d) => d,
        None => return,
    };

    let key_event = match driver.decoder.add_byte(scancode) {
        Ok(Some(ev)) => ev,
        // Mid-sequence (0xE0 prefix) or a protocol error; nothing to emit.
        _ => return,
    };

    let pressed = key_event.state == KeyState::Down;
    let special = special_for(key_event.code);
    let character = match driver.decoder.process_keyevent(key_event) {
        Some(DecodedKey::Unicode(ch)) => Some(ch),
        _ => None,
    };

    driver.ring.push(KeyEvent {
        scancode,
        character,
        special,
        pressed,
        timestamp_ms: crate::timer::uptime_ms(),
    });
}

/// Non-blocking read of the next event.
pub fn read_event() -> Option<KeyEvent> {
    DRIVER.lock().as_mut().and_then(|d| d.ring.pop())
}

/// Blocking read of the next printable character. Yields between polls and
/// lets the desktop refresh, so a foreground read never starves the GUI.
pub fn getchar() -> char {
    loop {
        if let Some(event) = read_event() {
            if event.pressed {
                if let Some(ch) = event.character {
                    return ch;
                }
            }
        }
        if let Some(&hook) = IDLE_HOOK.get() {
            hook();
        }
        crate::sched::check_reschedule();
        crate::arch::halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;

    // The driver state is a true global; run these tests one at a time.
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn reset() {
        *DRIVER.lock() = Some(KeyboardDriver {
            decoder: Keyboard::new(
                ScancodeSet1::new(),
                layouts::Us104Key,
                HandleControl::MapLettersToUnicode,
            ),
            ring: EventRing::new(),
        });
    }

    fn drain() {
        while read_event().is_some() {}
    }

    #[test]
    fn plain_key_decodes_to_ascii() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        drain();
        process_scancode(0x1E); // 'a' make
        let ev = read_event().expect("event");
        assert!(ev.pressed);
        assert_eq!(ev.character, Some('a'));
        process_scancode(0x9E); // 'a' break
        let up = read_event().expect("event");
        assert!(!up.pressed);
    }

    #[test]
    fn shift_changes_translation() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        drain();
        process_scancode(0x2A); // LShift make
        let _ = read_event();
        process_scancode(0x1E); // 'a'
        let ev = read_event().expect("event");
        assert_eq!(ev.character, Some('A'));
        process_scancode(0xAA); // LShift break
    }

    #[test]
    fn extended_prefix_yields_special_key() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        drain();
        process_scancode(0xE0);
        assert!(read_event().is_none()); // prefix alone emits nothing
        process_scancode(0x4B); // extended left arrow
        let ev = read_event().expect("event");
        assert_eq!(ev.special, Some(SpecialKey::ArrowLeft));
        assert!(ev.pressed);
    }

    #[test]
    fn ring_overflow_drops_oldest() {
        let mut ring = EventRing::new();
        for i in 0..(RING_CAPACITY + 5) {
            ring.push(KeyEvent {
                scancode: i as u8,
                character: None,
                special: None,
                pressed: true,
                timestamp_ms: 0,
            });
        }
        // The first five scancodes were overwritten.
        assert_eq!(ring.pop().unwrap().scancode, 5);
    }

    #[test]
    fn enter_maps_to_line_terminator() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        drain();
        process_scancode(0x1C);
        let ev = read_event().expect("event");
        // The layout reports CR or LF depending on pc-keyboard version;
        // the shell accepts both.
        assert!(matches!(ev.character, Some('\n') | Some('\r')));
    }
}
