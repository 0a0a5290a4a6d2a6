//! Desktop glue.
//!
//! Hosts the shell inside a compositor window: creates the terminal
//! window, routes console output and keyboard focus into it, and runs the
//! composite/input loop as the desktop thread. Process layout after boot:
//! PID 1 idle, PID 2 desktop (the registered boot thread), PID 3 the
//! terminal thread running the shell.

pub mod terminal;

use core::sync::atomic::{AtomicU32, Ordering};

use crate::drivers::keyboard::KeyEvent;
use crate::graphics::compositor::{self, Window, WindowId};
use crate::graphics::Framebuffer;
use crate::sync::{GlobalState, IrqMutex};
use terminal::Terminal;

static TERMINAL: GlobalState<IrqMutex<Terminal>> = GlobalState::new();
static TERMINAL_WINDOW: AtomicU32 = AtomicU32::new(0);

/// Default terminal window geometry.
const TERM_COLS: usize = 80;
const TERM_ROWS: usize = 30;

fn terminal_window_id() -> WindowId {
    TERMINAL_WINDOW.load(Ordering::Relaxed)
}

/// Console sink: route `print!` text into the terminal and repaint.
fn terminal_sink(text: &str) {
    let _ = TERMINAL.with(|t| t.lock().write_str(text));
    let _ = compositor::with_compositor(|c| c.mark_dirty(terminal_window_id()));
}

/// Syscall-table clear hook.
fn terminal_clear() {
    let _ = TERMINAL.with(|t| t.lock().clear());
    let _ = compositor::with_compositor(|c| c.mark_dirty(terminal_window_id()));
}

/// Compositor redraw callback for the terminal window.
fn terminal_redraw(window: &mut Window, fb: &mut Framebuffer) {
    let area = window.content_rect();
    let _ = TERMINAL.with(|t| t.lock().render(fb, area));
}

/// One step of the desktop loop: input routing plus a composite pass.
/// Also serves as the GUI-refresh hook for blocking keyboard reads.
pub fn pump() {
    // Drain decoded keyboard events to the focused window.
    while let Some(event) = crate::drivers::keyboard::read_event() {
        let _ = compositor::with_compositor(|c| c.route_key(event));
    }
    let snapshot = crate::drivers::mouse::snapshot();
    let _ = compositor::with_compositor(|c| {
        c.handle_mouse(snapshot);
        // The cursor blink must repaint even when idle.
        c.mark_dirty(terminal_window_id());
        c.compose();
        c.clear_layout_changed();
    });
}

/// Build the terminal window and wire every hook. Requires the compositor
/// to be initialized.
pub fn init() -> crate::error::KernelResult<()> {
    let (cols, rows) = (TERM_COLS, TERM_ROWS);
    if TERMINAL
        .init(IrqMutex::new(Terminal::new(cols, rows)))
        .is_err()
    {
        return Ok(()); // already up
    }

    let width = (cols * crate::graphics::font::GLYPH_WIDTH) as u32;
    let height = (rows * crate::graphics::font::GLYPH_HEIGHT) as u32;
    let id = compositor::with_compositor(|c| {
        c.create_window(
            "Terminal",
            24,
            24,
            width,
            height,
            crate::process::current_pid(),
            Some(terminal_redraw),
            None,
        )
    })
    .ok_or(crate::error::KernelError::NotInitialized {
        subsystem: "compositor",
    })?;
    TERMINAL_WINDOW.store(id, Ordering::Relaxed);

    crate::drivers::console::set_sink(terminal_sink);
    crate::syscall::set_clear_hook(terminal_clear);
    crate::drivers::keyboard::set_idle_hook(pump);

    log::info!("desktop: terminal window {} ({}x{} cells)", id, cols, rows);
    Ok(())
}

/// Spawn the shell thread (PID 3 in the boot sequence).
pub fn spawn_shell() -> crate::error::KernelResult<crate::process::Pid> {
    crate::process::create(shell_main, "terminal", 32 * 1024)
}

extern "C" fn shell_main() -> i32 {
    let mut shell = crate::services::shell::Shell::new(TerminalIo);
    shell.run();
    0
}

/// Shell I/O bound to the terminal window's key queue.
struct TerminalIo;

impl crate::services::shell::ShellIo for TerminalIo {
    fn write(&mut self, text: &str) {
        crate::print!("{}", text);
    }

    fn read_key(&mut self) -> KeyEvent {
        loop {
            let event =
                compositor::with_compositor(|c| c.pop_key(terminal_window_id())).flatten();
            if let Some(event) = event {
                return event;
            }
            crate::sched::check_reschedule();
            crate::arch::halt();
        }
    }
}

/// The desktop main loop, run by the registered boot thread.
pub fn run() -> ! {
    loop {
        crate::sched::preempt_disable();
        pump();
        crate::sched::preempt_enable();
        crate::sched::check_reschedule();
        crate::sched::yield_now();
        crate::arch::halt();
    }
}
