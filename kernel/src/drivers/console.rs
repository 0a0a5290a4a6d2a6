//! Console output routing.
//!
//! `print!`/`println!` land here. Before the desktop exists the bytes go to
//! COM1; once the terminal window is up it registers itself as the sink and
//! takes over. The sink is a plain function pointer so the fast path stays
//! allocation-free.

use core::fmt;

use spin::RwLock;

type SinkFn = fn(&str);

static SINK: RwLock<Option<SinkFn>> = RwLock::new(None);

/// Route console output to `sink` (the desktop terminal).
pub fn set_sink(sink: SinkFn) {
    *SINK.write() = Some(sink);
}

/// Drop back to serial-only output (terminal teardown).
pub fn clear_sink() {
    *SINK.write() = None;
}

struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match *SINK.read() {
            Some(sink) => sink(s),
            None => crate::serial::_print(format_args!("{}", s)),
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    let _ = ConsoleWriter.write_fmt(args);
}
