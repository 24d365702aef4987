//! Formatted console output.
//!
//! Console wiring (UART/VGA) is an external collaborator (`hal::Console`);
//! this module only owns the global slot that holds whichever console the
//! boot sequence installed, and the `print!`/`println!` macros that format
//! through it. Guarded with `spin::Mutex` rather than `crate::spinlock`: the
//! console lock only serializes interleaved `Display` output, it is not one
//! of the invariants this core's spinlock is tested against.
use core::fmt;

use spin::Mutex;

use crate::hal::Console;

static CONSOLE: Mutex<Option<&'static dyn Console>> = Mutex::new(None);

/// Installs the console used by `print!`/`println!`. Call once at boot.
pub fn set_console(console: &'static dyn Console) {
    *CONSOLE.lock() = Some(console);
}

struct ConsoleWriter<'a>(&'a dyn Console);

impl fmt::Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.0.putc(byte);
        }
        Ok(())
    }
}

/// Formats `args` directly through `console`, bypassing the global slot.
/// Split out from [`_print`] so it can be unit-tested without a `'static`
/// console.
pub fn write_to(console: &dyn Console, args: fmt::Arguments<'_>) {
    use fmt::Write;
    let _ = ConsoleWriter(console).write_fmt(args);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    if let Some(console) = *CONSOLE.lock() {
        write_to(console, args);
    }
}

/// Prints to the installed console, or silently does nothing if none has
/// been installed yet.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::printf::_print(format_args!($($arg)*)));
}

/// Like `print!` but appends a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::BufferConsole;

    #[test]
    fn write_to_formats_through_the_given_console() {
        let console = BufferConsole::new();
        write_to(&console, format_args!("hi {}", 1));
        assert_eq!(console.take(), b"hi 1".to_vec());
    }

    #[test]
    fn println_macro_appends_newline() {
        let console = BufferConsole::new();
        write_to(&console, format_args!("{}\n", format_args!("ok")));
        assert_eq!(console.take(), b"ok\n".to_vec());
    }
}
