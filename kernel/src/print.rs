// Print macros for kernel output

use core::fmt::{self, Write};

use spin::Once;

/// Console sink installed by the platform bring-up code (VGA, serial)
pub trait ConsoleSink: Send + Sync {
    fn write_str(&self, s: &str);
}

static CONSOLE: Once<&'static dyn ConsoleSink> = Once::new();

/// Install the console sink; first caller wins.
pub fn set_console(sink: &'static dyn ConsoleSink) {
    CONSOLE.call_once(|| sink);
}

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(sink) = CONSOLE.get() {
            sink.write_str(s);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // Output before the console is installed is dropped.
    let _ = ConsoleWriter.write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
