//! COM1 serial port backend for early kernel output and the `log` facade.

use core::fmt::Write;

use spin::Mutex;
use uart_16550::SerialPort;

const COM1_PORT: u16 = 0x3F8;

static SERIAL1: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(COM1_PORT) });

/// Initialize the serial port. Safe to call more than once.
pub fn init() {
    SERIAL1.lock().init();
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    SERIAL1
        .lock()
        .write_fmt(args)
        .expect("serial write should never fail");
}

/// A `log::Log` implementation that writes leveled, timestamped lines to
/// COM1. Installed once from `kernel_init`.
pub struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            crate::println!("[{:5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial-backed logger as the global `log` sink.
pub fn init_logging() {
    // set_logger fails only if a logger is already installed, which would
    // indicate kernel_init ran twice -- a bug, not a runtime condition to
    // recover from gracefully.
    log::set_logger(&LOGGER).expect("logger already initialized");
    log::set_max_level(log::LevelFilter::Trace);
}
