//! Early serial console macros, backed by the `log` facade everywhere else.
//!
//! `print!`/`println!` write straight to COM1 and exist for boot-time output
//! before `log::set_logger` has run; once logging is initialized, kernel code
//! should prefer `log::info!`/`log::warn!`/`log::error!`.

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::arch::x86_64::serial::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
