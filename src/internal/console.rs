use std::io::Write;

#[doc(hidden)] // needs to be public for the kprint! macro, but shouldn't be used directly
pub fn _kprint(args: ::core::fmt::Arguments) {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_fmt(args);
    let _ = stdout.flush();
}

/// Print to the console
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::internal::console::_kprint(core::format_args!($($arg)*));
    };
}

/// Print to the console with a newline
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n");
    };
    ($($arg:tt)*) => {
        $crate::kprint!("{}\n", core::format_args!($($arg)*));
    };
}
