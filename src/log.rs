//! A small hand-rolled logging facility.
//!
//! None of the teacher crates in this corpus pull in `log` or `tracing` for
//! this kind of low-level emulator code, and FEX-Emu's own `LogManager.h` is
//! itself a bespoke facility rather than an ecosystem logger. This module
//! follows both precedents: a level enum plus a couple of macros over
//! `eprintln!`, gated at runtime by the `NIL_LOG` environment variable
//! instead of compiled out, so a release build can still be asked for
//! diagnostics.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    None = 0,
    Error = 1,
    Debug = 2,
    Info = 3,
}

static LEVEL: AtomicU8 = AtomicU8::new(Level::Error as u8);

/// Read `NIL_LOG` once and install it as the active level. Called from
/// `Config::from_env`; safe to call multiple times.
pub fn init_from_env() {
    let lvl = match std::env::var("NIL_LOG").as_deref() {
        Ok("none") => Level::None,
        Ok("debug") => Level::Debug,
        Ok("info") => Level::Info,
        _ => Level::Error,
    };
    LEVEL.store(lvl as u8, Ordering::Relaxed);
}

pub fn level() -> Level {
    match LEVEL.load(Ordering::Relaxed) {
        0 => Level::None,
        1 => Level::Error,
        2 => Level::Debug,
        _ => Level::Info,
    }
}

#[macro_export]
macro_rules! dbg_e {
    ($($arg:tt)*) => {
        if $crate::log::level() >= $crate::log::Level::Error {
            eprintln!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! dbg_d {
    ($($arg:tt)*) => {
        if $crate::log::level() >= $crate::log::Level::Debug {
            eprintln!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! dbg_i {
    ($($arg:tt)*) => {
        if $crate::log::level() >= $crate::log::Level::Info {
            eprintln!($($arg)*);
        }
    };
}
