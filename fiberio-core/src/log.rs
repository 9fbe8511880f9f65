/// The env var holding the max level, `info` if unset or unparsable.
pub const LOG_LEVEL_ENV: &str = "FIBERIO_LOG_LEVEL";

/// init log framework.
#[cfg(feature = "logs")]
pub fn init() {
    use std::str::FromStr;
    use std::sync::atomic::{AtomicBool, Ordering};
    static LOG_INITED: AtomicBool = AtomicBool::new(false);
    if LOG_INITED
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        return;
    }
    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|v| log::LevelFilter::from_str(v.trim()).ok())
        .unwrap_or(log::LevelFilter::Info);
    let mut builder = simplelog::ConfigBuilder::new();
    let config = match builder.set_time_format_rfc2822().set_time_offset_to_local() {
        Ok(builder) | Err(builder) => builder
            .set_thread_level(log::LevelFilter::Error)
            .set_target_level(log::LevelFilter::Off)
            .build(),
    };
    _ = simplelog::CombinedLogger::init(vec![simplelog::TermLogger::new(
        level,
        config,
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )]);
}

#[doc(hidden)]
#[macro_export]
macro_rules! __log {
    ($level:ident, $($arg:tt)+) => {{
        cfg_if::cfg_if! {
            if #[cfg(feature = "logs")] {
                $crate::log::init();
                log::$level!($($arg)+);
            }
        }
    }};
}

/// debug!("a {} event", "log")
#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => {
        $crate::__log!(debug, $($arg)+)
    };
}

/// info!(target: "my_target", "a {} event", "log")
#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => {
        $crate::__log!(info, $($arg)+)
    };
}

/// warn!("a {} event", "log")
#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => {
        $crate::__log!(warn, $($arg)+)
    };
}

/// error!("a {} event", "log")
#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => {
        $crate::__log!(error, $($arg)+)
    };
}
