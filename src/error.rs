use std::io;

/// Errors raised synchronously while validating [`BackendOptions`].
///
/// These are the only fatal errors in the crate; once the worker is running
/// every failure is reported through the error notifier instead.
///
/// [`BackendOptions`]: crate::BackendOptions
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "invalid config, when the TSC clock is used sleep_duration ({sleep_us} us) must not \
         exceed rdtsc_resync_interval ({resync_us} us)"
    )]
    SleepExceedsResyncInterval { sleep_us: u128, resync_us: u128 },
    #[error("backend thread name must not be empty")]
    EmptyThreadName,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("a logger named `{0}` already exists")]
    LoggerExists(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    SetLogger(#[from] log::SetLoggerError),
}
