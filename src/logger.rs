//! Logger initialization.
//!
//! The crate logs through the `log` facade. With the `builtin_env_logger`
//! feature (on by default) the embedding VM can ask us to install an
//! `env_logger` configured from `OBJSYNC_LOG`; without it, initialization
//! is a no-op and the embedder's own `log` implementation receives
//! everything.

cfg_if::cfg_if! {
    if #[cfg(feature = "builtin_env_logger")] {
        /// Attempt to init the built-in env_logger. Does nothing if a
        /// logger is already installed.
        pub fn try_init() {
            let _ = env_logger::Builder::from_env(
                env_logger::Env::default().filter_or("OBJSYNC_LOG", "info"),
            )
            .try_init();
        }
    } else {
        pub fn try_init() {}
    }
}
