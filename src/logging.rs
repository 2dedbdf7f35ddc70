use env_logger::{Builder, Env};

/// Install the global logger. `RUST_LOG` overrides the default `info` filter.
pub fn init() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}
