// =============================================================================
// Logging: tracing subscriber setup
// =============================================================================
//
// Filter comes from RUST_LOG, defaulting to `info`. Library code only emits
// events; installing the subscriber is left to the binary (or a test).

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. Returns `false` if one was already set.
pub fn init() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        let _ = init();
        assert!(!init());
    }
}
