//! Subscriber setup for binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a fmt subscriber filtered by `STRAND_LOG` (EnvFilter syntax,
/// default `info`). Does nothing if a global subscriber is already set.
///
/// Libraries should not call this; it is meant for `main`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("STRAND_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .compact(),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        init_logging();
        init_logging();
        tracing::debug!("logging initialized twice");
    }
}
