// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,strata_render_vk=debug";

/// Installs the process-wide subscriber. `RUST_LOG` overrides `default_filter`.
/// Calling it twice is harmless; the second call is ignored.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let installed = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(default_filter, "tracing initialised");
    }
}
