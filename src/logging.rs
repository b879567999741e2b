use tracing_subscriber::EnvFilter;

/// Install a compact fmt subscriber for hosts that do not bring their own.
///
/// `RUST_LOG` wins over the `debug` flag when set.
pub fn init(debug: bool) {
    let filter = if debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatrelay=debug,warn"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatrelay=info,warn"))
    };

    // A host that already installed a global subscriber keeps it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .try_init();
}
