//! Log output for the `docflow` binary.
//!
//! Filter priority: `DOCFLOW_LOG` > `RUST_LOG` > the verbosity default.
//! Logs go to stderr so command reports on stdout stay machine-readable.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init(verbose: bool) {
    let filter = build_env_filter(verbose);

    let stderr_is_tty = std::io::IsTerminal::is_terminal(&std::io::stderr());

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(stderr_is_tty)
        .with_target(verbose)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();
}

fn build_env_filter(verbose: bool) -> EnvFilter {
    if let Ok(directives) = std::env::var("DOCFLOW_LOG") {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "docflow=debug"
        } else {
            "docflow=info"
        })
    })
}
