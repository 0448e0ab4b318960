//! Root `slog` logger construction.
//!
//! There is no on-chain host here to hand us a logger the way the
//! runtime/ROFL components receive one — this binary builds its own root
//! drain once at startup and clones cheap `slog::Logger` handles into
//! every long-lived component (the engine, the automation loop, the HTTP
//! server).

use slog::{o, Drain};

/// Build the async, term-decorated root logger. `component` becomes a
/// permanent key on every record emitted through the returned logger.
pub fn root_logger(component: &str) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, o!("component" => component.to_string()))
}
