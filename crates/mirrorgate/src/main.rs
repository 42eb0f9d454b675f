//! Mirrorgate.
//!
//! Mirrorgate is an edge file server. It serves files from a size and time bounded in-memory
//! cache, and redirects clients to weighted mirrors for files it should not or cannot serve
//! itself.

#![warn(
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod endpoints;
mod logging;
mod server;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
