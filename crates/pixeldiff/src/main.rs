//! Pixeldiff.
//!
//! Pixeldiff is a standalone web service that computes, caches and serves
//! perceptual diffs between reference images for visual regression testing.
//! It fetches images from remote storage buckets, stores them and the
//! computed diff images on local disk, and serves both over HTTP.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;
mod service;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
