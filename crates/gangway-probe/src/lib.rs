//! Gangway version prober.
//!
//! `HttpProber` implements the engine's `Prober` contract over plain
//! HTTP/1. A unit advertises the version it runs either in the `Server`
//! response header (`<name>-<version>`) or as the whole response body.

mod prober;

pub use prober::{DEFAULT_PROBE_TIMEOUT, HttpProber, version_token};
