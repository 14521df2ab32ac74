//! Couloir: an HTTP reverse tunnel.
//!
//! A **relay** runs on a public host whose wildcard DNS record points at it;
//! **exposers** on private machines open a *couloir* (a named subdomain
//! tunnel) and proxy inbound HTTP(S) requests to a local server. Control
//! traffic and HTTP share the relay's TCP port; the first line of every
//! connection decides which one a socket carries.

/// Certificate cache, SNI resolution and ACME ordering for the TLS relay.
pub mod cert;
/// The private-side pool that keeps idle tunnel sockets toward the relay.
pub mod expose;
/// The line-oriented control protocol multiplexed with HTTP.
pub mod protocol;
/// The public-side listener, socket classification and pairing.
pub mod relay;

mod parse;
mod util;

pub use parse::{HttpHead, HttpResponse};
pub use relay::{Relay, RelayError, RelayOpts};

use std::time::Duration;

/// Cap on the bytes buffered while classifying a connection preface.
pub(crate) const PREFACE_MAX_LENGTH: usize = 64 * 1024;

/// Default limit on how long a socket may take to deliver its preface.
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of idle exposer sockets kept toward the relay.
pub const DEFAULT_POOL_SIZE: usize = 10;
