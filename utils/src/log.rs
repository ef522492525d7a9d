// This makes it easy to import the logging stuff
//
// Everything is forwarded to `tracing`. Whoever owns the process
// installs the subscriber, we only emit events.
// Austin Shafer - 2020

#![allow(unused_imports)]
pub use tracing::{debug, error, info, trace, warn};
pub use tracing::{debug_span, info_span};
