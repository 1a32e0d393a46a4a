//! An echo server (TCP or UDP) built around a completion port model: every connection keeps
//!  several receives in flight at the same time, and a pool of workers handles their completions
//!  in whatever order they arrive.
//!
//! ## Restoring order
//!
//! The socket fills posted receives in the order they were posted, but with several workers
//!  taking completions off a shared queue, the completion of receive N+1 may well be handled
//!  before that of receive N - possibly concurrently, on a different thread. The echoed data must
//!  still go back in the order it was received.
//!
//! So every receive gets a sequence number when it is posted (under the connection's lock, so
//!  the numbers reflect post order). A completed receive becomes a send with the same sequence
//!  number, and goes into the connection's out-of-order list. Sends are issued from the head of
//!  that list only while the head's sequence is the next one to be sent; at the first gap,
//!  issuing stops until the missing receive completes. See [reorder] for the algorithm and
//!  [connection] for the per-connection state.
//!
//! ```ascii
//!  socket engine ---> completion queue ---> worker 1 \
//!   (posted ops,          (shared)          worker 2  +--> connection lock --> reorder --> sends
//!    in post order)                         worker n /
//! ```
//!
//! ## Lifecycle
//!
//! A TCP listener keeps `fan_out` accepts posted; each accepted connection starts with
//!  `fan_out` receives and re-posts a receive for every one that completes. A zero-byte receive
//!  closes a connection gracefully (buffered data is still echoed), an error closes it at once.
//!  A connection is reclaimed when it is closing, has no operations in flight and nothing left to
//!  send. UDP sockets are endpoints that echo every datagram (empty ones included) back to its
//!  sender, and that ignore per-datagram errors.

pub mod buffers;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod echo_server;
pub mod io_port;
pub mod net;
pub mod registry;
pub mod reorder;
pub mod sequence;
pub mod statistics;

#[cfg(test)]
mod test_util;
