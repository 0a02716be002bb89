//! `ostore` — content-addressed object storage server.
//!
//! Clients connect over TCP and submit opaque payloads under 256-bit
//! identifiers; the server deduplicates byte-equal payloads so distinct
//! identifiers share one buffer. A GET issued before the matching SET does
//! not fail: it parks on the server and is answered, in arrival order, the
//! moment the SET lands (rendezvous reads).
//!
//! ```text
//! +----------+   80-byte headers    +---------------------+
//! |  client  | <------------------> | connection handler  |
//! +----------+    + payloads        +----------+----------+
//!                                              |
//!                             +----------------+----------------+
//!                             |                                 |
//!                      +------+-------+                 +-------+--------+
//!                      |   register   |                 |   rendezvous   |
//!                      | (id -> hash  |                 | (id -> parked  |
//!                      |  -> payload) |                 |    requests)   |
//!                      +--------------+                 +----------------+
//! ```
//!
//! All tasks run on one single-threaded cooperative executor; see the
//! `server` module.

pub mod protocol;
pub mod register;
pub mod server;
