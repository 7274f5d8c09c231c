//! A linearizable key/value service layered on an external consensus
//! log.
//!
//! `server::KvServer` turns committed log entries into a deterministic
//! `Store` and answers `get`/`put`/`append`/`notify` rpcs; a handler
//! parks until its own proposal comes back out of the log, so every
//! reply reflects the single committed order. `client::Clerk` is the
//! stateful session on the other side: it stamps each logical call with
//! a `clientId-seq` token, hunts for the leader by rotating through the
//! replica set, and afterwards tells the cluster that the token's dedup
//! record can be dropped.

pub mod client;
pub mod server;
