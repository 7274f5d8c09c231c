//! A replicated key/value service with linearizable, exactly-once client
//! semantics, layered on an external consensus log.
//!
//! The `kv` module holds the two halves of the protocol: the replica
//! (`kv::server`) that proposes operations to consensus and rebuilds its
//! state from the committed stream, and the client session
//! (`kv::client::Clerk`) that stamps requests with unique tokens and
//! retries them until a leader answers. The `consensus` module defines
//! the slice of the consensus layer the service consumes; `proto` holds
//! the wire and log-entry messages.

#[allow(unused_imports)]
#[macro_use]
extern crate log;
#[macro_use]
extern crate prost_derive;

pub mod consensus;
pub mod kv;
pub mod proto;
