//! An in-process RPC fabric for exercising a replicated service on one
//! machine: typed clients over named endpoints, servers that can be
//! retired mid-call, and switchable loss, jitter and reply reordering
//! in between, so callers see the failure modes a real deployment
//! would produce.

#![allow(clippy::new_without_default)]

use std::{error, fmt, result};

#[macro_use]
mod macros;
mod net;

pub use self::net::{Endpoint, Network, RpcFuture, RpcHandler, Server};

/// What a caller can observe going wrong. The split is what a retrying
/// client needs: `Lost` is worth retrying elsewhere (a dropped request,
/// a dropped reply and a slow peer are indistinguishable), `Dead` is
/// not, because the target incarnation is gone for good.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcError {
    Lost,
    Dead,
    Codec(String),
    NoMethod(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl error::Error for RpcError {}

pub type Result<T> = result::Result<T, RpcError>;
