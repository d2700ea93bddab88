use super::message::{ElectionRequest, ElectionResponse, HeartbeatRequest, HeartbeatResponse};
use super::node::Node;
use super::state::RaftState;
use crate::encoding::Value as _;
use crate::error::{Error, Result};

use crossbeam::channel::{self, Receiver, Sender};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A handler invoked with a peer's heartbeat reply, on a transport-owned
/// thread.
pub type HeartbeatHandler = Box<dyn FnOnce(Result<HeartbeatResponse>) + Send>;

/// A handler invoked with a peer's vote reply, on a transport-owned thread.
pub type ElectionHandler = Box<dyn FnOnce(Result<ElectionResponse>) + Send>;

/// An asynchronous RPC client for cluster peers. Sends return as soon as
/// the request is dispatched; the reply handler runs later on a
/// transport-owned thread.
pub trait Transport: Send + Sync {
    fn send_heartbeat(&self, to: &Node, req: HeartbeatRequest, handler: HeartbeatHandler)
        -> Result<()>;
    fn start_election(&self, to: &Node, req: ElectionRequest, handler: ElectionHandler)
        -> Result<()>;
}

/// A request in flight to a node's dispatcher.
enum Rpc {
    Heartbeat(Vec<u8>, HeartbeatHandler),
    Election(Vec<u8>, ElectionHandler),
}

/// An in-process transport connecting nodes over crossbeam channels. Every
/// registered node gets a dispatcher thread that decodes inbound requests,
/// runs them against the node's consensus state, and invokes the sender's
/// handler with the response. Requests round-trip through the wire encoding
/// as they would on a real network. Sends to unregistered addresses fail.
#[derive(Default)]
pub struct Channel {
    peers: Mutex<HashMap<Node, Sender<Rpc>>>,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node and spawns its dispatcher thread. The dispatcher
    /// exits once the node is deregistered or the transport is dropped.
    pub fn register(&self, node: &Node, state: Arc<RaftState>) -> Result<()> {
        let (tx, rx) = channel::unbounded();
        self.peers.lock()?.insert(node.clone(), tx);
        std::thread::Builder::new()
            .name(format!("dispatcher-{node}"))
            .spawn(move || Self::dispatch(rx, state))
            .map_err(|err| Error::Startup(format!("cannot spawn dispatcher: {err}")))?;
        Ok(())
    }

    /// Deregisters a node, making it unreachable and stopping its
    /// dispatcher.
    pub fn deregister(&self, node: &Node) -> Result<()> {
        self.peers.lock()?.remove(node);
        Ok(())
    }

    /// Dispatches inbound requests against the node's consensus state. The
    /// state's locks are released before the reply handler is invoked.
    fn dispatch(rx: Receiver<Rpc>, state: Arc<RaftState>) {
        while let Ok(rpc) = rx.recv() {
            match rpc {
                Rpc::Heartbeat(bytes, handler) => {
                    let result = HeartbeatRequest::decode(&bytes)
                        .and_then(|req| state.handle_heartbeat(&req));
                    handler(result);
                }
                Rpc::Election(bytes, handler) => {
                    let result =
                        ElectionRequest::decode(&bytes).and_then(|req| state.handle_election(&req));
                    handler(result);
                }
            }
        }
        debug!("Dispatcher exits");
    }

    fn send(&self, to: &Node, rpc: Rpc) -> Result<()> {
        let Some(tx) = self.peers.lock()?.get(to).cloned() else {
            return Err(Error::IO(format!("peer {to} is unreachable")));
        };
        Ok(tx.send(rpc)?)
    }
}

impl Transport for Channel {
    fn send_heartbeat(
        &self,
        to: &Node,
        req: HeartbeatRequest,
        handler: HeartbeatHandler,
    ) -> Result<()> {
        self.send(to, Rpc::Heartbeat(req.encode()?, handler))
    }

    fn start_election(
        &self,
        to: &Node,
        req: ElectionRequest,
        handler: ElectionHandler,
    ) -> Result<()> {
        self.send(to, Rpc::Election(req.encode()?, handler))
    }
}
