//! Test doubles shared by the unit tests of this crate.

use crate::config::NodeConfig;
use crate::runtime::Node;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thronglet_env::{Datagram, EnvError, NetworkTransport, NodeId, RequestHandler, TokioContext};

/// Transport that records outbound datagrams and reaches nobody.
#[derive(Debug, Default)]
pub struct NullTransport {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl NullTransport {
    pub fn sent_datagrams(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl NetworkTransport for NullTransport {
    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 7891))
    }

    async fn broadcast(&self, _payload: Vec<u8>) -> Result<usize, EnvError> {
        Ok(0)
    }

    async fn send_to(&self, target: SocketAddr, payload: Vec<u8>) -> Result<(), EnvError> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push((target, payload));
        Ok(())
    }

    async fn recv_datagram(&self) -> Option<Datagram> {
        None
    }

    fn try_recv_datagram(&self) -> Option<Datagram> {
        None
    }

    async fn request(&self, target: SocketAddr, _payload: Vec<u8>, _timeout: Duration) -> Result<Vec<u8>, EnvError> {
        Err(EnvError::unreachable(target))
    }

    fn serve(&self, _handler: Arc<dyn RequestHandler>) -> Result<(), EnvError> {
        Ok(())
    }

    fn close(&self) {}
}

pub fn null_node(seed: u64) -> Node<TokioContext, NullTransport> {
    null_node_with(seed, |_| {})
}

pub fn null_node_with(seed: u64, tweak: impl FnOnce(&mut NodeConfig)) -> Node<TokioContext, NullTransport> {
    let mut config = NodeConfig::default();
    tweak(&mut config);
    Node::new(
        NodeId::from_seed(seed),
        config,
        Arc::new(TokioContext::seeded(seed)),
        Arc::new(NullTransport::default()),
    )
    .expect("test config is valid")
}
