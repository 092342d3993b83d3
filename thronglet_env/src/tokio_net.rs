//! Production transport: UDP broadcast for discovery, TCP for requests.
//!
//! Reliable frames are a 4-byte big-endian length followed by the payload.
//! One request and at most one reply travel over each connection.

use crate::error::EnvError;
use crate::network::{NetworkTransport, RequestHandler};
use crate::types::Datagram;
use async_trait::async_trait;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Socket-level settings for `TokioTransport`.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interface to bind both sockets on
    pub bind_ip: IpAddr,

    /// UDP port for discovery datagrams
    pub discovery_port: u16,

    /// TCP port for reliable requests
    pub comm_port: u16,

    /// Destination address for broadcasts
    pub broadcast_ip: IpAddr,

    /// Largest accepted datagram or frame, in bytes
    pub max_message_size: usize,

    /// Bound on each inbound exchange (read request, write reply)
    pub io_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            discovery_port: 7890,
            comm_port: 7891,
            broadcast_ip: IpAddr::V4(Ipv4Addr::BROADCAST),
            max_message_size: 64_000,
            io_timeout: Duration::from_secs(10),
        }
    }
}

/// Tokio socket transport.
pub struct TokioTransport {
    config: TransportConfig,

    /// Discovery socket (broadcast enabled)
    udp: Arc<UdpSocket>,

    /// Listener waiting to be handed to `serve`
    listener: Mutex<Option<TcpListener>>,

    /// Bound reliable endpoint
    local_addr: SocketAddr,

    /// Accept loop, aborted on close
    accept_task: Mutex<Option<JoinHandle<()>>>,

    closed: AtomicBool,
}

impl TokioTransport {
    /// Binds the discovery and reliable sockets.
    ///
    /// Failure here is a startup fault: the node cannot run without either
    /// channel.
    pub async fn bind(config: TransportConfig) -> Result<Self, EnvError> {
        let udp = UdpSocket::bind((config.bind_ip, config.discovery_port)).await?;
        udp.set_broadcast(true)?;

        let listener = TcpListener::bind((config.bind_ip, config.comm_port)).await?;
        let local_addr = listener.local_addr()?;

        info!(
            "Transport bound: discovery={} reliable={}",
            udp.local_addr()?,
            local_addr
        );

        Ok(Self {
            config,
            udp: Arc::new(udp),
            listener: Mutex::new(Some(listener)),
            local_addr,
            accept_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Address the discovery socket is bound to.
    pub fn discovery_addr(&self) -> Result<SocketAddr, EnvError> {
        Ok(self.udp.local_addr()?)
    }

    fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::new(self.config.broadcast_ip, self.config.discovery_port)
    }

    fn check_size(&self, size: usize) -> Result<(), EnvError> {
        if size > self.config.max_message_size {
            return Err(EnvError::MessageTooLarge {
                size,
                max: self.config.max_message_size,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkTransport for TokioTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn broadcast(&self, payload: Vec<u8>) -> Result<usize, EnvError> {
        self.check_size(payload.len())?;
        self.udp.send_to(&payload, self.broadcast_target()).await?;
        Ok(1)
    }

    async fn send_to(&self, target: SocketAddr, payload: Vec<u8>) -> Result<(), EnvError> {
        self.check_size(payload.len())?;
        self.udp.send_to(&payload, target).await?;
        Ok(())
    }

    async fn recv_datagram(&self) -> Option<Datagram> {
        let mut buf = vec![0u8; self.config.max_message_size];
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            match self.udp.recv_from(&mut buf).await {
                Ok((len, from)) => return Some(Datagram::new(from, buf[..len].to_vec())),
                Err(e) => {
                    // ICMP errors surface here on some platforms; keep listening
                    debug!("Discovery receive error: {}", e);
                }
            }
        }
    }

    fn try_recv_datagram(&self) -> Option<Datagram> {
        let mut buf = vec![0u8; self.config.max_message_size];
        match self.udp.try_recv_from(&mut buf) {
            Ok((len, from)) => Some(Datagram::new(from, buf[..len].to_vec())),
            Err(_) => None,
        }
    }

    async fn request(
        &self,
        target: SocketAddr,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, EnvError> {
        self.check_size(payload.len())?;
        let max = self.config.max_message_size;

        let exchange = async {
            let mut stream = TcpStream::connect(target).await.map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => EnvError::unreachable(target),
                _ => EnvError::Io(e),
            })?;
            write_frame(&mut stream, &payload).await?;
            read_frame(&mut stream, max).await
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| EnvError::timeout(timeout))?
    }

    fn serve(&self, handler: Arc<dyn RequestHandler>) -> Result<(), EnvError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| EnvError::network("transport is already serving"))?;

        let max = self.config.max_message_size;
        let io_timeout = self.config.io_timeout;

        let task = tokio::spawn(async move {
            loop {
                let (mut stream, peer) = accept_with_backoff(|| listener.accept()).await;

                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let exchange = async {
                        let request = read_frame(&mut stream, max).await?;
                        if let Some(reply) = handler.handle(peer, request).await {
                            write_frame(&mut stream, &reply).await?;
                        }
                        Ok::<(), EnvError>(())
                    };

                    match tokio::time::timeout(io_timeout, exchange).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!("Request from {} failed: {}", peer, e),
                        Err(_) => debug!("Request from {} timed out", peer),
                    }
                });
            }
        });

        *self.accept_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the accept loop drops the listener with it
        if let Some(task) = self.accept_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, payload: &[u8]) -> Result<(), EnvError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| EnvError::MessageTooLarge { size: payload.len(), max: u32::MAX as usize })?;
    stream.write_u32(len).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R, max: usize) -> Result<Vec<u8>, EnvError> {
    let len = stream.read_u32().await? as usize;
    if len > max {
        return Err(EnvError::MessageTooLarge { size: len, max });
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Pause after a failed accept so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Retries `accept` until it yields a connection.
async fn accept_with_backoff<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, _from: SocketAddr, payload: Vec<u8>) -> Option<Vec<u8>> {
            if payload.is_empty() {
                None
            } else {
                Some(payload.into_iter().rev().collect())
            }
        }
    }

    fn loopback_config() -> TransportConfig {
        TransportConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            discovery_port: 0,
            comm_port: 0,
            broadcast_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_message_size: 1024,
            io_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"hello").await.unwrap();
        let got = read_frame(&mut b, 64).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn test_frame_rejects_oversized() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, &[7u8; 100]).await.unwrap();
        let err = read_frame(&mut b, 10).await.unwrap_err();
        assert!(matches!(err, EnvError::MessageTooLarge { size: 100, max: 10 }));
    }

    #[tokio::test]
    async fn test_request_reply_over_tcp() {
        let server = TokioTransport::bind(loopback_config()).await.unwrap();
        server.serve(Arc::new(Echo)).unwrap();
        let client = TokioTransport::bind(loopback_config()).await.unwrap();

        let reply = client
            .request(server.local_addr(), b"abc".to_vec(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, b"cba");

        server.close();
        client.close();
    }

    #[tokio::test]
    async fn test_request_without_reply_fails() {
        let server = TokioTransport::bind(loopback_config()).await.unwrap();
        server.serve(Arc::new(Echo)).unwrap();
        let client = TokioTransport::bind(loopback_config()).await.unwrap();

        let result = client
            .request(server.local_addr(), Vec::new(), Duration::from_secs(2))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unicast_datagram() {
        let a = TokioTransport::bind(loopback_config()).await.unwrap();
        let b = TokioTransport::bind(loopback_config()).await.unwrap();

        a.send_to(b.discovery_addr().unwrap(), b"ping".to_vec()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), b.recv_datagram())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.payload, b"ping");
        assert_eq!(got.from, a.discovery_addr().unwrap());
    }

    #[tokio::test]
    async fn test_serve_twice_is_rejected() {
        let server = TokioTransport::bind(loopback_config()).await.unwrap();
        server.serve(Arc::new(Echo)).unwrap();
        assert!(server.serve(Arc::new(Echo)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_back_off() {
        let attempts = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();

        let conn = accept_with_backoff(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    // EMFILE
                    Err(std::io::Error::from_raw_os_error(24))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(conn, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= ACCEPT_BACKOFF * 3);
    }
}
