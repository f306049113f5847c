//! The reactor-facing socket seam.
//!
//! `ReceiverSocket` is the capability interface the receiver drives: synchronous,
//!  non-blocking lifecycle calls plus callback registration for the receive path. For
//!  each read the reactor invokes the handler as a strictly ordered pair - allocation
//!  first, completion second - with no interleaving from another read on the same
//!  handle. `TokioReceiverSocket` is the production implementation; tests substitute a
//!  deterministic fake.

use crate::address::RawAddress;
use crate::buffer_pool::BufferHandle;
use anyhow::anyhow;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::error;

/// read size suggested to the allocation callback - big enough for any UDP datagram
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Output of the allocation callback: either a buffer handle plus the writable length
///  (clamped to the buffer's capacity), or empty meaning "no buffer available for this
///  read" - the reactor skips the read without faulting.
pub struct RecvBuffer {
    inner: Option<(BufferHandle, usize)>,
}

impl RecvBuffer {
    pub fn empty() -> RecvBuffer {
        RecvBuffer { inner: None }
    }

    pub fn new(buffer: BufferHandle, len: usize) -> RecvBuffer {
        RecvBuffer {
            inner: Some((buffer, len)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    pub fn into_parts(self) -> Option<(BufferHandle, usize)> {
        self.inner
    }
}

/// One read event, delivered to the completion callback.
///
/// `nread < 0` signals a transport error; `nread == 0` without a source address means
///  "no data available right now". `partial` flags a datagram that was larger than the
///  buffer and got truncated by the OS.
pub struct RecvEvent {
    pub buffer: BufferHandle,
    pub nread: isize,
    pub src_addr: Option<RawAddress>,
    pub partial: bool,
}

pub trait RecvHandler: Send + Sync {
    fn on_alloc(&self, suggested_size: usize) -> RecvBuffer;
    fn on_recv(&self, event: RecvEvent);
}

pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// Reactor socket primitive. All methods are non-blocking; `request_close` completes
///  asynchronously and invokes the callback exactly once after the handle is fully
///  released, on the reactor's thread of control.
pub trait ReceiverSocket: Send + Sync {
    fn init(&self) -> anyhow::Result<()>;
    fn bind(&self, addr: SocketAddr, reuse_addr: bool) -> anyhow::Result<()>;
    fn local_addr(&self) -> anyhow::Result<SocketAddr>;
    fn start_receiving(&self, handler: Arc<dyn RecvHandler>) -> anyhow::Result<()>;
    fn stop_receiving(&self) -> anyhow::Result<()>;
    fn request_close(&self, on_closed: Option<CloseCallback>);
    fn is_closing(&self) -> bool;
}

/// `ReceiverSocket` implementation on top of tokio's UDP socket.
///
/// Binding goes through `socket2` so that address reuse can be requested for fixed
///  configured ports. The receive task awaits readiness first and only then asks the
///  handler for a buffer, keeping the allocate-then-fill window as short as possible.
///
/// NB: tokio's recv API gives no way to observe datagram truncation, so this
///  implementation always reports `partial = false`.
pub struct TokioReceiverSocket {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    socket: Option<Arc<UdpSocket>>,
    recv_task: Option<JoinHandle<()>>,
    closing: bool,
}

impl TokioReceiverSocket {
    pub fn new() -> Arc<TokioReceiverSocket> {
        Arc::new(TokioReceiverSocket {
            inner: Mutex::new(Inner::default()),
        })
    }
}

impl ReceiverSocket for TokioReceiverSocket {
    fn init(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.socket.is_some() || inner.recv_task.is_some() {
            return Err(anyhow!("socket is already initialized"));
        }
        inner.closing = false;
        Ok(())
    }

    fn bind(&self, addr: SocketAddr, reuse_addr: bool) -> anyhow::Result<()> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        }
        else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if reuse_addr {
            socket.set_reuse_address(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        self.inner.lock().unwrap().socket = Some(Arc::new(socket));
        Ok(())
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        let inner = self.inner.lock().unwrap();
        let socket = inner
            .socket
            .as_ref()
            .ok_or_else(|| anyhow!("socket is not bound"))?;
        Ok(socket.local_addr()?)
    }

    fn start_receiving(&self, handler: Arc<dyn RecvHandler>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.recv_task.is_some() {
            return Err(anyhow!("socket is already receiving"));
        }
        let socket = inner
            .socket
            .clone()
            .ok_or_else(|| anyhow!("socket is not bound"))?;

        inner.recv_task = Some(tokio::spawn(recv_loop(socket, handler)));
        Ok(())
    }

    fn stop_receiving(&self) -> anyhow::Result<()> {
        if let Some(task) = self.inner.lock().unwrap().recv_task.take() {
            task.abort();
        }
        Ok(())
    }

    fn request_close(&self, on_closed: Option<CloseCallback>) {
        let (task, socket) = {
            let mut inner = self.inner.lock().unwrap();
            inner.closing = true;
            (inner.recv_task.take(), inner.socket.take())
        };

        tokio::spawn(async move {
            if let Some(task) = task {
                task.abort();
                let _ = task.await;
            }
            drop(socket);
            if let Some(on_closed) = on_closed {
                on_closed();
            }
        });
    }

    fn is_closing(&self) -> bool {
        self.inner.lock().unwrap().closing
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, handler: Arc<dyn RecvHandler>) {
    loop {
        if let Err(e) = socket.readable().await {
            error!("waiting for socket readiness failed: {}", e);
            return;
        }

        let Some((buffer, len)) = handler.on_alloc(MAX_DATAGRAM_SIZE).into_parts() else {
            // no buffer available - back off instead of spinning on readiness
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        };

        let result = buffer.with_data_mut(|data| socket.try_recv_from(&mut data[..len]));
        let event = match result {
            Ok((nread, from)) => RecvEvent {
                buffer,
                nread: nread as isize,
                src_addr: Some(from.into()),
                partial: false,
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => RecvEvent {
                // readiness was spurious - report "no data" so the buffer gets released
                buffer,
                nread: 0,
                src_addr: None,
                partial: false,
            },
            Err(e) => RecvEvent {
                buffer,
                nread: -(e.raw_os_error().unwrap_or(1) as isize),
                src_addr: None,
                partial: false,
            },
        };

        handler.on_recv(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use std::sync::Arc;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
    use tokio::time::timeout;

    struct RecordingHandler {
        pool: Arc<BufferPool>,
        in_flight: Mutex<Option<BufferHandle>>,
        events: UnboundedSender<(isize, Option<RawAddress>, Vec<u8>)>,
    }

    impl RecvHandler for RecordingHandler {
        fn on_alloc(&self, suggested_size: usize) -> RecvBuffer {
            let Some(buffer) = self.pool.checkout() else {
                return RecvBuffer::empty();
            };
            let len = suggested_size.min(buffer.capacity());
            *self.in_flight.lock().unwrap() = Some(buffer.clone());
            RecvBuffer::new(buffer, len)
        }

        fn on_recv(&self, event: RecvEvent) {
            self.in_flight.lock().unwrap().take();
            let data = if event.nread > 0 {
                event.buffer.with_data(|d| d[..event.nread as usize].to_vec())
            }
            else {
                Vec::new()
            };
            self.events.send((event.nread, event.src_addr, data)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_bind_resolves_ephemeral_port() {
        let socket = TokioReceiverSocket::new();
        socket.init().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap(), false).unwrap();

        let local_addr = socket.local_addr().unwrap();
        assert!(local_addr.ip().is_loopback());
        assert_ne!(local_addr.port(), 0);

        socket.request_close(None);
    }

    #[tokio::test]
    async fn test_bind_with_reuse_addr() {
        let socket = TokioReceiverSocket::new();
        socket.init().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap(), true).unwrap();
        assert!(socket.local_addr().is_ok());

        socket.request_close(None);
    }

    #[tokio::test]
    async fn test_receive_and_close_completion() {
        let socket = TokioReceiverSocket::new();
        socket.init().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let local_addr = socket.local_addr().unwrap();

        let (tx, mut rx) = unbounded_channel();
        let handler = Arc::new(RecordingHandler {
            pool: BufferPool::new(2000, 4),
            in_flight: Mutex::new(None),
            events: tx,
        });
        socket.start_receiving(handler).unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"hello datagram", local_addr).unwrap();

        // skip spurious "no data" events
        let (nread, src_addr, data) = loop {
            let event = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for datagram")
                .unwrap();
            if event.0 != 0 {
                break event;
            }
        };

        assert_eq!(nread, 14);
        assert_eq!(data, b"hello datagram");
        let src = src_addr.unwrap().parse().unwrap();
        assert_eq!(src.socket_addr().unwrap(), sender.local_addr().unwrap());

        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        socket.request_close(Some(Box::new(move || {
            closed_tx.send(()).ok();
        })));
        assert!(socket.is_closing());

        timeout(Duration::from_secs(5), closed_rx)
            .await
            .expect("timed out waiting for close completion")
            .unwrap();
    }

    #[tokio::test]
    async fn test_init_resets_closing_for_reuse() {
        let socket = TokioReceiverSocket::new();
        socket.init().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap(), false).unwrap();

        socket.request_close(None);
        assert!(socket.is_closing());

        // retried startup after a failed or torn-down start
        tokio::time::sleep(Duration::from_millis(50)).await;
        socket.init().unwrap();
        assert!(!socket.is_closing());
        socket.bind("127.0.0.1:0".parse().unwrap(), false).unwrap();
        socket.request_close(None);
    }
}
