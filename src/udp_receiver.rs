//! The UDP receiver: one bound socket, driven by reactor callbacks, forwarding incoming
//!  datagrams as pooled packets to a downstream sink.
//!
//! Lifecycle: `start()` binds and arms the receive callbacks, all-or-nothing. `stop()`
//!  requests asynchronous teardown and returns immediately; the close-completion
//!  callback finishes the transition and - if removal was requested in the meantime -
//!  unlinks the receiver from its registry. Dropping a receiver whose handle is still
//!  open is a programming error and panics, because the reactor may still call into it.
//!
//! Network conditions (errors, empty or truncated datagrams, pool exhaustion, malformed
//!  source addresses) are logged and the datagram dropped. Violations of the buffer
//!  lifetime contract with the reactor are not network conditions - they panic.

use crate::address::Address;
use crate::buffer_pool::{BufferHandle, BufferPool};
use crate::packet::{PacketFlags, PacketPool, PacketSink};
use crate::receiver_registry::ReceiverRegistry;
use crate::socket::{ReceiverSocket, RecvBuffer, RecvEvent, RecvHandler};
use anyhow::anyhow;
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, trace};

pub struct UdpReceiver {
    socket: Arc<dyn ReceiverSocket>,
    buffer_pool: Arc<BufferPool>,
    packet_pool: Arc<PacketPool>,
    sink: Arc<dyn PacketSink>,
    state: Mutex<ReceiverState>,
}

#[derive(Default)]
struct ReceiverState {
    handle_initialized: bool,
    address: Address,
    packet_counter: u32,
    removal: RemovalState,
    /// extra reference to the buffer of the read in flight, taken in `on_alloc()` and
    ///  dropped in `on_recv()`
    in_flight: Option<BufferHandle>,
}

#[derive(Default)]
enum RemovalState {
    #[default]
    None,
    Pending(Arc<ReceiverRegistry>),
}

impl UdpReceiver {
    pub fn new(
        socket: Arc<dyn ReceiverSocket>,
        buffer_pool: Arc<BufferPool>,
        packet_pool: Arc<PacketPool>,
        sink: Arc<dyn PacketSink>,
    ) -> Arc<UdpReceiver> {
        Arc::new(UdpReceiver {
            socket,
            buffer_pool,
            packet_pool,
            sink,
            state: Mutex::new(ReceiverState::default()),
        })
    }

    /// Bind to `bind_address` and start receiving. All-or-nothing: if any sub-step
    ///  fails, the handle is fully torn down again and a later retry can succeed.
    pub fn start(self: &Arc<Self>, bind_address: SocketAddr) -> anyhow::Result<()> {
        self.init_()?;

        if let Err(e) = self.bind_(bind_address) {
            self.close_();
            return Err(e);
        }

        let local_addr = match self.local_addr_(bind_address) {
            Ok(addr) => addr,
            Err(e) => {
                self.close_();
                return Err(e);
            }
        };

        if let Err(e) = self.arm_(local_addr) {
            self.close_();
            return Err(e);
        }

        Ok(())
    }

    /// Asynchronous stop: halts receive callbacks and requests close, returning
    ///  immediately. Completion arrives later on the reactor thread. Idempotent.
    pub fn stop(self: &Arc<Self>) {
        {
            let state = self.state.lock().unwrap();
            if !state.handle_initialized {
                return;
            }
            if self.socket.is_closing() {
                return;
            }
            info!("closing UDP port {}", state.address);
        }

        // best-effort: an error here must not keep us from closing the handle
        if let Err(e) = self.socket.stop_receiving() {
            error!("stopping receive callbacks failed: {}", e);
        }

        let this = self.clone();
        self.socket
            .request_close(Some(Box::new(move || this.on_closed())));
    }

    /// Unlink from `registry` - synchronously if the handle was never started or is
    ///  already closed, otherwise deferred until asynchronous close completes. The
    ///  bound address reads as empty from this call on.
    pub fn remove(self: &Arc<Self>, registry: &Arc<ReceiverRegistry>) {
        let deferred = {
            let mut state = self.state.lock().unwrap();
            if let RemovalState::Pending(_) = state.removal {
                panic!("udp receiver: removal is already pending");
            }
            if state.handle_initialized {
                state.removal = RemovalState::Pending(registry.clone());
                state.address = Address::empty();
            }
            state.handle_initialized
        };

        if deferred {
            self.stop();
        }
        else {
            registry.remove(self);
        }
    }

    /// The bound address, or empty if not listening or removal has been requested.
    pub fn address(&self) -> Address {
        self.state.lock().unwrap().address
    }

    fn on_closed(self: &Arc<Self>) {
        let removal = {
            let mut state = self.state.lock().unwrap();
            state.handle_initialized = false;
            mem::take(&mut state.removal)
        };

        if let RemovalState::Pending(registry) = removal {
            registry.remove(self);
        }
    }

    fn init_(&self) -> anyhow::Result<()> {
        if self.state.lock().unwrap().handle_initialized {
            return Err(anyhow!("receiver is already started"));
        }
        if let Err(e) = self.socket.init() {
            error!("initializing the socket handle failed: {}", e);
            return Err(e);
        }
        self.state.lock().unwrap().handle_initialized = true;
        Ok(())
    }

    fn bind_(&self, bind_address: SocketAddr) -> anyhow::Result<()> {
        // a fixed configured port must be rebindable right after a restart; an ephemeral
        //  port has no such need
        let reuse_addr = bind_address.port() != 0;

        if let Err(e) = self.socket.bind(bind_address, reuse_addr) {
            error!("binding to {} failed: {}", bind_address, e);
            return Err(e);
        }
        Ok(())
    }

    fn local_addr_(&self, bind_address: SocketAddr) -> anyhow::Result<SocketAddr> {
        let local_addr = match self.socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("querying the bound local address failed: {}", e);
                return Err(e);
            }
        };

        if local_addr.is_ipv4() != bind_address.is_ipv4() {
            let e = anyhow!(
                "bound local address {} does not match the requested address family",
                local_addr
            );
            error!("{}", e);
            return Err(e);
        }
        Ok(local_addr)
    }

    fn arm_(self: &Arc<Self>, local_addr: SocketAddr) -> anyhow::Result<()> {
        if let Err(e) = self.socket.start_receiving(self.clone()) {
            error!("starting receive callbacks failed: {}", e);
            return Err(e);
        }

        info!("opened UDP port {}", local_addr);
        self.state.lock().unwrap().address = local_addr.into();
        Ok(())
    }

    fn close_(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.handle_initialized {
                return;
            }
            if self.socket.is_closing() {
                return;
            }
            state.handle_initialized = false;
        }
        self.socket.request_close(None);
    }
}

impl RecvHandler for UdpReceiver {
    fn on_alloc(&self, suggested_size: usize) -> RecvBuffer {
        let Some(buffer) = self.buffer_pool.checkout() else {
            error!("no free buffer for incoming datagram");
            return RecvBuffer::empty();
        };

        // never let the reactor write past the buffer's end
        let len = suggested_size.min(buffer.capacity());

        let mut state = self.state.lock().unwrap();
        if state.in_flight.is_some() {
            panic!("udp receiver: buffer allocation requested while a read is in flight");
        }
        state.in_flight = Some(buffer.clone());

        RecvBuffer::new(buffer, len)
    }

    fn on_recv(&self, event: RecvEvent) {
        let RecvEvent {
            buffer,
            nread,
            src_addr,
            partial,
        } = event;

        // one reference held by this event, one stashed in on_alloc() - anything else
        //  means the buffer lifetime contract with the reactor is broken
        if buffer.ref_count() != 2 {
            panic!(
                "udp receiver: unexpected buffer reference count: {}",
                buffer.ref_count()
            );
        }

        let (dst_addr, counter, in_flight) = {
            let mut state = self.state.lock().unwrap();
            (state.address, state.packet_counter, state.in_flight.take())
        };
        drop(in_flight);

        let src = match &src_addr {
            Some(raw) => match raw.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    error!(
                        "can't determine source address: num={} dst={} nread={}: {}",
                        counter, dst_addr, nread, e
                    );
                    Address::empty()
                }
            },
            None => Address::empty(),
        };

        if nread < 0 {
            error!(
                "network error: num={} src={} dst={} nread={}",
                counter, src, dst_addr, nread
            );
            return;
        }

        if nread == 0 {
            if src_addr.is_some() {
                trace!("empty datagram: num={} src={} dst={}", counter, src, dst_addr);
            }
            // otherwise: no data available right now
            return;
        }

        if src_addr.is_none() {
            panic!("udp receiver: read of {} bytes without a source address", nread);
        }

        if partial {
            debug!(
                "ignoring truncated datagram: num={} src={} dst={} nread={}",
                counter, src, dst_addr, nread
            );
            return;
        }

        let nread = nread as usize;

        let counter = {
            let mut state = self.state.lock().unwrap();
            state.packet_counter = state.packet_counter.wrapping_add(1);
            state.packet_counter
        };

        trace!(
            "received datagram: num={} src={} dst={} nread={}",
            counter, src, dst_addr, nread
        );

        if nread > buffer.capacity() {
            panic!(
                "udp receiver: read of {} bytes exceeds buffer capacity {}",
                nread,
                buffer.capacity()
            );
        }

        let Some(packet) = self.packet_pool.checkout() else {
            error!(
                "no free packet for incoming datagram: num={} src={} dst={}",
                counter, src, dst_addr
            );
            return;
        };

        packet.add_flags(PacketFlags::UDP);
        packet.set_src_addr(src);
        packet.set_dst_addr(dst_addr);
        packet.set_data(buffer.slice(0, nread));

        self.sink.write(packet);
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        // a second panic while already unwinding would escalate to an abort
        if std::thread::panicking() {
            return;
        }
        let initialized = self
            .state
            .get_mut()
            .map(|s| s.handle_initialized)
            .unwrap_or(false);
        if initialized {
            panic!("udp receiver: dropped while the socket handle is still open");
        }
    }
}
