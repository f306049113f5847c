//! Asynchronous UDP datagram receiving on top of a callback-driven reactor socket.
//!
//! This crate is a transport-level adapter: it owns one bound UDP socket, turns incoming
//!  datagrams into pooled packet objects, and forwards them to a downstream sink. It
//!  implements no protocol semantics above raw datagram delivery - no retransmission,
//!  reassembly or congestion control.
//!
//! ## Design
//!
//! * **Pooled, reference-counted buffers**: receive buffers come from a shared
//!   fixed-capacity pool. For each read, the reactor asks for a buffer (allocation
//!   callback), fills it, and reports completion (receive callback) - a strictly ordered
//!   pair per read. The receiver holds an extra reference across that window so the
//!   buffer cannot return to the pool mid-fill, and asserts the expected reference count
//!   at completion time. The packet handed to the sink carries a zero-copy slice that
//!   keeps the buffer alive for as long as the packet lives.
//! * **Single-threaded reactor discipline**: all lifecycle operations and callbacks for
//!   one receiver execute on the reactor's thread of control and never block. `stop()`
//!   only requests teardown; the handle is released asynchronously, with completion
//!   delivered via callback. A receiver can be unlinked from its owning registry either
//!   synchronously (handle never opened) or deferred until that close completes.
//! * **Two error classes**: network conditions - read errors, empty or truncated
//!   datagrams, pool exhaustion, malformed source addresses - are logged and the
//!   datagram dropped; they are expected under load. Violations of the invariants
//!   between receiver, pools and reactor (wrong buffer reference count, read exceeding
//!   buffer capacity, data without a source address) panic instead, since continuing
//!   would risk silent corruption.
//!
//! The reactor socket is a capability trait (`socket::ReceiverSocket`); the production
//!  implementation runs on tokio, and tests drive the receiver with a synchronous fake.

pub mod address;
pub mod buffer_pool;
pub mod packet;
pub mod receiver_registry;
pub mod socket;
pub mod udp_receiver;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
