//! Pooled packet objects and the downstream sink seam.
//!
//! A packet represents one received datagram: protocol flags, source and destination
//!  addresses, and a zero-copy slice into the receive buffer. Handing a packet to the
//!  sink transfers ownership; when the last handle is dropped, the packet's slot returns
//!  to the pool and its buffer slice is released.

use crate::address::Address;
use crate::buffer_pool::BufferSlice;
use bitflags::bitflags;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PacketFlags: u32 {
        /// packet was received as a raw UDP datagram
        const UDP = 1 << 0;
    }
}

#[derive(Default)]
struct PacketData {
    flags: PacketFlags,
    src_addr: Address,
    dst_addr: Address,
    data: Option<BufferSlice>,
}

/// Fixed-capacity pool of packet objects. `checkout()` returns `None` when the
///  configured maximum is outstanding; the receive path treats that as a dropped
///  datagram, not a fault.
pub struct PacketPool {
    max_packets: usize,
    outstanding: Mutex<usize>,
}

impl PacketPool {
    pub fn new(max_packets: usize) -> Arc<PacketPool> {
        Arc::new(PacketPool {
            max_packets,
            outstanding: Mutex::new(0),
        })
    }

    pub fn checkout(self: &Arc<Self>) -> Option<PacketHandle> {
        {
            let mut outstanding = self.outstanding.lock().unwrap();
            if *outstanding == self.max_packets {
                debug!("packet pool exhausted: {} packets outstanding", *outstanding);
                return None;
            }
            *outstanding += 1;
        }

        Some(PacketHandle(Arc::new(PooledPacket {
            pool: Arc::downgrade(self),
            packet: Mutex::new(PacketData::default()),
        })))
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.lock().unwrap()
    }

    fn release(&self) {
        *self.outstanding.lock().unwrap() -= 1;
    }
}

struct PooledPacket {
    pool: Weak<PacketPool>,
    packet: Mutex<PacketData>,
}

impl Drop for PooledPacket {
    fn drop(&mut self) {
        // dropping the packet data releases its buffer slice
        if let Some(pool) = self.pool.upgrade() {
            pool.release();
        }
    }
}

/// Shared handle to a checked-out packet.
#[derive(Clone)]
pub struct PacketHandle(Arc<PooledPacket>);

impl PacketHandle {
    pub fn add_flags(&self, flags: PacketFlags) {
        self.0.packet.lock().unwrap().flags |= flags;
    }

    pub fn flags(&self) -> PacketFlags {
        self.0.packet.lock().unwrap().flags
    }

    pub fn set_src_addr(&self, addr: Address) {
        self.0.packet.lock().unwrap().src_addr = addr;
    }

    pub fn src_addr(&self) -> Address {
        self.0.packet.lock().unwrap().src_addr
    }

    pub fn set_dst_addr(&self, addr: Address) {
        self.0.packet.lock().unwrap().dst_addr = addr;
    }

    pub fn dst_addr(&self) -> Address {
        self.0.packet.lock().unwrap().dst_addr
    }

    pub fn set_data(&self, data: BufferSlice) {
        self.0.packet.lock().unwrap().data = Some(data);
    }

    pub fn data(&self) -> Option<BufferSlice> {
        self.0.packet.lock().unwrap().data.clone()
    }
}

/// Downstream consumer of received packets. `write` is fire-and-forget: the sink takes
///  ownership of the packet, and with it the underlying buffer slice.
#[cfg_attr(test, mockall::automock)]
pub trait PacketSink: Send + Sync {
    fn write(&self, packet: PacketHandle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;

    #[test]
    fn test_checkout_and_return() {
        let pool = PacketPool::new(2);
        assert_eq!(pool.outstanding(), 0);

        let packet = pool.checkout().unwrap();
        assert_eq!(pool.outstanding(), 1);

        drop(packet);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let pool = PacketPool::new(1);

        let packet = pool.checkout().unwrap();
        assert!(pool.checkout().is_none());

        drop(packet);
        assert!(pool.checkout().is_some());
    }

    #[test]
    fn test_empty_pool() {
        let pool = PacketPool::new(0);
        assert!(pool.checkout().is_none());
    }

    #[test]
    fn test_fresh_packet_is_blank() {
        let pool = PacketPool::new(1);
        let packet = pool.checkout().unwrap();

        assert_eq!(packet.flags(), PacketFlags::empty());
        assert!(packet.src_addr().is_empty());
        assert!(packet.dst_addr().is_empty());
        assert!(packet.data().is_none());
    }

    #[test]
    fn test_setters() {
        let pool = PacketPool::new(1);
        let packet = pool.checkout().unwrap();

        packet.add_flags(PacketFlags::UDP);
        packet.set_src_addr("1.2.3.4:1000".parse::<std::net::SocketAddr>().unwrap().into());
        packet.set_dst_addr("5.6.7.8:2000".parse::<std::net::SocketAddr>().unwrap().into());

        assert_eq!(packet.flags(), PacketFlags::UDP);
        assert_eq!(packet.src_addr().to_string(), "1.2.3.4:1000");
        assert_eq!(packet.dst_addr().to_string(), "5.6.7.8:2000");
    }

    #[test]
    fn test_dropping_packet_releases_buffer_slice() {
        let buffer_pool = BufferPool::new(100, 1);
        let packet_pool = PacketPool::new(1);

        let buffer = buffer_pool.checkout().unwrap();
        buffer.with_data_mut(|data| data[..2].copy_from_slice(b"hi"));

        let packet = packet_pool.checkout().unwrap();
        packet.set_data(buffer.slice(0, 2));
        drop(buffer);

        assert_eq!(buffer_pool.outstanding(), 1);
        assert_eq!(packet.data().unwrap().to_vec(), b"hi");

        drop(packet);
        assert_eq!(buffer_pool.outstanding(), 0);
        assert_eq!(packet_pool.outstanding(), 0);
    }
}
