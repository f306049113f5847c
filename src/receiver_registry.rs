use crate::udp_receiver::UdpReceiver;
use std::sync::{Arc, Mutex};

/// Owning container for receivers. A receiver is linked into at most one registry at a
///  time; unlinking happens either synchronously through `UdpReceiver::remove()` or
///  deferred from the close-completion callback once asynchronous shutdown finished.
pub struct ReceiverRegistry {
    receivers: Mutex<Vec<Arc<UdpReceiver>>>,
}

impl ReceiverRegistry {
    pub fn new() -> Arc<ReceiverRegistry> {
        Arc::new(ReceiverRegistry {
            receivers: Mutex::new(Vec::new()),
        })
    }

    pub fn insert(&self, receiver: Arc<UdpReceiver>) {
        self.receivers.lock().unwrap().push(receiver);
    }

    /// Remove by identity. Returns whether the receiver was present.
    pub fn remove(&self, receiver: &UdpReceiver) -> bool {
        let mut receivers = self.receivers.lock().unwrap();
        let len_before = receivers.len();
        receivers.retain(|r| !std::ptr::eq(Arc::as_ptr(r), receiver));
        receivers.len() != len_before
    }

    pub fn contains(&self, receiver: &UdpReceiver) -> bool {
        self.receivers
            .lock()
            .unwrap()
            .iter()
            .any(|r| std::ptr::eq(Arc::as_ptr(r), receiver))
    }

    pub fn len(&self) -> usize {
        self.receivers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
