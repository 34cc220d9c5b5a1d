//! In-process datagram fabric.
//!
//! Endpoints exchange datagrams through per-endpoint mailboxes. Delivery is
//! unreliable in the same way a UD queue pair is: datagrams to unknown endpoints
//! or with a foreign queue key are silently dropped. Reflector endpoints bounce
//! every datagram back to its sender and stand in for a remote server.

use crate::identity::PortIndex;
use crate::transport::queues::WorkQueues;
use crate::transport::{
    Completion, Endpoint, EndpointInfo, Provider, Queue, SendWr, validate_batch,
};
use crate::{DEFAULT_QUEUE_KEY, MAX_POSTLIST};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

pub const LOOPBACK_LOCATOR: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const LOOPBACK_MAX_INLINE: usize = 1024;

#[derive(Debug)]
struct Datagram {
    src: u32,
    payload: Bytes,
}

#[derive(Debug)]
struct Mailbox {
    queue_key: u32,
    reflect: bool,
    inbox: Mutex<VecDeque<Datagram>>,
}

impl Mailbox {
    fn push(&self, datagram: Datagram) {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(datagram);
    }

    fn pop(&self) -> Option<Datagram> {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

#[derive(Debug, Default)]
struct Fabric {
    mailboxes: DashMap<u32, Arc<Mailbox>>,
    next_id: AtomicU32,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct LoopbackFabric {
    inner: Arc<Fabric>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an endpoint that echoes every datagram back to its sender.
    pub fn add_reflector(&self, queue_key: u32) -> EndpointInfo {
        let (id, _) = self.register(queue_key, true);
        debug!(id, "Reflector registered");
        EndpointInfo {
            locator: LOOPBACK_LOCATOR,
            endpoint_id: id,
            queue_key,
        }
    }

    /// Number of datagrams lost to unknown destinations or queue key mismatches.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn register(&self, queue_key: u32, reflect: bool) -> (u32, Arc<Mailbox>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mailbox = Arc::new(Mailbox {
            queue_key,
            reflect,
            inbox: Mutex::new(VecDeque::new()),
        });
        self.inner.mailboxes.insert(id, mailbox.clone());
        (id, mailbox)
    }

    fn unregister(&self, id: u32) {
        self.inner.mailboxes.remove(&id);
    }

    fn mailbox(&self, id: u32) -> Option<Arc<Mailbox>> {
        self.inner.mailboxes.get(&id).map(|m| m.value().clone())
    }

    fn deliver(&self, src: u32, dst: u32, queue_key: u32, payload: Bytes) {
        let Some(mailbox) = self.mailbox(dst) else {
            trace!(src, dst, "Dropping datagram to unknown endpoint");
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if mailbox.queue_key != queue_key {
            trace!(src, dst, queue_key, "Dropping datagram with foreign queue key");
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if mailbox.reflect {
            let Some(sender) = self.mailbox(src) else {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            };
            self.deliver(dst, src, sender.queue_key, payload);
        } else {
            mailbox.push(Datagram { src, payload });
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackProvider {
    fabric: LoopbackFabric,
    queue_key: u32,
    max_inline: usize,
    recv_depth: usize,
}

impl LoopbackProvider {
    pub fn new(fabric: LoopbackFabric) -> Self {
        Self {
            fabric,
            queue_key: DEFAULT_QUEUE_KEY,
            max_inline: LOOPBACK_MAX_INLINE,
            recv_depth: 2 * MAX_POSTLIST,
        }
    }

    pub fn with_queue_key(mut self, queue_key: u32) -> Self {
        self.queue_key = queue_key;
        self
    }

    pub fn with_max_inline(mut self, max_inline: usize) -> Self {
        self.max_inline = max_inline;
        self
    }
}

impl Provider for LoopbackProvider {
    type Endpoint = LoopbackEndpoint;

    fn create_endpoint(
        &self,
        local_slot: usize,
        port: PortIndex,
        recv_buf_size: usize,
    ) -> io::Result<LoopbackEndpoint> {
        let (id, mailbox) = self.fabric.register(self.queue_key, false);
        debug!(id, local_slot, port, recv_buf_size, "Loopback endpoint created");
        Ok(LoopbackEndpoint {
            fabric: self.fabric.clone(),
            id,
            mailbox,
            port,
            queue_key: self.queue_key,
            max_inline: self.max_inline,
            queues: WorkQueues::new(recv_buf_size, self.recv_depth),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackAddressHandle {
    port: PortIndex,
}

#[derive(Debug)]
pub struct LoopbackEndpoint {
    fabric: LoopbackFabric,
    id: u32,
    mailbox: Arc<Mailbox>,
    port: PortIndex,
    queue_key: u32,
    max_inline: usize,
    queues: WorkQueues,
}

impl Endpoint for LoopbackEndpoint {
    type AddressHandle = LoopbackAddressHandle;

    fn info(&self) -> EndpointInfo {
        EndpointInfo {
            locator: LOOPBACK_LOCATOR,
            endpoint_id: self.id,
            queue_key: self.queue_key,
        }
    }

    fn port(&self) -> PortIndex {
        self.port
    }

    fn create_ah(&self, remote: &EndpointInfo) -> io::Result<LoopbackAddressHandle> {
        if !remote.locator.is_loopback() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} is not reachable over the loopback fabric", remote.locator),
            ));
        }
        Ok(LoopbackAddressHandle { port: self.port })
    }

    fn post_receive(&mut self, range: Range<usize>, wr_id: u64) -> io::Result<()> {
        self.queues.post_receive(range, wr_id)
    }

    fn post_send(&mut self, wrs: &[SendWr<'_, LoopbackAddressHandle>]) -> io::Result<()> {
        validate_batch(wrs, self.max_inline)?;
        if let Some(wr) = wrs.iter().find(|wr| wr.ah.port != self.port) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Address handle for port {} used on port {} (wr_id {})",
                    wr.ah.port, self.port, wr.wr_id
                ),
            ));
        }

        for wr in wrs {
            self.fabric.deliver(
                self.id,
                wr.remote_id,
                wr.remote_qkey,
                Bytes::copy_from_slice(wr.payload),
            );
            if wr.signaled {
                self.queues.signal_send(wr.wr_id, wr.payload.len());
            }
        }
        Ok(())
    }

    fn poll<'c>(
        &mut self,
        queue: Queue,
        completions: &'c mut [Completion],
    ) -> io::Result<&'c mut [Completion]> {
        match queue {
            Queue::Send => Ok(self.queues.poll_sends(completions)),
            Queue::Recv => {
                let mut n = 0;
                while n < completions.len() && self.queues.has_posted_receive() {
                    let Some(datagram) = self.mailbox.pop() else {
                        break;
                    };
                    trace!(src = datagram.src, len = datagram.payload.len(), "Received");
                    if let Some(completion) = self.queues.complete_receive(&datagram.payload) {
                        completions[n] = completion;
                        n += 1;
                    }
                }
                Ok(&mut completions[..n])
            }
        }
    }

    fn recv_buf(&self) -> &[u8] {
        self.queues.recv_buf()
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.fabric.unregister(self.id);
    }
}
