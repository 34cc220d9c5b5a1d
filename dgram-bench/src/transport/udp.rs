//! UDP socket transport.
//!
//! Port index `i` is bound to the `i`-th configured interface address. Every
//! datagram starts with the destination queue key in network byte order; receivers
//! drop datagrams carrying a different key.

use crate::identity::PortIndex;
use crate::transport::queues::WorkQueues;
use crate::transport::{
    Completion, Endpoint, EndpointInfo, Provider, Queue, SendWr, validate_batch,
};
use crate::{DEFAULT_QUEUE_KEY, KI_B, MAX_POSTLIST};
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::ops::Range;
use tracing::{debug, instrument, trace};

pub const UDP_MAX_INLINE: usize = KI_B;
const HEADER_LEN: usize = size_of::<u32>();
const MAX_DATAGRAM: usize = 64 * KI_B;

#[derive(Debug, Clone)]
pub struct UdpProvider {
    interfaces: Vec<IpAddr>,
    base_port: Option<u16>,
    queue_key: u32,
    max_inline: usize,
    recv_depth: usize,
}

impl UdpProvider {
    pub fn new(interfaces: Vec<IpAddr>) -> Self {
        Self {
            interfaces,
            base_port: None,
            queue_key: DEFAULT_QUEUE_KEY,
            max_inline: UDP_MAX_INLINE,
            recv_depth: 2 * MAX_POSTLIST,
        }
    }

    /// Binds endpoints to `base_port + local_slot` instead of an ephemeral port.
    pub fn with_base_port(mut self, base_port: Option<u16>) -> Self {
        self.base_port = base_port;
        self
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

fn bind_port(base_port: Option<u16>, local_slot: usize) -> io::Result<u16> {
    let Some(base) = base_port else {
        return Ok(0);
    };
    u16::try_from(base as usize + local_slot).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Base port {base} + local slot {local_slot} exceeds the UDP port range"),
        )
    })
}

impl Provider for UdpProvider {
    type Endpoint = UdpEndpoint;

    #[instrument(skip(self), err, level = "debug")]
    fn create_endpoint(
        &self,
        local_slot: usize,
        port: PortIndex,
        recv_buf_size: usize,
    ) -> io::Result<UdpEndpoint> {
        let ip = *self.interfaces.get(port as usize).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "No interface configured for port {port} ({} configured)",
                    self.interfaces.len()
                ),
            )
        })?;
        if ip.is_unspecified() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Interface {ip} cannot be published as a locator"),
            ));
        }

        let socket = UdpSocket::bind((ip, bind_port(self.base_port, local_slot)?))?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        debug!(%local, "UDP endpoint bound");

        Ok(UdpEndpoint {
            socket,
            local,
            port,
            queue_key: self.queue_key,
            max_inline: self.max_inline,
            queues: WorkQueues::new(recv_buf_size, self.recv_depth),
            frame: vec![0u8; MAX_DATAGRAM],
            scratch: Vec::with_capacity(HEADER_LEN + self.max_inline),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpAddressHandle {
    ip: IpAddr,
    port: PortIndex,
}

#[derive(Debug)]
pub struct UdpEndpoint {
    socket: UdpSocket,
    local: SocketAddr,
    port: PortIndex,
    queue_key: u32,
    max_inline: usize,
    queues: WorkQueues,
    frame: Vec<u8>,
    scratch: Vec<u8>,
}

impl UdpEndpoint {
    fn check_batch(&self, wrs: &[SendWr<'_, UdpAddressHandle>]) -> io::Result<()> {
        validate_batch(wrs, self.max_inline)?;
        for wr in wrs {
            if wr.ah.port != self.port {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "Address handle for port {} used on port {} (wr_id {})",
                        wr.ah.port, self.port, wr.wr_id
                    ),
                ));
            }
            if u16::try_from(wr.remote_id).is_err() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Remote id {} is not a UDP port (wr_id {})", wr.remote_id, wr.wr_id),
                ));
            }
        }
        Ok(())
    }
}

impl Endpoint for UdpEndpoint {
    type AddressHandle = UdpAddressHandle;

    fn info(&self) -> EndpointInfo {
        EndpointInfo {
            locator: self.local.ip(),
            endpoint_id: self.local.port() as u32,
            queue_key: self.queue_key,
        }
    }

    fn port(&self) -> PortIndex {
        self.port
    }

    fn create_ah(&self, remote: &EndpointInfo) -> io::Result<UdpAddressHandle> {
        if remote.locator.is_ipv4() != self.local.is_ipv4() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} is not reachable from {}", remote.locator, self.local),
            ));
        }
        Ok(UdpAddressHandle {
            ip: remote.locator,
            port: self.port,
        })
    }

    fn post_receive(&mut self, range: Range<usize>, wr_id: u64) -> io::Result<()> {
        self.queues.post_receive(range, wr_id)
    }

    fn post_send(&mut self, wrs: &[SendWr<'_, UdpAddressHandle>]) -> io::Result<()> {
        self.check_batch(wrs)?;

        for wr in wrs {
            self.scratch.clear();
            self.scratch.extend_from_slice(&wr.remote_qkey.to_be_bytes());
            self.scratch.extend_from_slice(wr.payload);

            let dest = SocketAddr::new(wr.ah.ip, wr.remote_id as u16);
            match self.socket.send_to(&self.scratch, dest) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(io::Error::new(
                        io::ErrorKind::OutOfMemory,
                        format!("Send queue full (wr_id {})", wr.wr_id),
                    ));
                }
                Err(e) => {
                    return Err(io::Error::new(
                        e.kind(),
                        format!("Failed to post send to {dest} (wr_id {}): {e}", wr.wr_id),
                    ));
                }
            }
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
        if queue == Queue::Send {
            return Ok(self.queues.poll_sends(completions));
        }

        let mut n = 0;
        while n < completions.len() && self.queues.has_posted_receive() {
            let (len, from) = match self.socket.recv_from(&mut self.frame) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            };
            if len < HEADER_LEN {
                trace!(%from, len, "Dropping runt datagram");
                continue;
            }
            let mut key = [0u8; HEADER_LEN];
            key.copy_from_slice(&self.frame[..HEADER_LEN]);
            if u32::from_be_bytes(key) != self.queue_key {
                trace!(%from, "Dropping datagram with foreign queue key");
                continue;
            }
            if let Some(completion) = self.queues.complete_receive(&self.frame[HEADER_LEN..len]) {
                completions[n] = completion;
                n += 1;
            }
        }
        Ok(&mut completions[..n])
    }

    fn recv_buf(&self) -> &[u8] {
        self.queues.recv_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::await_completions;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn send(from: &mut UdpEndpoint, to: &EndpointInfo, payload: &[u8]) -> io::Result<()> {
        let ah = from.create_ah(to)?;
        from.post_send(&[SendWr {
            wr_id: 0,
            ah: &ah,
            remote_id: to.endpoint_id,
            remote_qkey: to.queue_key,
            payload,
            signaled: true,
            inline: true,
        }])
    }

    #[test]
    fn datagram_lands_in_posted_receive() {
        let provider = UdpProvider::new(vec![LOCALHOST]);
        let mut a = provider.create_endpoint(0, 0, 128).unwrap();
        let mut b = provider.create_endpoint(1, 0, 128).unwrap();

        b.post_receive(0..128, 42).unwrap();
        send(&mut a, &b.info(), &[7u8; 32]).unwrap();

        let mut completions = [Completion::default(); 1];
        await_completions(&mut a, Queue::Send, 1, &mut completions, None, None).unwrap();
        await_completions(
            &mut b,
            Queue::Recv,
            1,
            &mut completions,
            Some(Duration::from_secs(5)),
            None,
        )
        .unwrap();
        assert_eq!(&b.recv_buf()[..32], &[7u8; 32]);
    }

    #[test]
    fn foreign_queue_key_never_completes() {
        let mut a = UdpProvider::new(vec![LOCALHOST])
            .with_queue_key(1)
            .create_endpoint(0, 0, 64)
            .unwrap();
        let mut b = UdpProvider::new(vec![LOCALHOST])
            .with_queue_key(2)
            .create_endpoint(0, 0, 64)
            .unwrap();

        b.post_receive(0..64, 0).unwrap();
        let wrong_key = EndpointInfo {
            queue_key: 1,
            ..b.info()
        };
        send(&mut a, &wrong_key, b"ping").unwrap();

        let mut completions = [Completion::default(); 1];
        let err = await_completions(
            &mut b,
            Queue::Recv,
            1,
            &mut completions,
            Some(Duration::from_millis(100)),
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn oversized_inline_payload_rejects_batch() {
        let provider = UdpProvider::new(vec![LOCALHOST]).with_max_inline(16);
        let mut a = provider.create_endpoint(0, 0, 64).unwrap();
        let b = provider.create_endpoint(1, 0, 64).unwrap();

        let err = send(&mut a, &b.info(), &[0u8; 17]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_interface_is_reported() {
        let provider = UdpProvider::new(vec![LOCALHOST]);
        let err = provider.create_endpoint(0, 1, 64).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn bind_port_offsets_base_by_local_slot() {
        assert_eq!(bind_port(None, 5).unwrap(), 0);
        assert_eq!(bind_port(Some(20000), 5).unwrap(), 20005);
        assert!(bind_port(Some(u16::MAX), 1).is_err());
    }
}
