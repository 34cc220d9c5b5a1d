//! Datagram transport seam.
//!
//! An [`Endpoint`] mirrors an unreliable-datagram queue pair: receives are posted
//! into a buffer the endpoint owns, sends are submitted as one chained batch, and
//! completions are reaped by polling a send or a receive queue. Only sends that
//! were posted as signaled produce a send completion.

pub mod loopback;
mod queues;
pub mod udp;

use crate::StopSignal;
use crate::identity::PortIndex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::ops::Range;
use std::time::{Duration, Instant};
use std::{fmt, hint, io};

pub use loopback::{LoopbackFabric, LoopbackProvider};
pub use udp::UdpProvider;

/// Addressing record published in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub locator: IpAddr,
    pub endpoint_id: u32,
    pub queue_key: u32,
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} (qkey {:#x})",
            self.locator, self.endpoint_id, self.queue_key
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Success,
    /// Inbound message did not fit into the posted receive.
    LocalLengthError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    pub wr_id: u64,
    pub byte_len: usize,
    pub status: Status,
}

impl Completion {
    pub fn is_valid(&self) -> bool {
        self.status == Status::Success
    }

    pub fn error(&self) -> Option<Status> {
        (!self.is_valid()).then_some(self.status)
    }
}

/// One send work request of a chained batch.
#[derive(Debug)]
pub struct SendWr<'a, A> {
    pub wr_id: u64,
    pub ah: &'a A,
    pub remote_id: u32,
    pub remote_qkey: u32,
    pub payload: &'a [u8],
    pub signaled: bool,
    /// Payload is copied into the work request at submission time.
    pub inline: bool,
}

pub trait Provider: Send + Sync {
    type Endpoint: Endpoint;

    fn create_endpoint(
        &self,
        local_slot: usize,
        port: PortIndex,
        recv_buf_size: usize,
    ) -> io::Result<Self::Endpoint>;
}

pub trait Endpoint: Send {
    /// Reusable route to a remote endpoint.
    type AddressHandle: fmt::Debug + Send;

    fn info(&self) -> EndpointInfo;

    fn port(&self) -> PortIndex;

    fn create_ah(&self, remote: &EndpointInfo) -> io::Result<Self::AddressHandle>;

    /// Posts a receive landing in `range` of the endpoint's receive buffer.
    fn post_receive(&mut self, range: Range<usize>, wr_id: u64) -> io::Result<()>;

    /// Submits the whole batch in one call. A rejected batch is reported as an error.
    fn post_send(&mut self, wrs: &[SendWr<'_, Self::AddressHandle>]) -> io::Result<()>;

    fn poll<'c>(
        &mut self,
        queue: Queue,
        completions: &'c mut [Completion],
    ) -> io::Result<&'c mut [Completion]>;

    fn recv_buf(&self) -> &[u8];
}

/// Busy-polls `queue` until exactly `n` completions were reaped.
///
/// Never consumes more than `n` completions. Blocks forever unless `timeout` is set
/// or `stop` is raised, which end the wait with `TimedOut` and `Interrupted`.
pub fn await_completions<E: Endpoint>(
    endpoint: &mut E,
    queue: Queue,
    n: usize,
    completions: &mut [Completion],
    timeout: Option<Duration>,
    stop: Option<&StopSignal>,
) -> io::Result<()> {
    assert!(!completions.is_empty(), "completion array must not be empty");
    let deadline = timeout.map(|t| Instant::now() + t);

    let mut remaining = n;
    while remaining > 0 {
        let limit = remaining.min(completions.len());
        for completion in endpoint.poll(queue, &mut completions[..limit])? {
            if let Some(status) = completion.error() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("Work completion error on {queue:?} queue: {status:?} ({completion:?})"),
                ));
            }
            remaining -= 1;
        }

        if remaining > 0 {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("Timed out waiting for {remaining} of {n} {queue:?} completions"),
                    ));
                }
            }
            if stop.is_some_and(StopSignal::is_stopped) {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    format!("Stopped while waiting for {remaining} of {n} {queue:?} completions"),
                ));
            }
            hint::spin_loop();
        }
    }

    Ok(())
}

/// Rejects batches no provider could accept.
fn validate_batch<A>(wrs: &[SendWr<'_, A>], max_inline: usize) -> io::Result<()> {
    if wrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Empty send batch",
        ));
    }
    for wr in wrs {
        if wr.inline && wr.payload.len() > max_inline {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Inline payload of {} bytes exceeds max_inline {} (wr_id {})",
                    wr.payload.len(),
                    max_inline,
                    wr.wr_id
                ),
            ));
        }
    }
    Ok(())
}
