#![allow(dead_code)]

use dgram_bench::directory::Directory;
use dgram_bench::identity::{EndpointName, PortIndex};
use dgram_bench::transport::{
    Completion, Endpoint, EndpointInfo, Provider, Queue, SendWr,
};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PostRecv { wr_id: u64 },
    PostSend { signaled: Vec<bool> },
}

/// Endpoint that records every post and answers each send with one response.
#[derive(Debug)]
pub struct RecordingEndpoint {
    pub events: Vec<Event>,
    fail_on_batch: Option<usize>,
    batches: usize,
    posted: VecDeque<u64>,
    responses: usize,
    send_cq: VecDeque<Completion>,
    recv_buf: Vec<u8>,
}

impl RecordingEndpoint {
    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn outstanding_receives(&self) -> usize {
        self.posted.len()
    }
}

impl Endpoint for RecordingEndpoint {
    type AddressHandle = ();

    fn info(&self) -> EndpointInfo {
        EndpointInfo {
            locator: IpAddr::V4(Ipv4Addr::LOCALHOST),
            endpoint_id: 1,
            queue_key: 1,
        }
    }

    fn port(&self) -> PortIndex {
        0
    }

    fn create_ah(&self, _remote: &EndpointInfo) -> io::Result<()> {
        Ok(())
    }

    fn post_receive(&mut self, _range: Range<usize>, wr_id: u64) -> io::Result<()> {
        self.events.push(Event::PostRecv { wr_id });
        self.posted.push_back(wr_id);
        Ok(())
    }

    fn post_send(&mut self, wrs: &[SendWr<'_, ()>]) -> io::Result<()> {
        self.batches += 1;
        self.events.push(Event::PostSend {
            signaled: wrs.iter().map(|wr| wr.signaled).collect(),
        });
        if self.fail_on_batch == Some(self.batches) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("simulated rejection of batch {}", self.batches),
            ));
        }
        for wr in wrs {
            if wr.signaled {
                self.send_cq.push_back(Completion {
                    wr_id: wr.wr_id,
                    byte_len: wr.payload.len(),
                    ..Completion::default()
                });
            }
        }
        self.responses += wrs.len();
        Ok(())
    }

    fn poll<'c>(
        &mut self,
        queue: Queue,
        completions: &'c mut [Completion],
    ) -> io::Result<&'c mut [Completion]> {
        let mut n = 0;
        while n < completions.len() {
            let completion = match queue {
                Queue::Send => match self.send_cq.pop_front() {
                    Some(completion) => completion,
                    None => break,
                },
                Queue::Recv => {
                    if self.responses == 0 {
                        break;
                    }
                    let Some(wr_id) = self.posted.pop_front() else {
                        break;
                    };
                    self.responses -= 1;
                    Completion {
                        wr_id,
                        ..Completion::default()
                    }
                }
            };
            completions[n] = completion;
            n += 1;
        }
        Ok(&mut completions[..n])
    }

    fn recv_buf(&self) -> &[u8] {
        &self.recv_buf
    }
}

#[derive(Debug, Default)]
pub struct RecordingProvider {
    pub fail_on_batch: Option<usize>,
}

impl Provider for RecordingProvider {
    type Endpoint = RecordingEndpoint;

    fn create_endpoint(
        &self,
        _local_slot: usize,
        _port: PortIndex,
        recv_buf_size: usize,
    ) -> io::Result<RecordingEndpoint> {
        Ok(RecordingEndpoint {
            events: Vec::new(),
            fail_on_batch: self.fail_on_batch,
            batches: 0,
            posted: VecDeque::new(),
            responses: 0,
            send_cq: VecDeque::new(),
            recv_buf: vec![0; recv_buf_size],
        })
    }
}

/// Directory that reports `misses` empty lookups before answering.
#[derive(Debug)]
pub struct FlakyDirectory {
    pub info: EndpointInfo,
    misses: AtomicUsize,
    pub lookups: AtomicUsize,
}

impl FlakyDirectory {
    pub fn new(info: EndpointInfo, misses: usize) -> Self {
        Self {
            info,
            misses: AtomicUsize::new(misses),
            lookups: AtomicUsize::new(0),
        }
    }
}

impl Directory for FlakyDirectory {
    fn publish(&self, _name: &EndpointName, _info: &EndpointInfo) -> io::Result<()> {
        Ok(())
    }

    fn lookup(&self, _name: &EndpointName) -> io::Result<Option<EndpointInfo>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let remaining = self.misses.load(Ordering::SeqCst);
        if remaining > 0 {
            self.misses.store(remaining - 1, Ordering::SeqCst);
            // Alternate between absence and failure, both must be retried.
            if remaining % 2 == 0 {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "directory down"));
            }
            return Ok(None);
        }
        Ok(Some(self.info))
    }
}

pub fn server_info() -> EndpointInfo {
    EndpointInfo {
        locator: IpAddr::V4(Ipv4Addr::LOCALHOST),
        endpoint_id: 4242,
        queue_key: 1,
    }
}
