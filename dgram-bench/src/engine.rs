//! Pipelined request/response loop.
//!
//! Each window posts `postlist` receives and a chain of `postlist` sends to the
//! server, then waits for one send completion and `postlist` receive completions.
//! Only the first send of a window is signaled: its completion stands for the
//! whole chain. That relies on the transport accepting a chained batch in order;
//! a transport without that guarantee has to signal and poll every send.

use crate::StopSignal;
use crate::rendezvous::Session;
use crate::sampler::{Sample, ThroughputSampler};
use crate::transport::{Completion, Endpoint, Queue, SendWr, await_completions};
use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

/// Request payload of a client: `size` copies of the low byte of its global id.
pub fn request_buffer(global_id: usize, size: usize) -> Bytes {
    let mut buf = BytesMut::zeroed(size);
    buf.fill(global_id as u8);
    buf.freeze()
}

pub struct Engine<E: Endpoint> {
    session: Session<E>,
    request: Bytes,
    postlist: usize,
    recv_len: usize,
    completion_timeout: Option<Duration>,
    completions: Vec<Completion>,
    windows: u64,
    sampler: ThroughputSampler,
}

impl<E: Endpoint> Engine<E> {
    pub fn new(
        session: Session<E>,
        request: Bytes,
        postlist: usize,
        sampler: ThroughputSampler,
    ) -> Self {
        assert!(postlist > 0, "postlist must be > 0");
        let recv_len = session.endpoint.recv_buf().len();
        Self {
            session,
            request,
            postlist,
            recv_len,
            completion_timeout: None,
            completions: vec![Completion::default(); postlist],
            windows: 0,
            sampler,
        }
    }

    /// Bounds each completion wait. Waits forever by default.
    pub fn with_completion_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn session(&self) -> &Session<E> {
        &self.session
    }

    pub fn sampler(&self) -> &ThroughputSampler {
        &self.sampler
    }

    pub fn windows(&self) -> u64 {
        self.windows
    }

    pub fn round_trips(&self) -> u64 {
        self.windows * self.postlist as u64
    }

    /// Runs one full window.
    pub fn step(&mut self) -> io::Result<Option<Sample>> {
        self.window(None)
    }

    fn window(&mut self, stop: Option<&StopSignal>) -> io::Result<Option<Sample>> {
        let Session {
            endpoint,
            ah,
            remote,
            ..
        } = &mut self.session;

        let mut wrs = Vec::with_capacity(self.postlist);
        for w in 0..self.postlist {
            // The response to slot w must find a receive posted before its send.
            endpoint.post_receive(0..self.recv_len, w as u64)?;
            wrs.push(SendWr {
                wr_id: w as u64,
                ah: &*ah,
                remote_id: remote.endpoint_id,
                remote_qkey: remote.queue_key,
                payload: &self.request,
                signaled: w == 0,
                inline: true,
            });
        }

        endpoint.post_send(&wrs).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!(
                    "post_send of {} WRs failed in window {}: {e}",
                    self.postlist, self.windows
                ),
            )
        })?;
        drop(wrs);

        await_completions(
            endpoint,
            Queue::Send,
            1,
            &mut self.completions,
            self.completion_timeout,
            stop,
        )?;
        await_completions(
            endpoint,
            Queue::Recv,
            self.postlist,
            &mut self.completions,
            self.completion_timeout,
            stop,
        )?;

        self.windows += 1;
        Ok(self.sampler.record(self.postlist))
    }

    /// Runs windows until `stop` is set and returns the number of completed round trips.
    ///
    /// A new window is only started while `stop` is clear. A window that is
    /// already waiting gives up its outstanding completions once `stop` is set;
    /// it does not count as a completed window. Any other failure ends the loop.
    #[instrument(skip_all, fields(postlist = self.postlist, size = self.request.len()))]
    pub fn run(&mut self, stop: &StopSignal) -> io::Result<u64> {
        debug!(server = self.session.server.global_id(), "Exchange loop started");
        while !stop.is_stopped() {
            match self.window(Some(stop)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    debug!(windows = self.windows, "Outstanding window abandoned on stop");
                    break;
                }
                Err(e) => {
                    error!(error = %e, windows = self.windows, "Exchange loop aborted");
                    return Err(e);
                }
            }
        }
        info!(round_trips = self.round_trips(), "Exchange loop stopped");
        Ok(self.round_trips())
    }
}
