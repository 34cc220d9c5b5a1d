use crate::transport::{Completion, Status};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::io;
use std::ops::Range;

#[derive(Debug)]
struct RecvWr {
    wr_id: u64,
    range: Range<usize>,
}

/// Receive buffer, posted receives and reaped-but-unpolled send completions of one endpoint.
#[derive(Debug)]
pub(crate) struct WorkQueues {
    recv_buf: BytesMut,
    posted: VecDeque<RecvWr>,
    recv_depth: usize,
    send_cq: VecDeque<Completion>,
}

impl WorkQueues {
    pub(crate) fn new(recv_buf_size: usize, recv_depth: usize) -> Self {
        Self {
            recv_buf: BytesMut::zeroed(recv_buf_size),
            posted: VecDeque::with_capacity(recv_depth),
            recv_depth,
            send_cq: VecDeque::new(),
        }
    }

    pub(crate) fn post_receive(&mut self, range: Range<usize>, wr_id: u64) -> io::Result<()> {
        if range.start > range.end || range.end > self.recv_buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Receive range {range:?} outside of {} byte buffer",
                    self.recv_buf.len()
                ),
            ));
        }
        if self.posted.len() >= self.recv_depth {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("Receive queue full ({} posted)", self.recv_depth),
            ));
        }
        self.posted.push_back(RecvWr { wr_id, range });
        Ok(())
    }

    pub(crate) fn has_posted_receive(&self) -> bool {
        !self.posted.is_empty()
    }

    /// Lands `payload` in the oldest posted receive, if any.
    pub(crate) fn complete_receive(&mut self, payload: &[u8]) -> Option<Completion> {
        let wr = self.posted.pop_front()?;
        let len = wr.range.len();
        if payload.len() > len {
            return Some(Completion {
                wr_id: wr.wr_id,
                byte_len: payload.len(),
                status: Status::LocalLengthError,
            });
        }
        self.recv_buf[wr.range.start..wr.range.start + payload.len()].copy_from_slice(payload);
        Some(Completion {
            wr_id: wr.wr_id,
            byte_len: payload.len(),
            status: Status::Success,
        })
    }

    pub(crate) fn signal_send(&mut self, wr_id: u64, byte_len: usize) {
        self.send_cq.push_back(Completion {
            wr_id,
            byte_len,
            status: Status::Success,
        });
    }

    pub(crate) fn poll_sends<'c>(&mut self, completions: &'c mut [Completion]) -> &'c mut [Completion] {
        let mut n = 0;
        while n < completions.len() {
            let Some(completion) = self.send_cq.pop_front() else {
                break;
            };
            completions[n] = completion;
            n += 1;
        }
        &mut completions[..n]
    }

    pub(crate) fn recv_buf(&self) -> &[u8] {
        &self.recv_buf
    }
}
