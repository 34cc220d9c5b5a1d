pub mod client;
pub mod config;
pub mod directory;
pub mod engine;
pub mod identity;
pub mod rendezvous;
pub mod sampler;
pub mod transport;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const KI_B: usize = 1024;

pub const K_512: usize = 512 * KI_B;

pub const MAX_POSTLIST: usize = 64;
pub const DEFAULT_RECV_BUF_SIZE: usize = 4 * KI_B;
pub const DEFAULT_QUEUE_KEY: u32 = 0x1111_1111;

pub const BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard();

/// Cooperative stop flag shared between the launcher and its workers.
///
/// Workers look at it between rendezvous attempts, between windows and while
/// waiting for completions.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
