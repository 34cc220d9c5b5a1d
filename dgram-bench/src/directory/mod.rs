//! Endpoint directory: the shared name service peers rendezvous through.

mod tcp;

use crate::identity::EndpointName;
use crate::transport::EndpointInfo;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;

pub use tcp::{DirectoryServer, TcpDirectory};

pub trait Directory: Send + Sync {
    fn publish(&self, name: &EndpointName, info: &EndpointInfo) -> io::Result<()>;

    /// `Ok(None)` until something was published under `name`.
    fn lookup(&self, name: &EndpointName) -> io::Result<Option<EndpointInfo>>;
}

impl<D: Directory + ?Sized> Directory for Arc<D> {
    fn publish(&self, name: &EndpointName, info: &EndpointInfo) -> io::Result<()> {
        (**self).publish(name, info)
    }

    fn lookup(&self, name: &EndpointName) -> io::Result<Option<EndpointInfo>> {
        (**self).lookup(name)
    }
}

/// Process-local directory. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    entries: Arc<DashMap<EndpointName, EndpointInfo>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Directory for MemoryDirectory {
    fn publish(&self, name: &EndpointName, info: &EndpointInfo) -> io::Result<()> {
        self.entries.insert(name.clone(), *info);
        Ok(())
    }

    fn lookup(&self, name: &EndpointName) -> io::Result<Option<EndpointInfo>> {
        Ok(self.entries.get(name).map(|entry| *entry.value()))
    }
}
