use crate::directory::Directory;
use crate::identity::{ClientIdentity, PortIndex, ServerIdentity, Topology};
use crate::transport::{Endpoint, EndpointInfo, Provider};
use crate::{DEFAULT_RECV_BUF_SIZE, StopSignal};
use std::time::Duration;
use std::{io, thread};
use tracing::{debug, info, instrument, trace};

pub const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Outcome of polling the directory for the target server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discovery {
    pub info: EndpointInfo,
    /// Lookups that came back empty before the server appeared.
    pub misses: usize,
}

/// Local endpoint plus the resolved, reusable route to the server.
#[derive(Debug)]
pub struct Session<E: Endpoint> {
    pub endpoint: E,
    pub server: ServerIdentity,
    pub remote: EndpointInfo,
    pub ah: E::AddressHandle,
}

#[derive(Debug, Clone)]
pub struct Rendezvous {
    client: ClientIdentity,
    topology: Topology,
    recv_buf_size: usize,
    retry_interval: Duration,
    max_attempts: Option<usize>,
}

impl Rendezvous {
    pub fn new(client: ClientIdentity, topology: Topology) -> Self {
        Self {
            client,
            topology,
            recv_buf_size: DEFAULT_RECV_BUF_SIZE,
            retry_interval: RETRY_INTERVAL,
            max_attempts: None,
        }
    }

    pub fn with_recv_buf_size(mut self, recv_buf_size: usize) -> Self {
        self.recv_buf_size = recv_buf_size;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Gives up after `max_attempts` lookups. Unbounded by default.
    pub fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn server(&self) -> ServerIdentity {
        self.client.server(&self.topology)
    }

    pub fn port(&self) -> PortIndex {
        self.server().port(&self.topology)
    }

    #[instrument(skip_all, fields(client = self.client.global_id()), err)]
    pub fn establish<P: Provider, D: Directory + ?Sized>(
        &self,
        provider: &P,
        directory: &D,
        stop: &StopSignal,
    ) -> io::Result<Session<P::Endpoint>> {
        let server = self.server();
        let endpoint =
            provider.create_endpoint(self.client.local_slot(), self.port(), self.recv_buf_size)?;

        let name = self.client.name();
        directory.publish(&name, &endpoint.info())?;
        info!(
            "Client {} published. Waiting for server {}",
            name,
            server.name()
        );

        let discovery = self.discover(directory, stop)?;
        info!(
            misses = discovery.misses,
            remote = %discovery.info,
            "Client {} found server! Now posting SENDs.",
            name
        );

        let ah = endpoint.create_ah(&discovery.info)?;
        debug!(?ah, "Address handle created");
        Ok(Session {
            endpoint,
            server,
            remote: discovery.info,
            ah,
        })
    }

    /// Polls the directory until the server is published.
    ///
    /// Lookup errors count as misses. Stops with `Interrupted` once `stop` is set
    /// and with `TimedOut` when the attempt budget runs out.
    pub fn discover<D: Directory + ?Sized>(
        &self,
        directory: &D,
        stop: &StopSignal,
    ) -> io::Result<Discovery> {
        let name = self.server().name();
        let mut misses = 0;
        loop {
            if stop.is_stopped() {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    format!("Stopped while waiting for {name}"),
                ));
            }

            match directory.lookup(&name) {
                Ok(Some(info)) => return Ok(Discovery { info, misses }),
                Ok(None) => trace!(%name, misses, "Server not published yet"),
                Err(e) => debug!(%name, error = %e, "Lookup failed"),
            }
            misses += 1;

            if let Some(max) = self.max_attempts {
                if misses >= max {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{name} not published after {misses} lookups"),
                    ));
                }
            }
            thread::sleep(self.retry_interval);
        }
    }
}
