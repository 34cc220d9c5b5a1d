use crate::StopSignal;
use crate::config::{BenchConfig, ThreadParams};
use crate::directory::Directory;
use crate::engine::{Engine, request_buffer};
use crate::identity::{ClientIdentity, Topology};
use crate::rendezvous::Rendezvous;
use crate::sampler::ThroughputSampler;
use crate::transport::Provider;
use std::sync::Arc;
use std::{io, thread};
use tracing::{error, info, instrument};

/// One benchmark client: rendezvous with its server, then pipeline requests until stopped.
#[derive(Debug, Clone)]
pub struct Client {
    params: ThreadParams,
    config: Arc<BenchConfig>,
}

impl Client {
    pub fn new(params: ThreadParams, config: Arc<BenchConfig>) -> Self {
        Self { params, config }
    }

    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::new(self.params.id, self.params.num_threads)
    }

    pub fn topology(&self) -> Topology {
        Topology {
            threads_per_machine: self.params.num_threads,
            server_threads: self.config.server_threads,
            dual_port: self.params.dual_port,
        }
    }

    /// Returns the number of completed round trips once `stop` is set.
    #[instrument(skip_all, fields(client = self.params.id), err)]
    pub fn run<P: Provider, D: Directory + ?Sized>(
        &self,
        provider: &P,
        directory: &D,
        stop: &StopSignal,
    ) -> io::Result<u64> {
        let identity = self.identity();
        let request = request_buffer(identity.global_id(), self.params.size);

        let session = Rendezvous::new(identity, self.topology())
            .with_recv_buf_size(self.config.recv_buf_size)
            .with_retry_interval(self.config.retry_interval())
            .with_max_attempts(self.config.max_lookup_attempts)
            .establish(provider, directory, stop)?;

        let sampler = ThroughputSampler::new(identity.global_id(), self.config.threshold);
        Engine::new(session, request, self.params.postlist, sampler)
            .with_completion_timeout(self.config.completion_timeout())
            .run(stop)
    }
}

/// Spawns one thread per client of this machine and waits for all of them.
///
/// A fatal error in any client stops the others; the first error is returned.
pub fn launch<P, D>(
    config: BenchConfig,
    provider: Arc<P>,
    directory: Arc<D>,
    stop: StopSignal,
) -> io::Result<u64>
where
    P: Provider + 'static,
    D: Directory + ?Sized + 'static,
{
    let config = Arc::new(config);
    let handles = config
        .thread_params()
        .map(|params| {
            let client = Client::new(params, config.clone());
            let provider = provider.clone();
            let directory = directory.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("client-{}", params.id))
                .spawn(move || match client.run(&*provider, &*directory, &stop) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
                    Err(e) => {
                        error!(client = params.id, error = %e, "Client failed");
                        stop.stop();
                        Err(e)
                    }
                    ok => ok,
                })
        })
        .collect::<io::Result<Vec<_>>>()?;
    info!(clients = handles.len(), "Clients started");

    let mut round_trips = 0;
    let mut failure = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(n)) => round_trips += n,
            Ok(Err(e)) => {
                failure.get_or_insert(e);
            }
            Err(_) => {
                stop.stop();
                failure.get_or_insert(io::Error::new(
                    io::ErrorKind::Other,
                    "Client thread panicked",
                ));
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(round_trips),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_QUEUE_KEY;
    use crate::directory::MemoryDirectory;
    use crate::identity::{EndpointName, Role};
    use crate::transport::loopback::LOOPBACK_LOCATOR;
    use crate::transport::{EndpointInfo, LoopbackFabric, LoopbackProvider};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn launched_clients_run_until_stopped() {
        let config = BenchConfig {
            num_threads: 3,
            server_threads: 2,
            postlist: 4,
            threshold: 64,
            ..BenchConfig::default()
        };
        let fabric = LoopbackFabric::new();
        let directory = Arc::new(MemoryDirectory::new());
        for server in 0..config.server_threads {
            directory
                .publish(
                    &EndpointName::new(Role::Server, server),
                    &fabric.add_reflector(DEFAULT_QUEUE_KEY),
                )
                .unwrap();
        }

        let stop = StopSignal::new();
        let stopper = {
            let stop = stop.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                stop.stop();
            })
        };
        let round_trips = launch(
            config,
            Arc::new(LoopbackProvider::new(fabric)),
            directory.clone(),
            stop,
        )
        .unwrap();
        stopper.join().unwrap();

        assert!(round_trips > 0);
        assert_eq!(round_trips % 4, 0);
        for client in 0..3 {
            let name = EndpointName::new(Role::Client, client);
            assert!(directory.lookup(&name).unwrap().is_some());
        }
    }

    #[test]
    fn failing_client_stops_the_others() {
        let config = BenchConfig {
            num_threads: 2,
            server_threads: 2,
            size: 64,
            ..BenchConfig::default()
        };
        let fabric = LoopbackFabric::new();
        let directory = Arc::new(MemoryDirectory::new());
        for server in 0..2 {
            directory
                .publish(
                    &EndpointName::new(Role::Server, server),
                    &fabric.add_reflector(DEFAULT_QUEUE_KEY),
                )
                .unwrap();
        }

        let provider = LoopbackProvider::new(fabric).with_max_inline(16);
        let err = launch(config, Arc::new(provider), directory, StopSignal::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn waiting_clients_exit_cleanly_on_stop() {
        let stop = StopSignal::new();
        stop.stop();
        let round_trips = launch(
            BenchConfig::default(),
            Arc::new(LoopbackProvider::new(LoopbackFabric::new())),
            Arc::new(MemoryDirectory::new()),
            stop,
        )
        .unwrap();
        assert_eq!(round_trips, 0);
    }

    #[test]
    fn stop_releases_clients_stalled_on_lost_responses() {
        let directory = Arc::new(MemoryDirectory::new());
        directory
            .publish(
                &EndpointName::new(Role::Server, 0),
                &EndpointInfo {
                    locator: LOOPBACK_LOCATOR,
                    endpoint_id: u32::MAX,
                    queue_key: DEFAULT_QUEUE_KEY,
                },
            )
            .unwrap();

        let stop = StopSignal::new();
        let (tx, rx) = mpsc::channel();
        {
            let stop = stop.clone();
            thread::spawn(move || {
                let result = launch(
                    BenchConfig::default(),
                    Arc::new(LoopbackProvider::new(LoopbackFabric::new())),
                    directory,
                    stop,
                );
                let _ = tx.send(result);
            });
        }

        thread::sleep(Duration::from_millis(100));
        stop.stop();
        let round_trips = rx
            .recv_timeout(Duration::from_secs(3))
            .expect("launch must return after stop")
            .unwrap();
        assert_eq!(round_trips, 0);
    }
}

