use crate::identity::Topology;
use crate::{DEFAULT_QUEUE_KEY, DEFAULT_RECV_BUF_SIZE, K_512, MAX_POSTLIST};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-thread launch parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadParams {
    /// Global identity of the thread.
    pub id: usize,
    /// Threads per machine.
    pub num_threads: usize,
    pub dual_port: bool,
    /// Request payload size in bytes.
    pub size: usize,
    /// Window size.
    pub postlist: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    pub machine_id: usize,
    pub num_threads: usize,
    pub server_threads: usize,
    pub dual_port: bool,
    pub size: usize,
    pub postlist: usize,
    pub recv_buf_size: usize,
    pub queue_key: u32,
    pub threshold: usize,
    pub retry_interval_ms: u64,
    pub max_lookup_attempts: Option<usize>,
    pub completion_timeout_ms: Option<u64>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            machine_id: 0,
            num_threads: 1,
            server_threads: 1,
            dual_port: false,
            size: 32,
            postlist: 16,
            recv_buf_size: DEFAULT_RECV_BUF_SIZE,
            queue_key: DEFAULT_QUEUE_KEY,
            threshold: K_512,
            retry_interval_ms: 200,
            max_lookup_attempts: None,
            completion_timeout_ms: None,
        }
    }
}

impl BenchConfig {
    pub fn from_json_file(path: &Path) -> io::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        serde_json::from_reader(reader).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse config {}: {}", path.display(), e),
            )
        })
    }

    pub fn validate(&self) -> io::Result<()> {
        let invalid = |msg: String| Err(io::Error::new(io::ErrorKind::InvalidInput, msg));

        if self.num_threads == 0 {
            return invalid("num_threads must be > 0".into());
        }
        if self.server_threads == 0 {
            return invalid("server_threads must be > 0".into());
        }
        if !(1..=MAX_POSTLIST).contains(&self.postlist) {
            return invalid(format!(
                "postlist {} outside of 1..={MAX_POSTLIST}",
                self.postlist
            ));
        }
        if self.size > self.recv_buf_size {
            return invalid(format!(
                "size {} exceeds recv_buf_size {}",
                self.size, self.recv_buf_size
            ));
        }
        if self.threshold == 0 {
            return invalid("threshold must be > 0".into());
        }
        Ok(())
    }

    pub fn topology(&self) -> Topology {
        Topology {
            threads_per_machine: self.num_threads,
            server_threads: self.server_threads,
            dual_port: self.dual_port,
        }
    }

    /// Parameters of every thread on this machine.
    pub fn thread_params(&self) -> impl Iterator<Item = ThreadParams> + '_ {
        (0..self.num_threads).map(|i| ThreadParams {
            id: self.machine_id * self.num_threads + i,
            num_threads: self.num_threads,
            dual_port: self.dual_port,
            size: self.size,
            postlist: self.postlist,
        })
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
    /// In-process fabric with one reflector per server thread.
    Loopback,
}

#[derive(Debug, clap::Args)]
pub struct ClientCLI {
    /// JSON file with `BenchConfig` fields. Flags override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = TransportKind::Udp)]
    pub transport: TransportKind,

    /// Directory server address (udp transport).
    #[arg(long, default_value_t = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 18515))]
    pub directory: SocketAddr,

    /// Local address of each port, in port order (udp transport).
    #[arg(long = "interface", default_values_t = [IpAddr::V4(Ipv4Addr::LOCALHOST)])]
    pub interfaces: Vec<IpAddr>,

    #[arg(long)]
    pub base_port: Option<u16>,

    #[arg(long)]
    pub machine_id: Option<usize>,

    #[arg(long)]
    pub num_threads: Option<usize>,

    #[arg(long)]
    pub server_threads: Option<usize>,

    #[arg(long)]
    pub dual_port: Option<bool>,

    #[arg(short, long)]
    pub size: Option<usize>,

    #[arg(short, long)]
    pub postlist: Option<usize>,

    #[arg(long)]
    pub recv_buf_size: Option<usize>,

    #[arg(long)]
    pub queue_key: Option<u32>,

    #[arg(long)]
    pub max_lookup_attempts: Option<usize>,

    #[arg(long)]
    pub completion_timeout_ms: Option<u64>,
}

impl ClientCLI {
    /// Loads the config file, if any, applies flags on top and validates the result.
    pub fn bench_config(&self) -> io::Result<BenchConfig> {
        let mut config = match &self.config {
            Some(path) => BenchConfig::from_json_file(path)?,
            None => BenchConfig::default(),
        };

        macro_rules! apply {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field {
                    config.$field = value;
                })*
            };
        }
        apply!(
            machine_id,
            num_threads,
            server_threads,
            dual_port,
            size,
            postlist,
            recv_buf_size,
            queue_key
        );
        if self.max_lookup_attempts.is_some() {
            config.max_lookup_attempts = self.max_lookup_attempts;
        }
        if self.completion_timeout_ms.is_some() {
            config.completion_timeout_ms = self.completion_timeout_ms;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        client: ClientCLI,
    }

    #[test]
    fn thread_ids_are_offset_by_machine() {
        let config = BenchConfig {
            machine_id: 2,
            num_threads: 3,
            ..BenchConfig::default()
        };
        let ids: Vec<_> = config.thread_params().map(|p| p.id).collect();
        assert_eq!(ids, vec![6, 7, 8]);
    }

    #[test]
    fn default_config_is_valid() {
        BenchConfig::default().validate().unwrap();
    }

    #[test]
    fn oversized_postlist_is_rejected() {
        let config = BenchConfig {
            postlist: MAX_POSTLIST + 1,
            ..BenchConfig::default()
        };
        assert_eq!(
            config.validate().unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn payload_larger_than_receive_buffer_is_rejected() {
        let config = BenchConfig {
            size: 8192,
            recv_buf_size: 4096,
            ..BenchConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_fields_default_when_missing() {
        let config: BenchConfig = serde_json::from_str(r#"{"postlist": 4, "dual_port": true}"#).unwrap();
        assert_eq!(config.postlist, 4);
        assert!(config.dual_port);
        assert_eq!(config.size, BenchConfig::default().size);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = TestCli::parse_from(["test", "--postlist", "8", "--size", "64", "--dual-port", "true"]);
        let config = cli.client.bench_config().unwrap();
        assert_eq!(config.postlist, 8);
        assert_eq!(config.size, 64);
        assert!(config.dual_port);
        assert_eq!(cli.client.interfaces, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    }
}
