use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of the physical port an endpoint is bound to.
pub type PortIndex = u8;

/// How client and server threads are laid out across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub threads_per_machine: usize,
    pub server_threads: usize,
    pub dual_port: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    global_id: usize,
    local_slot: usize,
}

impl ClientIdentity {
    pub fn new(global_id: usize, threads_per_machine: usize) -> Self {
        assert!(threads_per_machine > 0, "threads_per_machine must be > 0");
        Self {
            global_id,
            local_slot: global_id % threads_per_machine,
        }
    }

    pub fn global_id(&self) -> usize {
        self.global_id
    }

    /// Slot of the client among the threads of its machine.
    pub fn local_slot(&self) -> usize {
        self.local_slot
    }

    pub fn name(&self) -> EndpointName {
        EndpointName::new(Role::Client, self.global_id)
    }

    pub fn server(&self, topology: &Topology) -> ServerIdentity {
        ServerIdentity::for_client(self, topology)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerIdentity {
    global_id: usize,
}

impl ServerIdentity {
    pub fn for_client(client: &ClientIdentity, topology: &Topology) -> Self {
        assert!(topology.server_threads > 0, "server_threads must be > 0");
        Self {
            global_id: client.global_id % topology.server_threads,
        }
    }

    pub fn global_id(&self) -> usize {
        self.global_id
    }

    pub fn name(&self) -> EndpointName {
        EndpointName::new(Role::Server, self.global_id)
    }

    /// Even servers sit behind port 0 and odd ones behind port 1 in dual-port mode.
    pub fn port(&self, topology: &Topology) -> PortIndex {
        if topology.dual_port {
            (self.global_id % 2) as PortIndex
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Directory key of an endpoint, rendered as `<role>-<global_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointName(String);

impl EndpointName {
    pub fn new(role: Role, global_id: usize) -> Self {
        Self(format!("{role}-{global_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EndpointName {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl fmt::Display for EndpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
