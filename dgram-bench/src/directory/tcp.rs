use crate::BINCODE_CONFIG;
use crate::directory::{Directory, MemoryDirectory};
use crate::identity::EndpointName;
use crate::transport::EndpointInfo;
use bincode::serde::{decode_from_std_read, encode_into_std_write};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
enum Request {
    Publish {
        name: EndpointName,
        info: EndpointInfo,
    },
    Lookup {
        name: EndpointName,
    },
}

#[derive(Debug, Serialize, Deserialize)]
enum Response {
    Published,
    Found(Option<EndpointInfo>),
}

fn write_msg<T: Serialize, W: io::Write>(writer: &mut W, val: &T) -> io::Result<()> {
    encode_into_std_write(val, writer, BINCODE_CONFIG).map_err(|e| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("Failed to send directory message: {:?}", e),
        )
    })?;
    writer.flush()
}

fn read_msg<T: DeserializeOwned, R: io::Read>(reader: &mut R) -> io::Result<T> {
    decode_from_std_read(reader, BINCODE_CONFIG).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to receive directory message: {:?}", e),
        )
    })
}

/// Client of a [`DirectoryServer`]. Every call uses a fresh connection, so one
/// instance can be shared by all worker threads.
#[derive(Debug, Clone)]
pub struct TcpDirectory {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpDirectory {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn call(&self, request: &Request) -> io::Result<Response> {
        let mut stream = TcpStream::connect_timeout(&self.addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;

        write_msg(&mut stream, request)?;
        read_msg(&mut stream)
    }
}

impl Directory for TcpDirectory {
    fn publish(&self, name: &EndpointName, info: &EndpointInfo) -> io::Result<()> {
        let request = Request::Publish {
            name: name.clone(),
            info: *info,
        };
        match self.call(&request)? {
            Response::Published => Ok(()),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unexpected directory response to publish of {name}: {other:?}"),
            )),
        }
    }

    fn lookup(&self, name: &EndpointName) -> io::Result<Option<EndpointInfo>> {
        let request = Request::Lookup { name: name.clone() };
        match self.call(&request)? {
            Response::Found(info) => Ok(info),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unexpected directory response to lookup of {name}: {other:?}"),
            )),
        }
    }
}

/// Name registry served over TCP, one request per connection.
pub struct DirectoryServer {
    listener: TcpListener,
    entries: MemoryDirectory,
}

impl DirectoryServer {
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            entries: MemoryDirectory::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn serve(&self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "Directory serving requests");
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to accept directory connection");
                    continue;
                }
            };
            let entries = self.entries.clone();
            thread::spawn(move || {
                if let Err(e) = handle(stream, &entries) {
                    warn!(error = %e, "Directory request failed");
                }
            });
        }

        unreachable!()
    }
}

#[instrument(skip_all, fields(peer = ?stream.peer_addr().ok()), level = "debug")]
fn handle(mut stream: TcpStream, entries: &MemoryDirectory) -> io::Result<()> {
    stream.set_read_timeout(Some(DEFAULT_TIMEOUT))?;
    let request: Request = read_msg(&mut stream)?;
    trace!(?request, "Directory request");

    let response = match request {
        Request::Publish { name, info } => {
            debug!(%name, %info, "Published");
            entries.publish(&name, &info)?;
            Response::Published
        }
        Request::Lookup { name } => Response::Found(entries.lookup(&name)?),
    };
    write_msg(&mut stream, &response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn spawn_server() -> SocketAddr {
        let server = DirectoryServer::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.serve());
        addr
    }

    #[test]
    fn publish_then_lookup_over_tcp() {
        let directory = TcpDirectory::new(spawn_server());
        let name = EndpointName::from("server-2");
        let info = EndpointInfo {
            locator: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            endpoint_id: 31850,
            queue_key: 0x1111_1111,
        };

        assert_eq!(directory.lookup(&name).unwrap(), None);
        directory.publish(&name, &info).unwrap();
        assert_eq!(directory.lookup(&name).unwrap(), Some(info));
    }

    #[test]
    fn unreachable_directory_is_an_error() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let directory = TcpDirectory::new(addr).with_timeout(Duration::from_millis(200));
        assert!(directory.lookup(&EndpointName::from("server-0")).is_err());
    }
}
