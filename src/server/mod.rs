use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config;
use crate::transport::Link;

/// Upper bound on how long a frame write may spin on a full socket buffer.
pub const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
}

impl From<&config::ServerConfig> for ServerConfig {
    fn from(value: &config::ServerConfig) -> Self {
        Self {
            host: value.host.clone(),
            port: value.port,
            tls_enabled: value.tls_enabled,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind TCP server on {address}: {source}")]
    Bind { address: String, source: io::Error },
    #[error("failed to set TCP server to non-blocking mode: {source}")]
    SetNonBlocking { source: io::Error },
    #[error("TLS is enabled in config but TLS transport is not implemented yet")]
    TlsNotSupportedYet,
    #[error("failed to accept TCP connection: {source}")]
    Accept { source: io::Error },
    #[error("failed to configure accepted TCP stream: {source}")]
    ConfigureAcceptedStream { source: io::Error },
    #[error("failed to clone accepted TCP stream for full duplex IO: {source}")]
    StreamClone { source: io::Error },
}

fn lock_stream(stream: &Mutex<TcpStream>) -> MutexGuard<'_, TcpStream> {
    match stream.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Accepted agent connection. Reads and writes are non-blocking and guarded
/// by separate locks so a reader never stalls a writer.
pub struct PersistentConnection {
    id: u64,
    peer_addr: SocketAddr,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    closed: AtomicBool,
}

impl PersistentConnection {
    fn new(id: u64, stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, ServerError> {
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;

        let writer = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;

        Ok(Self {
            id,
            peer_addr,
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn try_read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        lock_stream(&self.reader).read(buffer)
    }

    /// Writes the whole frame, retrying while the socket buffer is full.
    pub fn write_all(&self, payload: &[u8]) -> io::Result<()> {
        let mut writer = lock_stream(&self.writer);
        let started = Instant::now();
        let mut written = 0;

        while written < payload.len() {
            match writer.write(&payload[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(count) => written += count,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    if started.elapsed() >= WRITE_STALL_TIMEOUT {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("peer stopped reading after {written} of {} bytes", payload.len()),
                        ));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }

        writer.flush()
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let _ = lock_stream(&self.reader).shutdown(Shutdown::Both);
        lock_stream(&self.writer).shutdown(Shutdown::Both)
    }
}

impl Link for PersistentConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        self.write_all(frame)
    }

    fn close(&self) {
        let _ = self.shutdown();
    }

    fn describe(&self) -> String {
        format!("tcp-{}@{}", self.id, self.peer_addr)
    }
}

pub struct TcpServer {
    listener: TcpListener,
    next_connection_id: AtomicU64,
    active_connections: Mutex<HashMap<u64, Arc<PersistentConnection>>>,
}

impl TcpServer {
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        if config.tls_enabled {
            return Err(ServerError::TlsNotSupportedYet);
        }

        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            next_connection_id: AtomicU64::new(1),
            active_connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, ServerError> {
        Self::bind(&ServerConfig::from(&app_config.server))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<u64, Arc<PersistentConnection>>> {
        match self.active_connections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn try_accept_persistent(&self) -> Result<Option<Arc<PersistentConnection>>, ServerError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                let connection = Arc::new(PersistentConnection::new(id, stream, peer_addr)?);
                self.connections().insert(id, Arc::clone(&connection));
                Ok(Some(connection))
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(ServerError::Accept { source }),
        }
    }

    pub fn active_connections(&self) -> Vec<Arc<PersistentConnection>> {
        self.connections().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    pub fn drop_connection(&self, id: u64) {
        if let Some(connection) = self.connections().remove(&id) {
            let _ = connection.shutdown();
        }
    }

    pub fn shutdown_all_connections(&self) {
        let mut connections = self.connections();
        for connection in connections.values() {
            let _ = connection.shutdown();
        }
        connections.clear();
    }
}
