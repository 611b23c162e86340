//! Blocking request/response client for the driver socket.
//!
//! Every send writes one request envelope and blocks until the single
//! response envelope returns. A transport failure poisons the connection;
//! callers recover by calling [`IpcClient::ensure_connected`] on a later
//! tick, which reconnects and re-handshakes.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use log::{info, warn};

use crate::error::IpcError;
use crate::protocol::{
    Request, Response, DRIVER_SOCKET_PATH, PROTOCOL_VERSION, RESPONSE_SIZE,
};

/// Transport seam for request/response sends, so the profile applier can
/// be exercised against a recording fake.
pub trait DriverTransport {
    fn send(&mut self, req: &Request) -> Result<Response, IpcError>;

    /// Re-establish the transport if a previous send poisoned it. In-memory
    /// fakes have nothing to do.
    fn reconnect(&mut self) -> Result<(), IpcError> {
        Ok(())
    }
}

pub struct IpcClient {
    path: PathBuf,
    stream: Option<UnixStream>,
}

impl IpcClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        IpcClient {
            path: path.into(),
            stream: None,
        }
    }

    pub fn with_default_path() -> Self {
        IpcClient::new(DRIVER_SOCKET_PATH)
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect and handshake. A protocol version mismatch is fatal for
    /// this connection and reported as [`IpcError::HandshakeVersion`].
    pub fn connect(&mut self) -> Result<(), IpcError> {
        self.stream = Some(UnixStream::connect(&self.path)?);
        match self.send(&Request::Handshake) {
            Ok(Response::Handshake { version }) if version == PROTOCOL_VERSION => {
                info!("connected to driver, protocol version {version}");
                Ok(())
            }
            Ok(Response::Handshake { version }) => {
                self.stream = None;
                Err(IpcError::HandshakeVersion {
                    driver: version,
                    expected: PROTOCOL_VERSION,
                })
            }
            Ok(_) => {
                self.stream = None;
                Err(IpcError::Malformed("handshake response"))
            }
            Err(err) => Err(err),
        }
    }

    /// Reconnect if a previous send poisoned the connection.
    pub fn ensure_connected(&mut self) -> Result<(), IpcError> {
        if self.stream.is_none() {
            self.connect()
        } else {
            Ok(())
        }
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
    }

    fn send_inner(&mut self, req: &Request) -> Result<Response, IpcError> {
        let stream = self.stream.as_mut().ok_or(IpcError::NotConnected)?;

        let io_result: std::io::Result<[u8; RESPONSE_SIZE]> = (|| {
            stream.write_all(&req.encode())?;
            let mut buf = [0u8; RESPONSE_SIZE];
            stream.read_exact(&mut buf)?;
            Ok(buf)
        })();

        let buf = match io_result {
            Ok(buf) => buf,
            Err(err) => {
                warn!("driver transport failed, dropping connection: {err}");
                self.stream = None;
                return Err(err.into());
            }
        };

        match Response::decode(&buf) {
            Ok(resp) => Ok(resp),
            Err(err) => {
                // An unparseable envelope means the stream framing is gone.
                self.stream = None;
                Err(err)
            }
        }
    }
}

impl DriverTransport for IpcClient {
    fn send(&mut self, req: &Request) -> Result<Response, IpcError> {
        self.send_inner(req)
    }

    fn reconnect(&mut self) -> Result<(), IpcError> {
        self.ensure_connected()
    }
}
