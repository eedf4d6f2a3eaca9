//! Synchronous TLS client for the remote transport (§4.11, §6). Implements
//! [`ObjectStorage`] directly, so an archive can sit its L0 on a remote
//! server exactly as it would on a local disk directory — everything above
//! L0 is unaware its blocks are crossing a network.

use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::{ClientConnection, ServerName, StreamOwned};

use crate::error::{Error, Result};
use crate::remote::wire::{read_message, write_message, Request, Response};
use crate::storage::ObjectStorage;

/// How often a caller should ping an otherwise-idle connection to keep the
/// server's idle timeout from firing (§6: ~3s). Not driven automatically by
/// this client — callers that hold a connection open across long gaps
/// between archive operations are expected to call `ping` on this cadence
/// themselves, the same way they already own their own retry loop.
pub const PING_INTERVAL: Duration = Duration::from_secs(3);

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

pub struct RemoteClient {
    conn: Mutex<TlsStream>,
}

impl RemoteClient {
    pub fn connect(addr: &str, server_name: &str, config: Arc<rustls::ClientConfig>) -> Result<Self> {
        let name = ServerName::try_from(server_name).map_err(|e| Error::Remote(e.to_string()))?;
        let tcp = TcpStream::connect(addr).map_err(Error::Io)?;
        let conn = ClientConnection::new(config, name).map_err(|e| Error::Remote(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(StreamOwned::new(conn, tcp)),
        })
    }

    fn roundtrip(&self, request: Request) -> Result<Response> {
        let mut guard = self.conn.lock().expect("remote connection mutex poisoned");
        write_message(&mut *guard, &request)?;
        read_message(&mut *guard)
    }

    pub fn ping(&self) -> Result<()> {
        match self.roundtrip(Request::Ping)? {
            Response::Pong => Ok(()),
            other => Err(Error::Remote(format!("unexpected ping response: {other:?}"))),
        }
    }
}

impl ObjectStorage for RemoteClient {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        match self.roundtrip(Request::Get { key: key.to_string() })? {
            Response::Value(v) => Ok(v),
            Response::NotFound => Err(Error::NotFound(key.to_string())),
            Response::Err(e) => Err(Error::Remote(e)),
            other => Err(Error::Remote(format!("unexpected get response: {other:?}"))),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        match self.roundtrip(Request::Set {
            key: key.to_string(),
            value: value.to_vec(),
        })? {
            Response::Ok => Ok(()),
            Response::Err(e) => Err(Error::Remote(e)),
            other => Err(Error::Remote(format!("unexpected set response: {other:?}"))),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.roundtrip(Request::Delete { key: key.to_string() })? {
            Response::Ok => Ok(()),
            Response::Err(e) => Err(Error::Remote(e)),
            other => Err(Error::Remote(format!("unexpected delete response: {other:?}"))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        match self.roundtrip(Request::List {
            prefix: prefix.to_string(),
        })? {
            Response::Keys(keys) => Ok(keys),
            Response::Err(e) => Err(Error::Remote(e)),
            other => Err(Error::Remote(format!("unexpected list response: {other:?}"))),
        }
    }
}
