//! Synchronous TLS server fronting an [`ObjectStorage`] for remote clients
//! (§4.11, §6). One call to [`RemoteServer::serve_one`] handles exactly one
//! connection's full request/response loop; a long-running server loops
//! calling it from a dedicated thread per accepted connection, the same
//! thread-per-connection model the rest of this crate uses for background
//! work rather than an async runtime.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use rustls::{ServerConnection, StreamOwned};
use tracing::info;

use crate::error::{Error, Result};
use crate::remote::tls::{self, TlsIdentity};
use crate::remote::wire::{read_message, write_message, Request, Response};
use crate::storage::ObjectStorage;

/// How long a connection may sit idle (no request, no ping) before the
/// server drops it (§6: ~5s).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RemoteServer<O: ObjectStorage> {
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    store: Arc<O>,
}

impl<O: ObjectStorage + 'static> RemoteServer<O> {
    pub fn bind(addr: &str, identity: &TlsIdentity, store: Arc<O>) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(Error::Io)?;
        let tls_config = tls::server_config(identity)?;
        Ok(Self {
            listener,
            tls_config,
            store,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::Io)
    }

    /// Accepts and serves exactly one connection to completion (until the
    /// client closes it or it goes idle past [`IDLE_TIMEOUT`]).
    pub fn serve_one(&self) -> Result<()> {
        let (stream, peer) = self.listener.accept().map_err(Error::Io)?;
        stream.set_read_timeout(Some(IDLE_TIMEOUT)).map_err(Error::Io)?;
        info!(%peer, "accepted remote connection");
        let conn = ServerConnection::new(self.tls_config.clone()).map_err(|e| Error::Remote(e.to_string()))?;
        let mut tls_stream = StreamOwned::new(conn, stream);

        loop {
            let request: Request = match read_message(&mut tls_stream) {
                Ok(r) => r,
                Err(Error::Io(e)) if is_connection_ended(&e) => {
                    info!(%peer, "remote connection ended");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let response = self.handle(request);
            write_message(&mut tls_stream, &response)?;
        }
    }

    fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,
            Request::Get { key } => match self.store.get(&key) {
                Ok(v) => Response::Value(v),
                Err(e) if e.is_not_found() => Response::NotFound,
                Err(e) => Response::Err(e.to_string()),
            },
            Request::Set { key, value } => match self.store.set(&key, &value) {
                Ok(()) => Response::Ok,
                Err(e) => Response::Err(e.to_string()),
            },
            Request::Delete { key } => match self.store.delete(&key) {
                Ok(()) => Response::Ok,
                Err(e) => Response::Err(e.to_string()),
            },
            Request::List { prefix } => match self.store.list(&prefix) {
                Ok(keys) => Response::Keys(keys),
                Err(e) => Response::Err(e.to_string()),
            },
        }
    }
}

fn is_connection_ended(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::client::RemoteClient;
    use crate::remote::tls::{client_config, generate_identity};
    use crate::storage::memory_object::MemoryObjectStore;
    use std::thread;

    #[test]
    fn client_round_trips_get_set_delete_and_list_through_the_server() {
        let identity = generate_identity("localhost").unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let server = RemoteServer::bind("127.0.0.1:0", &identity, store).unwrap();
        let addr = server.local_addr().unwrap();

        let handle = thread::spawn(move || {
            server.serve_one().unwrap();
        });

        let client_cfg = client_config(&identity.cert_der).unwrap();
        let client = RemoteClient::connect(&addr.to_string(), "localhost", client_cfg).unwrap();

        client.ping().unwrap();
        assert!(client.get("missing").is_err());
        client.set("blocks/0", b"payload").unwrap();
        assert_eq!(client.get("blocks/0").unwrap(), b"payload");
        assert_eq!(client.list("blocks/").unwrap(), vec!["blocks/0".to_string()]);
        client.delete("blocks/0").unwrap();
        assert!(client.get("blocks/0").is_err());

        drop(client);
        handle.join().unwrap();
    }
}
