//! Unix socket front end: one thread per connection, one session per
//! connection, one JSON line per request and per response.

use std::fs;
use std::io::{BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;

use guestproc::broker::read_line_bounded;
use guestproc::protocol::{max_request_line, BrokerStatus, ErrorDetail, Request, Response};

use crate::error::BrokerError;
use crate::registry::{Registry, SessionId};

/// Bind `path`, replacing a stale socket left by an earlier broker.
pub fn bind(path: &Path) -> Result<UnixListener, BrokerError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    if path.exists() {
        if UnixStream::connect(path).is_ok() {
            return Err(BrokerError::Bind {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "another broker is listening",
                ),
            });
        }
        log::info!("[server] removing stale socket {}", path.display());
        fs::remove_file(path)?;
    }
    UnixListener::bind(path).map_err(|source| BrokerError::Bind {
        path: path.to_path_buf(),
        source,
    })
}

/// Accept connections forever.
pub fn serve(listener: UnixListener, registry: Arc<Registry>) -> Result<(), BrokerError> {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("[server] accept failed: {e}");
                continue;
            }
        };
        let registry = registry.clone();
        std::thread::Builder::new()
            .name("broker-session".to_string())
            .spawn(move || {
                if let Err(e) = serve_connection(stream, &registry) {
                    log::debug!("[server] connection ended: {e}");
                }
            })?;
    }
    Ok(())
}

/// Closes the registry session when the connection goes away, however it
/// goes away.
struct SessionGuard<'a> {
    registry: &'a Registry,
    id: SessionId,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.registry.close_session(self.id);
    }
}

fn write_response(writer: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    let mut out = serde_json::to_string(response)?;
    out.push('\n');
    writer.write_all(out.as_bytes())?;
    writer.flush()
}

/// Serve requests from one connection until EOF. An overlong line ends the
/// connection after a protocol error.
pub fn serve_connection(stream: UnixStream, registry: &Registry) -> std::io::Result<()> {
    let session = SessionGuard {
        registry,
        id: registry.open_session(),
    };
    let limit = max_request_line(registry.limits().max_transfer);
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    let mut line = String::new();
    loop {
        line.clear();
        match read_line_bounded(&mut reader, &mut line, limit) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                log::warn!("[server] session {}: {e}", session.id);
                let response = Response::Error(ErrorDetail {
                    status: BrokerStatus::Protocol,
                    desc: e.to_string(),
                });
                write_response(&mut writer, &response)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        let request = line.trim_end();
        if request.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(request) {
            Ok(request) => Response::from_result(registry.handle(session.id, request)),
            Err(e) => {
                log::warn!("[server] session {}: malformed request: {e}", session.id);
                Response::Error(ErrorDetail {
                    status: BrokerStatus::Protocol,
                    desc: e.to_string(),
                })
            }
        };
        write_response(&mut writer, &response)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use crate::host::LinuxHost;
    use crate::registry::Limits;

    fn exchange(line: &str) -> String {
        let registry = Registry::new(Limits::default(), Arc::new(LinuxHost));
        let (client, server) = UnixStream::pair().unwrap();
        let worker = std::thread::spawn(move || serve_connection(server, &registry));
        let mut writer = client.try_clone().unwrap();
        writer.write_all(line.as_bytes()).unwrap();
        let mut reader = BufReader::new(client);
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        writer.shutdown(std::net::Shutdown::Both).unwrap();
        worker.join().unwrap().unwrap();
        reply
    }

    #[test]
    fn connect_is_answered() {
        let reply = exchange("{\"request\":\"connect\",\"args\":{\"host_pid\":42}}\n");
        let response: Response = serde_json::from_str(&reply).unwrap();
        match response.into_result().unwrap() {
            guestproc::protocol::Reply::Connected { max_transfer, .. } => {
                assert_eq!(max_transfer, 1024)
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn garbage_gets_protocol_error() {
        let reply = exchange("not json\n");
        let response: Response = serde_json::from_str(&reply).unwrap();
        assert_eq!(response.into_result(), Err(BrokerStatus::Protocol));
    }

    #[test]
    fn endless_line_is_cut_off() {
        let registry = Registry::new(
            Limits {
                max_transfer: 16,
                ..Limits::default()
            },
            Arc::new(LinuxHost),
        );
        let (client, server) = UnixStream::pair().unwrap();
        let worker = std::thread::spawn(move || serve_connection(server, &registry));

        let mut writer = client.try_clone().unwrap();
        let flood = vec![b'x'; max_request_line(16) + 1];
        // The broker may hang up before taking every byte.
        let _ = writer.write_all(&flood);

        let mut reader = BufReader::new(client);
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        let response: Response = serde_json::from_str(&reply).unwrap();
        assert_eq!(response.into_result(), Err(BrokerStatus::Protocol));

        let err = worker.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());
        let listener = bind(&path).unwrap();
        drop(listener);
    }

    #[test]
    fn live_socket_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let _live = UnixListener::bind(&path).unwrap();
        assert!(matches!(bind(&path), Err(BrokerError::Bind { .. })));
    }
}
