//! Unix socket transport: one JSON line per request and per response.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::broker::BrokerTransport;
use crate::error::GuestProcError;
use crate::protocol::{BrokerStatus, Reply, Request, Response};

/// Longest response line a client accepts; process listings are the
/// largest replies.
pub const MAX_RESPONSE_LINE: usize = 4 << 20;

/// `read_line` that gives up with `InvalidData` once a line exceeds
/// `limit` bytes. Returns 0 at EOF.
pub fn read_line_bounded<R: BufRead>(
    reader: &mut R,
    line: &mut String,
    limit: usize,
) -> std::io::Result<usize> {
    let read = reader.by_ref().take(limit as u64 + 1).read_line(line)?;
    if read > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("line longer than {limit} bytes"),
        ));
    }
    Ok(read)
}

pub struct UnixSocketTransport {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl UnixSocketTransport {
    pub fn connect(socket_path: &Path) -> Result<Self, GuestProcError> {
        let stream = UnixStream::connect(socket_path).map_err(|e| {
            GuestProcError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to connect to broker at {}: {e}", socket_path.display()),
            ))
        })?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: UnixStream) -> Result<Self, GuestProcError> {
        let reader = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(reader),
            writer: stream,
        })
    }

    fn send_line(&mut self, request: &Request) -> std::io::Result<()> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()
    }
}

impl BrokerTransport for UnixSocketTransport {
    fn call(&mut self, request: &Request) -> Result<Reply, BrokerStatus> {
        self.send_line(request).map_err(|e| {
            log::warn!("[broker] send of {} failed: {e}", request.kind());
            BrokerStatus::Disconnected
        })?;

        let mut line = String::new();
        let read = read_line_bounded(&mut self.reader, &mut line, MAX_RESPONSE_LINE).map_err(|e| {
            log::warn!("[broker] receive for {} failed: {e}", request.kind());
            match e.kind() {
                std::io::ErrorKind::InvalidData => BrokerStatus::Protocol,
                _ => BrokerStatus::Disconnected,
            }
        })?;
        if read == 0 {
            log::warn!("[broker] connection closed during {}", request.kind());
            return Err(BrokerStatus::Disconnected);
        }

        let response: Response = serde_json::from_str(line.trim_end()).map_err(|e| {
            log::warn!("[broker] unparseable response to {}: {e}", request.kind());
            BrokerStatus::Protocol
        })?;
        response.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn bounded_read_stops_at_limit() {
        let mut reader = Cursor::new(b"short\nthis line is too long\n".to_vec());
        let mut line = String::new();
        assert_eq!(read_line_bounded(&mut reader, &mut line, 8).unwrap(), 6);
        assert_eq!(line, "short\n");

        line.clear();
        let err = read_line_bounded(&mut reader, &mut line, 8).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn bounded_read_accepts_line_of_exact_limit() {
        let mut reader = Cursor::new(b"1234567\n".to_vec());
        let mut line = String::new();
        assert_eq!(read_line_bounded(&mut reader, &mut line, 8).unwrap(), 8);
        assert_eq!(read_line_bounded(&mut reader, &mut line, 8).unwrap(), 0);
    }

    #[test]
    fn round_trip_over_socket_pair() {
        let (client, server) = UnixStream::pair().unwrap();
        let peer = std::thread::spawn(move || {
            let mut reader = BufReader::new(server.try_clone().unwrap());
            let mut writer = server;
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let request: Request = serde_json::from_str(line.trim_end()).unwrap();
            assert_eq!(request, Request::CloseHandle { handle: crate::protocol::Handle(12) });
            let response = Response::from_result(Err(BrokerStatus::InvalidHandle));
            writeln!(writer, "{}", serde_json::to_string(&response).unwrap()).unwrap();
        });

        let mut transport = UnixSocketTransport::from_stream(client).unwrap();
        let result = transport.call(&Request::CloseHandle {
            handle: crate::protocol::Handle(12),
        });
        assert_eq!(result, Err(BrokerStatus::InvalidHandle));
        peer.join().unwrap();
    }

    #[test]
    fn closed_peer_reports_disconnect() {
        let (client, server) = UnixStream::pair().unwrap();
        drop(server);
        let mut transport = UnixSocketTransport::from_stream(client).unwrap();
        assert_eq!(
            transport.call(&Request::ListProcesses),
            Err(BrokerStatus::Disconnected)
        );
    }
}
