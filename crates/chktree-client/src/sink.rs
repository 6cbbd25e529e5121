//! Blocking daemon client for insert and delete
//!
//! Insertion walks the local file and waits for the daemon's verdict on
//! every block, so it uses a plain blocking socket instead of the async
//! request manager.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tracing::debug;

use chktree_core::wire::{decode_daemon_message, encode_client_message, parse_header, HEADER_SIZE};
use chktree_core::{BlockSink, ClientMessage, DaemonMessage, SinkError};

/// Synchronous connection to the daemon
pub struct DaemonSink {
    address: String,
    stream: TcpStream,
}

impl DaemonSink {
    pub fn connect(address: &str) -> Result<Self, SinkError> {
        let stream = TcpStream::connect(address)
            .map_err(|e| SinkError::Unreachable(format!("{}: {}", address, e)))?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            address: address.to_string(),
            stream,
        })
    }

    /// Fail reads that take longer than `timeout`
    pub fn with_timeout(self, timeout: Duration) -> Result<Self, SinkError> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| SinkError::Unreachable(e.to_string()))?;
        Ok(self)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send `msg` and wait for the return value
    fn exchange(&mut self, msg: &ClientMessage) -> Result<i32, SinkError> {
        let unreachable = |e: std::io::Error| SinkError::Unreachable(e.to_string());
        let frame = encode_client_message(msg).map_err(|e| SinkError::Unreachable(e.to_string()))?;
        self.stream.write_all(&frame).map_err(unreachable)?;

        let mut reply = vec![0u8; HEADER_SIZE];
        self.stream.read_exact(&mut reply).map_err(unreachable)?;
        let (size, _) = parse_header(&reply).map_err(|e| SinkError::Unreachable(e.to_string()))?;
        reply.resize(size, 0);
        self.stream
            .read_exact(&mut reply[HEADER_SIZE..])
            .map_err(unreachable)?;

        match decode_daemon_message(&reply) {
            Ok(DaemonMessage::ReturnValue(value)) => Ok(value),
            Ok(DaemonMessage::ResultChk(_)) => {
                Err(SinkError::Unreachable("unexpected result block".into()))
            }
            Err(e) => Err(SinkError::Unreachable(e.to_string())),
        }
    }

    /// Ask the daemon for the average priority of recent queries
    pub fn average_priority(&mut self) -> Result<u32, SinkError> {
        let value = self.exchange(&ClientMessage::GetAveragePriority)?;
        Ok(value.max(0) as u32)
    }
}

impl BlockSink for DaemonSink {
    fn submit(&mut self, msg: ClientMessage) -> Result<(), SinkError> {
        let msg_type = msg.msg_type();
        let value = self.exchange(&msg)?;
        debug!("Daemon returned {} for message type {}", value, msg_type);
        if value < 0 {
            return Err(SinkError::Refused);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chktree_core::wire::{decode_client_message, encode_daemon_message};
    use chktree_core::CONTENT_SIZE;
    use std::net::TcpListener;
    use std::thread;

    /// Answers every frame with the next value from `values`
    fn serve(values: Vec<i32>) -> (String, thread::JoinHandle<Vec<ClientMessage>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            for value in values {
                let mut frame = vec![0u8; HEADER_SIZE];
                socket.read_exact(&mut frame).unwrap();
                let (size, _) = parse_header(&frame).unwrap();
                frame.resize(size, 0);
                socket.read_exact(&mut frame[HEADER_SIZE..]).unwrap();
                seen.push(decode_client_message(&frame).unwrap());
                socket
                    .write_all(&encode_daemon_message(&DaemonMessage::ReturnValue(value)))
                    .unwrap();
            }
            seen
        });
        (address, handle)
    }

    #[test]
    fn test_submit_accepted_and_refused() {
        let (address, server) = serve(vec![1, -1]);
        let mut sink = DaemonSink::connect(&address).unwrap();

        let block = Box::new([5u8; CONTENT_SIZE]);
        sink.submit(ClientMessage::InsertChk {
            priority: 3,
            block: block.clone(),
        })
        .unwrap();
        let err = sink
            .submit(ClientMessage::DeleteChk { priority: 3, block })
            .unwrap_err();
        assert_eq!(err, SinkError::Refused);

        let seen = server.join().unwrap();
        assert!(matches!(seen[0], ClientMessage::InsertChk { priority: 3, .. }));
        assert!(matches!(seen[1], ClientMessage::DeleteChk { .. }));
    }

    #[test]
    fn test_average_priority() {
        let (address, server) = serve(vec![42]);
        let mut sink = DaemonSink::connect(&address).unwrap();
        assert_eq!(sink.average_priority().unwrap(), 42);
        assert_eq!(server.join().unwrap(), vec![ClientMessage::GetAveragePriority]);
    }

    #[test]
    fn test_unreachable_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(matches!(
            DaemonSink::connect(&address),
            Err(SinkError::Unreachable(_))
        ));
    }
}
