use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;
use shared::protocol::{decode_reply, Command, Reply, MAX_CONTROL_FRAME};
use shared::{DiscoveryError, Result};

/// Blocking request/reply exchange with the beacon on this host's control
/// port. Every request uses a fresh connection; a connection that timed out
/// is dropped with the error.
#[derive(Debug, Clone)]
pub struct ControlChannel {
    addr: SocketAddr,
    reply_timeout: Duration,
}

impl ControlChannel {
    pub fn new(control_port: u16, reply_timeout: Duration) -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, control_port)),
            reply_timeout,
        }
    }

    /// `hold` is how long the beacon may legitimately keep the request
    /// pending; the reply is awaited for `hold` plus the reply timeout.
    pub fn request(&self, command: &Command, hold: Duration) -> Result<Option<Reply>> {
        let deadline = self.reply_timeout + hold;

        let mut stream = TcpStream::connect_timeout(&self.addr, self.reply_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(self.reply_timeout))?;
        stream.set_read_timeout(Some(deadline))?;

        tracing::debug!("Sending {:?} to {}", command, self.addr);
        write_frame(&mut stream, &command.encode()?)?;
        let body = read_frame(&mut stream).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => DiscoveryError::TimedOut(deadline),
            _ => DiscoveryError::Io(e),
        })?;
        decode_reply(&body)
    }
}

fn write_frame(stream: &mut TcpStream, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "control frame too large"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_CONTROL_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("control frame of {len} bytes exceeds {MAX_CONTROL_FRAME}"),
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}
