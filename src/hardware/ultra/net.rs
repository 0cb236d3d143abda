//! Ultra head sockets.
//!
//! [`CommandChannel`] is a request/reply client for the ASCII command port.
//! [`DataSocket`] receives frame datagrams on the host data port.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use super::protocol::{self, FloatReading};
use crate::error::{AppResult, DaqError};

/// Async command client. One command in flight at a time.
pub struct CommandChannel {
    stream: Mutex<BufReader<TcpStream>>,
    timeout: Duration,
    peer: SocketAddr,
}

impl CommandChannel {
    /// Connect to the head command port.
    pub async fn connect(addr: SocketAddr, command_timeout: Duration) -> AppResult<Self> {
        let stream = timeout(command_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DaqError::timeout(format!("connect to {addr}"), command_timeout))??;
        stream.set_nodelay(true)?;
        info!(%addr, "Connected to Ultra head");

        Ok(Self {
            stream: Mutex::new(BufReader::new(stream)),
            timeout: command_timeout,
            peer: addr,
        })
    }

    /// Address of the head.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one command and return the raw reply line, terminator included.
    pub async fn send_wait(&self, command: &str) -> AppResult<String> {
        let mut stream = self.stream.lock().await;

        let line = format!("{command}{}", protocol::TERMINATOR);
        debug!(command, "Ultra command");
        stream.get_mut().write_all(line.as_bytes()).await?;
        stream.get_mut().flush().await?;

        let mut reply = String::new();
        match timeout(self.timeout, stream.read_line(&mut reply)).await {
            Ok(Ok(0)) => Err(DaqError::HardwareError(
                "command connection closed by head".into(),
            )),
            Ok(Ok(_)) => {
                debug!(reply = reply.trim_end(), "Ultra reply");
                Ok(reply)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DaqError::timeout(
                format!("reply to {command:?}"),
                self.timeout,
            )),
        }
    }

    /// Empty command; the head answers that it does not recognise it.
    pub async fn handshake(&self) -> AppResult<()> {
        let reply = self.send_wait("").await?;
        protocol::check_handshake(&reply)?;
        Ok(())
    }

    /// `read <name>` as a float.
    pub async fn read_float(&self, name: &str) -> AppResult<FloatReading> {
        let reply = self.send_wait(&protocol::read_command(name)).await?;
        Ok(protocol::parse_float(&reply)?)
    }

    /// `read <name>` as a hex register.
    pub async fn read_hex(&self, name: &str) -> AppResult<u32> {
        let reply = self.send_wait(&protocol::read_command(name)).await?;
        Ok(protocol::parse_hex(&reply)?)
    }

    /// `read <name>` as a value pair.
    pub async fn read_pair(&self, name: &str) -> AppResult<(u32, u32)> {
        let reply = self.send_wait(&protocol::read_command(name)).await?;
        Ok(protocol::parse_pair(&reply)?)
    }

    /// `set <name> <value>`, expecting an acknowledgement.
    pub async fn set(&self, name: &str, value: &str) -> AppResult<()> {
        let reply = self.send_wait(&protocol::set_command(name, value)).await?;
        protocol::check_ack(&reply)?;
        Ok(())
    }

    /// Bare `set <name>`, expecting an acknowledgement.
    pub async fn set_flag(&self, name: &str) -> AppResult<()> {
        let reply = self.send_wait(&format!("set {name}")).await?;
        protocol::check_ack(&reply)?;
        Ok(())
    }

    /// Write a hex register.
    pub async fn set_register(&self, name: &str, value: u32) -> AppResult<()> {
        self.set(name, &protocol::format_register(value)).await
    }

    /// Write a value pair.
    pub async fn set_pair(&self, name: &str, first: u32, second: u32) -> AppResult<()> {
        self.set(name, &format!("{first} {second}")).await
    }

    /// Read-modify-write of register bits selected by `mask`.
    pub async fn update_register(&self, name: &str, mask: u32, enabled: bool) -> AppResult<()> {
        let current = self.read_hex(name).await?;
        let next = if enabled {
            current | mask
        } else {
            current & !mask
        };
        if next != current {
            self.set_register(name, next).await?;
        }
        Ok(())
    }
}

/// Host side of the frame data stream.
pub struct DataSocket {
    socket: UdpSocket,
    npixels: usize,
}

impl DataSocket {
    /// Bind the host data port.
    pub async fn bind(addr: SocketAddr, npixels: usize) -> AppResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(%addr, npixels, "Ultra data socket bound");
        Ok(Self { socket, npixels })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive one datagram and decode it.
    pub async fn recv_packet(&self, buf: &mut [u8]) -> AppResult<protocol::DataPacket> {
        let (len, _) = self.socket.recv_from(buf).await?;
        Ok(protocol::decode_packet(&buf[..len], self.npixels)?)
    }

    /// Receive buffer large enough for one packet.
    pub fn packet_buffer(&self) -> Vec<u8> {
        vec![0u8; protocol::PACKET_HEADER_LEN + self.npixels * 2 + 64]
    }
}
