//! Framed transport
//!
//! Length-prefixed bincode frames over TCP. The async half serves the control
//! connection and the node server; the sync half serves the audio pump
//! thread, which deliberately stays off the async runtime.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Hard cap on a single frame; anything larger is a protocol violation.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Async framed connection (control channel, node server).
pub struct Framed {
    stream: TcpStream,
}

impl Framed {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(host: &str, port: u16) -> std::io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let data = bincode::serialize(msg)?;
        self.stream.write_u32(data.len() as u32).await?;
        self.stream.write_all(&data).await?;
        Ok(())
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        let len = self.stream.read_u32().await?;
        if len > MAX_FRAME_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            )
            .into());
        }
        let mut data = vec![0u8; len as usize];
        self.stream.read_exact(&mut data).await?;
        Ok(bincode::deserialize(&data)?)
    }
}

/// Blocking framed connection for the audio pump thread.
pub struct SyncFramed {
    stream: std::net::TcpStream,
}

impl SyncFramed {
    pub fn connect(host: &str, port: u16) -> std::io::Result<Self> {
        let stream = std::net::TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub fn send<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let data = bincode::serialize(msg)?;
        self.stream.write_all(&(data.len() as u32).to_be_bytes())?;
        self.stream.write_all(&data)?;
        Ok(())
    }

    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut len_bytes = [0u8; 4];
        self.stream.read_exact(&mut len_bytes)?;
        let len = u32::from_be_bytes(len_bytes);
        if len > MAX_FRAME_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            )
            .into());
        }
        let mut data = vec![0u8; len as usize];
        self.stream.read_exact(&mut data)?;
        Ok(bincode::deserialize(&data)?)
    }

    /// Unblock any reader stuck in `recv` on another clone of this socket.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    pub fn try_clone(&self) -> std::io::Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
        })
    }
}
