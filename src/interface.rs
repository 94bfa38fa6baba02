use bytes::BytesMut;
use std::io;
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;
use tun::{AsyncDevice, Configuration, Device};

/// Largest frame accepted from the kernel in one read.
pub const FRAME_MAX: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Layer-3 IP packets.
    Tun,
    /// Layer-2 Ethernet frames.
    Tap,
}

impl Mode {
    /// TUN when the configured local ip is a dotted quad and layer 2 was not
    /// requested; otherwise TAP. A non-address ip field names the bridge the
    /// created interface joins.
    pub fn select(ip_field: &str, force_tap: bool) -> Self {
        if ip_field.parse::<Ipv4Addr>().is_ok() && !force_tap {
            Mode::Tun
        } else {
            Mode::Tap
        }
    }
}

pub struct Interface {
    device: AsyncDevice,
}

impl Interface {
    pub fn new(mode: Mode, mtu: u16) -> io::Result<Self> {
        let mut config = Configuration::default();
        config.layer(match mode {
            Mode::Tun => tun::Layer::L3,
            Mode::Tap => tun::Layer::L2,
        });
        config.mtu(mtu as i32);
        config.up();

        let device =
            tun::create_as_async(&config).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Self { device })
    }

    /// Name assigned by the kernel.
    pub fn name(&self) -> io::Result<String> {
        self.device
            .get_ref()
            .name()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    pub fn split(self) -> (InterfaceReader, InterfaceWriter) {
        let (reader, writer) = tokio::io::split(self.device);
        (InterfaceReader { reader }, InterfaceWriter { writer })
    }
}

pub struct InterfaceReader {
    reader: tokio::io::ReadHalf<AsyncDevice>,
}

impl InterfaceReader {
    /// One frame per call; back-to-back calls drain the device.
    pub async fn read_frame(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.reader.read_buf(buf).await
    }
}

pub struct InterfaceWriter {
    writer: tokio::io::WriteHalf<AsyncDevice>,
}

impl InterfaceWriter {
    /// Writes exactly one frame. A short write is diagnosed, not retried.
    pub async fn write_frame(&mut self, buf: &[u8]) -> io::Result<()> {
        let n = self.writer.write(buf).await?;
        if n != buf.len() {
            warn!("tun/tap accepted {} of {} bytes", n, buf.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_selection() {
        assert_eq!(Mode::select("10.99.0.1", false), Mode::Tun);
        // tap option forces layer 2 even for a dotted quad
        assert_eq!(Mode::select("10.99.0.1", true), Mode::Tap);
        // bridge name means layer 2
        assert_eq!(Mode::select("br0", false), Mode::Tap);
        assert_eq!(Mode::select("10.99.0", false), Mode::Tap);
    }
}
