//! Consumers of decoded transport stream packets.
use std::{
    io::Write,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, trace};

use crate::{
    packet::{TsPacket, TS_PACKET_LEN},
    Error, Result,
};

/// Packets per UDP datagram, the usual payload of MPEG-TS over UDP.
pub const PACKETS_PER_DATAGRAM: usize = 7;

/// Receives transport stream packets one at a time, in stream order.
pub trait TsSink: Send {
    /// # Errors
    /// Any error detaches the sink from the demodulator.
    fn send(&mut self, packet: &TsPacket) -> Result<()>;

    /// Push out anything buffered.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Hands packets to another thread through a bounded crossbeam channel.
///
/// Packets are dropped while the channel is full, the demodulator never waits on a consumer.
pub struct ChannelSink {
    tx: Sender<TsPacket>,
    dropped: u64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, Receiver<TsPacket>) {
        let (tx, rx) = bounded(capacity);
        (ChannelSink { tx, dropped: 0 }, rx)
    }

    /// Packets lost because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl TsSink for ChannelSink {
    fn send(&mut self, packet: &TsPacket) -> Result<()> {
        match self.tx.try_send(*packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                trace!(dropped = self.dropped, "channel sink full");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(Error::Io(std::io::ErrorKind::BrokenPipe.into()))
            }
        }
    }
}

/// Writes packets back to back, e.g. into a `.ts` file or stdout.
pub struct WriterSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        WriterSink { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> TsSink for WriterSink<W> {
    fn send(&mut self, packet: &TsPacket) -> Result<()> {
        self.writer.write_all(packet.data())?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Re-transmits the stream as UDP datagrams of [PACKETS_PER_DATAGRAM] packets.
pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
    buf: Vec<u8>,
}

impl UdpSink {
    /// # Errors
    /// [Error::Configuration] if the address does not resolve, [Error::Io] if no socket can be
    /// bound.
    pub fn new(address: &str, port: u16) -> Result<Self> {
        let target = (address, port)
            .to_socket_addrs()
            .map_err(|e| Error::Configuration(format!("UDP target {address}:{port}: {e}")))?
            .next()
            .ok_or_else(|| Error::Configuration(format!("UDP target {address}:{port} did not resolve")))?;
        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        debug!(addr = %target, "UDP output");
        Ok(UdpSink {
            socket,
            target,
            buf: Vec::with_capacity(PACKETS_PER_DATAGRAM * TS_PACKET_LEN),
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    fn send_datagram(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let result = self.socket.send_to(&self.buf, self.target);
        self.buf.clear();
        result?;
        Ok(())
    }
}

impl TsSink for UdpSink {
    fn send(&mut self, packet: &TsPacket) -> Result<()> {
        self.buf.extend_from_slice(packet.data());
        if self.buf.len() >= PACKETS_PER_DATAGRAM * TS_PACKET_LEN {
            self.send_datagram()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.send_datagram()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn packet(n: u8) -> TsPacket {
        let mut p = TsPacket::default();
        p.0[0] = 0x47;
        p.0[3] = n;
        p
    }

    #[test]
    fn test_udp_groups_seven_packets() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let port = server.local_addr().unwrap().port();

        let mut sink = UdpSink::new("127.0.0.1", port).unwrap();
        for n in 0..9 {
            sink.send(&packet(n)).unwrap();
        }
        let mut buf = [0u8; 2048];
        let (len, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(len, 7 * 188);
        assert_eq!(buf[188 + 3], 1);

        sink.flush().unwrap();
        let (len, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(len, 2 * 188);
        assert_eq!(buf[3], 7);
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (mut sink, rx) = ChannelSink::new(2);
        for n in 0..3 {
            sink.send(&packet(n)).unwrap();
        }
        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.recv().unwrap().0[3], 0);

        drop(rx);
        assert!(sink.send(&packet(9)).is_err());
    }

    #[test]
    fn test_writer_sink() {
        let mut sink = WriterSink::new(Vec::new());
        sink.send(&packet(1)).unwrap();
        sink.send(&packet(2)).unwrap();
        let out = sink.into_inner();
        assert_eq!(out.len(), 376);
        assert_eq!(out[188], 0x47);
    }
}
