//! Baseband frames to transport stream packets.
//!
//! In transport stream mode the data field of a BBFRAME carries user packets back to back, each
//! sync byte replaced by the CRC-8 of the previous packet. `SYNCD` locates the first packet that
//! starts in the frame; the tail of the last one continues in the next frame.
use std::collections::VecDeque;

use crc::{Crc, CRC_8_DVB_S2};
use tracing::{debug, info, trace};

use crate::{
    packet::{TsPacket, MPEG_SYNC, TS_PACKET_LEN},
    pipe::{PipeId, Pipes},
    report::{Event, Report, Source},
    scheduler::Stage,
};

use super::{modcod::KBCH_MAX, BbFrame};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_DVB_S2);

pub const BBHEADER_LEN: usize = 10;
/// Stream type field value of transport streams.
pub const STREAM_TS: u8 = 3;
/// Stream type field value of generic continuous streams.
pub const STREAM_GC: u8 = 1;
/// Most packets a single frame can complete.
pub const MAX_TS_PER_BBFRAME: usize = KBCH_MAX / 8 / TS_PACKET_LEN + 1;

/// The fixed header opening every baseband frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BbHeader {
    pub matype1: u8,
    pub matype2: u8,
    /// User packet length in bits.
    pub upl: u16,
    /// Data field length in bits.
    pub dfl: u16,
    pub sync: u8,
    /// Bits from the start of the data field to the first complete user packet.
    pub syncd: u16,
}

impl BbHeader {
    /// Header of a single input transport stream with constant coding and the given data length.
    pub fn transport_stream(dfl: u16, syncd: u16) -> Self {
        BbHeader {
            // TS, single input stream, CCM, roll-off 0.35
            matype1: 0xf0,
            matype2: 0,
            upl: (TS_PACKET_LEN * 8) as u16,
            dfl,
            sync: MPEG_SYNC,
            syncd,
        }
    }

    /// Parse and check the CRC, `None` on mismatch.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..BBHEADER_LEN)?;
        if CRC8.checksum(&bytes[..9]) != bytes[9] {
            return None;
        }
        Some(BbHeader {
            matype1: bytes[0],
            matype2: bytes[1],
            upl: u16::from_be_bytes([bytes[2], bytes[3]]),
            dfl: u16::from_be_bytes([bytes[4], bytes[5]]),
            sync: bytes[6],
            syncd: u16::from_be_bytes([bytes[7], bytes[8]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; BBHEADER_LEN] {
        let mut b = [0u8; BBHEADER_LEN];
        b[0] = self.matype1;
        b[1] = self.matype2;
        b[2..4].copy_from_slice(&self.upl.to_be_bytes());
        b[4..6].copy_from_slice(&self.dfl.to_be_bytes());
        b[6] = self.sync;
        b[7..9].copy_from_slice(&self.syncd.to_be_bytes());
        b[9] = CRC8.checksum(&b[..9]);
        b
    }

    pub fn stream_type(&self) -> u8 {
        self.matype1 >> 6
    }

    fn is_transport_stream(&self) -> bool {
        self.stream_type() == STREAM_TS
            && usize::from(self.upl) == TS_PACKET_LEN * 8
            && self.sync == MPEG_SYNC
            && self.syncd <= self.dfl
    }
}

/// Extracts transport stream packets from baseband frames.
pub struct Deframer {
    input: PipeId<BbFrame>,
    output: PipeId<TsPacket>,
    /// Bytes of an incomplete packet, `None` while not synchronized.
    leftover: Option<Vec<u8>>,
    locked: bool,
    locktime: u64,
    report_state: bool,
}

impl Deframer {
    pub fn new(input: PipeId<BbFrame>, output: PipeId<TsPacket>) -> Self {
        Deframer {
            input,
            output,
            leftover: None,
            locked: false,
            locktime: 0,
            report_state: true,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn set_locked(&mut self, locked: bool, events: &mut Vec<Event>) {
        if locked != self.locked {
            info!(locked, "BBFRAME deframer");
            self.locked = locked;
            events.push(
                Report::Lock {
                    source: Source::Deframer,
                    locked,
                }
                .into(),
            );
        }
    }

    fn unlock(&mut self, events: &mut Vec<Event>) {
        self.leftover = None;
        self.locktime = 0;
        self.set_locked(false, events);
    }

    /// Process one frame, appending complete packets to `out`.
    fn deframe(&mut self, frame: &BbFrame, out: &mut Vec<TsPacket>, events: &mut Vec<Event>) {
        let Some(header) = BbHeader::parse(&frame.bytes) else {
            debug!("bad BBHEADER");
            self.unlock(events);
            return;
        };
        let dfl = usize::from(header.dfl);
        if dfl % 8 != 0 || header.syncd % 8 != 0 || dfl / 8 + BBHEADER_LEN > frame.bytes.len() {
            debug!(dfl, syncd = header.syncd, "unsupported BBFRAME");
            self.unlock(events);
            return;
        }
        if !header.is_transport_stream() {
            if header.stream_type() == STREAM_GC {
                trace!("generic stream frame ignored");
            } else {
                debug!(matype1 = header.matype1, "unrecognized BBFRAME");
            }
            return;
        }

        let data = &frame.bytes[BBHEADER_LEN..BBHEADER_LEN + dfl / 8];
        let syncd = usize::from(header.syncd) / 8;
        let (mut leftover, mut pos) = match self.leftover.take() {
            None => {
                debug!(start = syncd, "transport stream starts");
                (Vec::with_capacity(TS_PACKET_LEN), syncd)
            }
            Some(leftover) => {
                if syncd != TS_PACKET_LEN - leftover.len() {
                    debug!(syncd, leftover = leftover.len(), "lost a BBFRAME");
                    self.unlock(events);
                    return;
                }
                (leftover, 0)
            }
        };

        let mut good = 0u64;
        while pos + (TS_PACKET_LEN - leftover.len()) < data.len() {
            let take = TS_PACKET_LEN - leftover.len();
            let mut packet = TsPacket::default();
            packet.0[..leftover.len()].copy_from_slice(&leftover);
            packet.0[leftover.len()..].copy_from_slice(&data[pos..pos + take]);
            packet.0[0] = header.sync;
            if data[pos + take] == CRC8.checksum(&packet.0[1..]) {
                good += 1;
            } else {
                trace!(pid = packet.pid(), "packet CRC mismatch");
                packet.set_tei();
            }
            out.push(packet);
            pos += take;
            leftover.clear();
        }
        leftover.extend_from_slice(&data[pos..]);
        self.leftover = Some(leftover);

        if good > 0 {
            self.set_locked(true, events);
            self.locktime += good;
            events.push(
                Report::LockDuration {
                    source: Source::Deframer,
                    packets: self.locktime,
                }
                .into(),
            );
        }
    }
}

impl Stage for Deframer {
    fn name(&self) -> &'static str {
        "s2_deframer"
    }

    fn can_run(&self, pipes: &Pipes) -> bool {
        pipes.get(self.input).available_for_read() > 0
            && pipes.get(self.output).available_for_write() >= MAX_TS_PER_BBFRAME
    }

    fn run(&mut self, pipes: &mut Pipes, events: &mut Vec<Event>) {
        if self.report_state {
            self.report_state = false;
            events.push(
                Report::Lock {
                    source: Source::Deframer,
                    locked: false,
                }
                .into(),
            );
        }
        let mut packets = Vec::with_capacity(MAX_TS_PER_BBFRAME);
        while self.can_run(pipes) {
            let frame = std::mem::take(&mut pipes.get_mut(self.input).rd_mut()[0]);
            pipes.get_mut(self.input).read(1);
            packets.clear();
            self.deframe(&frame, &mut packets, events);
            let output = pipes.get_mut(self.output);
            output.wr()[..packets.len()].copy_from_slice(&packets);
            output.written(packets.len());
        }
    }
}

/// Packs transport stream packets into baseband frames of `kbch` bits, for loopback testing.
#[derive(Debug)]
pub struct BbFramer {
    data_len: usize,
    frame_len: usize,
    stream: VecDeque<u8>,
    /// Stream bytes already placed in frames.
    consumed: usize,
    crc: u8,
}

impl BbFramer {
    pub fn new(kbch: usize) -> Self {
        let frame_len = kbch / 8;
        BbFramer {
            data_len: frame_len - BBHEADER_LEN,
            frame_len,
            stream: VecDeque::new(),
            consumed: 0,
            crc: 0,
        }
    }

    pub fn push(&mut self, packet: &TsPacket) {
        self.stream.push_back(self.crc);
        self.stream.extend(&packet.0[1..]);
        self.crc = CRC8.checksum(&packet.0[1..]);
    }

    /// The next frame, once enough packets were pushed.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.stream.len() < self.data_len {
            return None;
        }
        let syncd = (TS_PACKET_LEN - self.consumed % TS_PACKET_LEN) % TS_PACKET_LEN;
        let header = BbHeader::transport_stream((self.data_len * 8) as u16, (syncd * 8) as u16);
        let mut frame = Vec::with_capacity(self.frame_len);
        frame.extend_from_slice(&header.to_bytes());
        frame.extend(self.stream.drain(..self.data_len));
        self.consumed += self.data_len;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dvbs2::{modcod::fec_info, Pls},
        settings::CodeRate,
    };

    fn packets(n: usize) -> Vec<TsPacket> {
        (0..n)
            .map(|i| {
                let mut p = TsPacket::default();
                p.0[0] = MPEG_SYNC;
                p.0[1] = 0x01;
                p.0[2] = 0x00;
                p.0[3] = 0x10 | (i & 0x0f) as u8;
                for (j, b) in p.0[4..].iter_mut().enumerate() {
                    *b = (i * 7 + j) as u8;
                }
                p
            })
            .collect()
    }

    fn run_frames(frames: Vec<Vec<u8>>) -> (Vec<TsPacket>, Vec<Event>) {
        let mut pipes = Pipes::new(1);
        let input = pipes.add("bbframes", frames.len());
        let output = pipes.add("ts", 1024);
        for bytes in frames {
            pipes
                .get_mut(input)
                .write(BbFrame {
                    pls: Pls::new(4, true, false),
                    bytes,
                })
                .unwrap();
        }
        let mut stage = Deframer::new(input, output);
        let mut events = Vec::new();
        stage.run(&mut pipes, &mut events);
        (pipes.get(output).rd().to_vec(), events)
    }

    #[test]
    fn test_header_crc() {
        let h = BbHeader::transport_stream(7032 - 80, 24);
        let mut bytes = h.to_bytes();
        assert_eq!(BbHeader::parse(&bytes), Some(h));
        bytes[4] ^= 1;
        assert_eq!(BbHeader::parse(&bytes), None);
    }

    #[test]
    fn test_packets_span_frames() {
        let kbch = fec_info(CodeRate::Fec12, true).unwrap().kbch;
        let sent = packets(40);
        let mut framer = BbFramer::new(kbch);
        let mut frames = Vec::new();
        for p in &sent {
            framer.push(p);
            while let Some(f) = framer.next_frame() {
                frames.push(f);
            }
        }
        assert!(frames.len() >= 8);

        let (got, events) = run_frames(frames);
        assert!(got.len() > 30);
        assert_eq!(got[..], sent[..got.len()]);
        assert!(got.iter().all(|p| !p.tei()));
        assert_eq!(
            events[0],
            Event::Report(Report::Lock {
                source: Source::Deframer,
                locked: false
            })
        );
        assert!(events.contains(&Event::Report(Report::Lock {
            source: Source::Deframer,
            locked: true
        })));
    }

    #[test]
    fn test_corrupt_packet_flagged() {
        let kbch = fec_info(CodeRate::Fec12, true).unwrap().kbch;
        let mut framer = BbFramer::new(kbch);
        for p in &packets(10) {
            framer.push(p);
        }
        let mut frame = framer.next_frame().unwrap();
        // first packet payload, the frame starts on a packet boundary
        frame[BBHEADER_LEN + 50] ^= 0xff;

        let (got, _) = run_frames(vec![frame]);
        assert!(got[0].tei());
        assert!(!got[1].tei());
    }

    #[test]
    fn test_lost_frame_unlocks() {
        let kbch = fec_info(CodeRate::Fec12, true).unwrap().kbch;
        let mut framer = BbFramer::new(kbch);
        for p in &packets(30) {
            framer.push(p);
        }
        let first = framer.next_frame().unwrap();
        let _lost = framer.next_frame().unwrap();
        let third = framer.next_frame().unwrap();

        let (_, events) = run_frames(vec![first, third]);
        assert_eq!(
            events.last(),
            Some(&Event::Report(Report::Lock {
                source: Source::Deframer,
                locked: false
            }))
        );
    }
}
