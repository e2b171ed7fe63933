//! Forney convolutional interleaving, I=12 branches with a unit delay of M=17 bytes.
use crate::{
    packet::{RsPacket, RS_PACKET_LEN},
    pipe::{PipeId, Pipes},
    report::Event,
    scheduler::Stage,
};

pub const BRANCHES: usize = 12;
pub const UNIT_DELAY: usize = 17;
/// Lookahead the deinterleaver needs on top of the packet being produced.
const SPAN: usize = UNIT_DELAY * (BRANCHES - 1) * BRANCHES;

/// Byte oriented interleaver as found in a transmitter, branch `j` delays by `j * M` of its bytes.
///
/// Expects the stream to start on a sync byte so sync bytes always take branch 0.
#[derive(Clone, Debug)]
pub struct Interleaver {
    fifos: Vec<std::collections::VecDeque<u8>>,
    branch: usize,
}

impl Default for Interleaver {
    fn default() -> Self {
        Self {
            fifos: (0..BRANCHES)
                .map(|j| std::iter::repeat(0u8).take(j * UNIT_DELAY).collect())
                .collect(),
            branch: 0,
        }
    }
}

impl Interleaver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) -> u8 {
        let fifo = &mut self.fifos[self.branch];
        self.branch = (self.branch + 1) % BRANCHES;
        fifo.push_back(byte);
        fifo.pop_front().unwrap_or(byte)
    }

    pub fn interleave(&mut self, packet: &RsPacket) -> [u8; RS_PACKET_LEN] {
        let mut out = [0u8; RS_PACKET_LEN];
        for (o, b) in out.iter_mut().zip(packet.0.iter()) {
            *o = self.push(*b);
        }
        out
    }
}

/// Rebuild RS packets from the sync aligned byte stream.
pub struct Deinterleaver {
    input: PipeId<u8>,
    output: PipeId<RsPacket>,
}

impl Deinterleaver {
    pub fn new(input: PipeId<u8>, output: PipeId<RsPacket>) -> Self {
        Self { input, output }
    }
}

impl Stage for Deinterleaver {
    fn name(&self) -> &'static str {
        "deinterleaver"
    }

    fn can_run(&self, pipes: &Pipes) -> bool {
        pipes.get(self.input).available_for_read() >= SPAN + RS_PACKET_LEN
            && pipes.get(self.output).available_for_write() >= 1
    }

    fn run(&mut self, pipes: &mut Pipes, _events: &mut Vec<Event>) {
        pipes.with(self.input, self.output, |input, output| {
            while input.available_for_read() >= SPAN + RS_PACKET_LEN
                && output.available_for_write() >= 1
            {
                let window = input.rd();
                let mut packet = RsPacket::default();
                // complementary delay of branch i % 12
                let mut delay = UNIT_DELAY * (BRANCHES - 1);
                for (i, b) in packet.0.iter_mut().enumerate() {
                    *b = window[SPAN + i - delay * BRANCHES];
                    delay = (delay + RS_PACKET_LEN - UNIT_DELAY) % RS_PACKET_LEN;
                }
                input.read(RS_PACKET_LEN);
                output.wr()[0] = packet;
                output.written(1);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_roundtrip_after_latency() {
        let mut rng = StdRng::seed_from_u64(5);
        let packets: Vec<RsPacket> = (0..40)
            .map(|_| {
                let mut p = RsPacket::default();
                rng.fill(&mut p.0[..]);
                p
            })
            .collect();

        let mut interleaver = Interleaver::new();
        let mut pipes = Pipes::new(1);
        let input = pipes.add("bytes", 40 * RS_PACKET_LEN);
        let output = pipes.add("packets", 40);
        for p in &packets {
            let bytes = interleaver.interleave(p);
            let pipe = pipes.get_mut(input);
            pipe.wr()[..RS_PACKET_LEN].copy_from_slice(&bytes);
            pipe.written(RS_PACKET_LEN);
        }

        let mut stage = Deinterleaver::new(input, output);
        assert!(stage.can_run(&pipes));
        stage.run(&mut pipes, &mut Vec::default());

        // the last 11 packets stay buffered until more bytes arrive
        let out = pipes.get(output).rd();
        assert_eq!(out.len(), 40 - 11);
        assert_eq!(out, &packets[..out.len()]);
    }
}
