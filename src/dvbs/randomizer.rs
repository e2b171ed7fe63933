//! Energy dispersal.
//!
//! DVB-S and the DVB-S2 baseband scrambler share the PRBS `1 + x^14 + x^15` loaded with
//! `100101010000000`. DVB-S restarts the sequence every 8 packets, skips the sync bytes and inverts
//! the first sync byte of each group.
use tracing::{debug, trace};

use crate::{
    packet::{TsPacket, MPEG_SYNC, MPEG_SYNC_CORRUPTED, MPEG_SYNC_INV, TS_PACKET_LEN},
    pipe::{PipeId, Pipes},
    report::Event,
    scheduler::Stage,
};

/// PRBS register initial value, bit order reversed.
const PRBS_INIT: u16 = 0o251;
/// Packets per PRBS period.
const PERIOD_PACKETS: usize = 8;

/// First `len` bytes of the energy dispersal PRBS, most significant bit first.
pub fn prbs_bytes(len: usize) -> Vec<u8> {
    let mut st = PRBS_INIT;
    (0..len)
        .map(|_| {
            let mut out = 0u8;
            for _ in 0..8 {
                let bit = ((st >> 13) ^ (st >> 14)) & 1;
                out = (out << 1) | bit as u8;
                st = (st << 1) | bit;
            }
            out
        })
        .collect()
}

/// XOR pattern for a group of 8 packets.
fn dispersal_pattern() -> Vec<u8> {
    let prbs = prbs_bytes(TS_PACKET_LEN * PERIOD_PACKETS);
    let mut pattern = vec![0u8; TS_PACKET_LEN * PERIOD_PACKETS];
    // the sequence runs through the sync bytes without being applied to them
    for (i, p) in pattern.iter_mut().enumerate().skip(1) {
        if i % TS_PACKET_LEN != 0 {
            *p = prbs[i - 1];
        }
    }
    pattern[0] = 0xff;
    pattern
}

/// Stateful XOR with the energy dispersal pattern, its own inverse.
#[derive(Clone, Debug)]
pub struct Randomizer {
    pattern: Vec<u8>,
    pos: usize,
}

impl Default for Randomizer {
    fn default() -> Self {
        Self {
            pattern: dispersal_pattern(),
            pos: 0,
        }
    }
}

impl Randomizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart at the first packet of a group.
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Whether the next packet is the first of a group.
    pub fn at_group_start(&self) -> bool {
        self.pos == 0
    }

    pub fn apply(&mut self, packet: &mut [u8; TS_PACKET_LEN]) {
        let pattern = &self.pattern[self.pos..self.pos + TS_PACKET_LEN];
        for (b, p) in packet.iter_mut().zip(pattern) {
            *b ^= p;
        }
        self.pos = (self.pos + TS_PACKET_LEN) % self.pattern.len();
    }
}

/// Randomize a sequence of packets starting a new group, as a transmitter does.
pub fn randomize(packets: &mut [TsPacket]) {
    let mut r = Randomizer::new();
    for p in packets.iter_mut() {
        r.apply(&mut p.0);
    }
}

/// Undo energy dispersal on Reed-Solomon decoded packets.
///
/// The pattern is re-aligned on every inverted sync byte. Packets that do not come out with a
/// valid sync byte are dropped.
pub struct Derandomizer {
    input: PipeId<TsPacket>,
    output: PipeId<TsPacket>,
    randomizer: Randomizer,
    dropped: u64,
}

impl Derandomizer {
    pub fn new(input: PipeId<TsPacket>, output: PipeId<TsPacket>) -> Self {
        Self {
            input,
            output,
            randomizer: Randomizer::new(),
            dropped: 0,
        }
    }

    /// Packets discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Stage for Derandomizer {
    fn name(&self) -> &'static str {
        "derandomizer"
    }

    fn can_run(&self, pipes: &Pipes) -> bool {
        pipes.get(self.input).available_for_read() >= 1
            && pipes.get(self.output).available_for_write() >= 1
    }

    fn run(&mut self, pipes: &mut Pipes, _events: &mut Vec<Event>) {
        let randomizer = &mut self.randomizer;
        let dropped = &mut self.dropped;
        pipes.with(self.input, self.output, |input, output| {
            while input.available_for_read() >= 1 && output.available_for_write() >= 1 {
                let mut packet = input.rd()[0];
                input.read(1);

                let sync = packet.sync();
                if (sync == MPEG_SYNC_INV || sync == MPEG_SYNC_INV ^ MPEG_SYNC_CORRUPTED)
                    && !randomizer.at_group_start()
                {
                    debug!("derandomizer resynchronizing");
                    randomizer.reset();
                }
                randomizer.apply(&mut packet.0);

                if packet.sync() == MPEG_SYNC {
                    output.wr()[0] = packet;
                    output.written(1);
                } else {
                    if packet.sync() != MPEG_SYNC ^ MPEG_SYNC_CORRUPTED {
                        trace!(sync = packet.sync(), "unexpected sync byte");
                    }
                    *dropped += 1;
                }
            }
        });
    }
}
