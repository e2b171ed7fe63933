//! Slots to soft bits: demapping and bit deinterleaving of one PL frame.
use tracing::{debug, warn};

use crate::{
    constellation::Constellation,
    pipe::{PipeId, Pipes},
    report::Event,
    scheduler::Stage,
    settings::{CodeRate, Modulation},
    Sample,
};

use super::{modcod::FrameFormat, FecFrame, PlSlot, SLOT_LEN};

/// Converts squared distances into LLR units.
const LLR_SCALE: f32 = 32.0;

/// Column of bit `b` of a symbol in the block interleaver.
fn column(modulation: Modulation, rate: CodeRate, bps: usize, b: usize) -> usize {
    if modulation == Modulation::Psk8 && rate == CodeRate::Fec35 {
        bps - 1 - b
    } else {
        b
    }
}

/// Demap and deinterleave the data symbols of a frame into `llrs`.
///
/// QPSK is not interleaved. Other constellations were written column-wise into a block of
/// `frame_bits / bps` rows and read row-wise, one symbol per row.
pub fn deinterleave(
    format: &FrameFormat,
    constellation: &Constellation,
    symbols: impl Iterator<Item = Sample>,
    llrs: &mut [i8],
) {
    let bps = constellation.bits_per_symbol();
    let rows = llrs.len() / bps;
    let mut scratch = [0i8; 8];
    for (k, s) in symbols.enumerate().take(rows) {
        constellation.llrs(s, LLR_SCALE, &mut scratch);
        if bps == 2 {
            llrs[2 * k] = scratch[0];
            llrs[2 * k + 1] = scratch[1];
            continue;
        }
        for (b, llr) in scratch[..bps].iter().enumerate() {
            let col = column(format.modcod.modulation, format.modcod.code_rate, bps, b);
            llrs[col * rows + k] = *llr;
        }
    }
}

/// Inverse of [deinterleave] on hard bits, producing constellation labels.
pub fn interleave(format: &FrameFormat, bits: &[u8]) -> Vec<u8> {
    let bps = format.modcod.bits_per_symbol();
    let rows = bits.len() / bps;
    (0..rows)
        .map(|k| {
            (0..bps).fold(0u8, |acc, b| {
                let bit = if bps == 2 {
                    bits[2 * k + b]
                } else {
                    bits[column(format.modcod.modulation, format.modcod.code_rate, bps, b) * rows + k]
                };
                (acc << 1) | (bit & 1)
            })
        })
        .collect()
}

/// Collects the slots of a frame and emits its [FecFrame].
pub struct SlotDeinterleaver {
    input: PipeId<PlSlot>,
    output: PipeId<FecFrame>,
    constellations: Vec<Option<Constellation>>,
}

impl SlotDeinterleaver {
    pub fn new(input: PipeId<PlSlot>, output: PipeId<FecFrame>) -> Self {
        SlotDeinterleaver {
            input,
            output,
            constellations: vec![None; 32],
        }
    }

    fn constellation(&mut self, format: &FrameFormat) -> &Constellation {
        self.constellations[format.pls.modcod as usize & 31]
            .get_or_insert_with(|| format.modcod.constellation())
    }
}

impl Stage for SlotDeinterleaver {
    fn name(&self) -> &'static str {
        "s2_deinterleaver"
    }

    fn can_run(&self, pipes: &Pipes) -> bool {
        pipes.get(self.input).available_for_read() > 0
            && pipes.get(self.output).available_for_write() > 0
    }

    fn run(&mut self, pipes: &mut Pipes, _events: &mut Vec<Event>) {
        let (input, output) = (self.input, self.output);
        loop {
            if pipes.get(output).available_for_write() == 0 {
                return;
            }
            let (skip, format) = {
                let slots = pipes.get(input).rd();
                let Some(first) = slots.first() else {
                    return;
                };
                // resynchronize on the next header
                let skip = slots.iter().position(|s| s.is_header).unwrap_or(slots.len());
                if skip > 0 {
                    (skip, None)
                } else {
                    match FrameFormat::new(first.pls) {
                        Some(format) if slots.len() > format.slots => (0, Some(format)),
                        Some(_) => return,
                        None => (1, None),
                    }
                }
            };
            let Some(format) = format else {
                if skip > 0 {
                    debug!(skip, "slots without frame header");
                } else {
                    warn!("undecodable frame header");
                }
                pipes.get_mut(input).read(skip.max(1));
                continue;
            };

            let mut llrs = vec![0i8; format.pls.frame_bits()];
            let constellation = self.constellation(&format).clone();
            let slots = &pipes.get(input).rd()[1..=format.slots];
            let symbols = slots.iter().flat_map(|s| s.symbols.iter().copied());
            deinterleave(&format, &constellation, symbols, &mut llrs);
            debug_assert_eq!(format.slots * SLOT_LEN * constellation.bits_per_symbol(), llrs.len());

            pipes.get_mut(input).read(1 + format.slots);
            let frame = FecFrame {
                pls: format.pls,
                llrs,
            };
            if pipes.get_mut(output).write(frame).is_err() {
                return;
            }
        }
    }
}
