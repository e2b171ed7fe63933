//! Side channel output of the processing graph.
//!
//! Stages push [Event]s while they run; the [crate::Demodulator] drains them after every scheduler
//! step and hands them to subscribers.
use serde::{Deserialize, Serialize};

use crate::settings::{CodeRate, Modulation};

/// The possible integrity dispositions of a decoded packet or frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Integrity {
    /// Data did not require correction.
    Ok,
    /// Data was successfully corrected.
    Corrected,
    /// Not correctable, too many errors for the code.
    Uncorrectable,
    /// The decoder did not produce a result, e.g., a failed external helper.
    Failed,
}

impl Integrity {
    /// Return `true` if [Self::Ok] or [Self::Corrected]. Any other value will return `false`.
    pub fn ok(&self) -> bool {
        matches!(self, Self::Ok | Self::Corrected)
    }
}

/// Error correction statistics for one RS packet or one LDPC/BCH frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecCounters {
    pub integrity: Integrity,
    /// Number of code bits examined.
    pub bits_processed: usize,
    /// Number of bits flipped back, meaningful only when `integrity.ok()`.
    pub bits_corrected: usize,
}

impl FecCounters {
    pub fn new(bits_processed: usize, bits_corrected: Option<usize>) -> Self {
        match bits_corrected {
            Some(0) => Self {
                integrity: Integrity::Ok,
                bits_processed,
                bits_corrected: 0,
            },
            Some(n) => Self {
                integrity: Integrity::Corrected,
                bits_processed,
                bits_corrected: n,
            },
            None => Self {
                integrity: Integrity::Uncorrectable,
                bits_processed,
                bits_corrected: 0,
            },
        }
    }

    /// The decoder could not be run at all.
    pub fn failed(bits_processed: usize) -> Self {
        Self {
            integrity: Integrity::Failed,
            bits_processed,
            bits_corrected: 0,
        }
    }
}

/// Stage a lock or FEC report originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    /// DVB-S2 PL frame synchronization.
    PlFrame,
    MpegSync,
    ReedSolomon,
    Deframer,
    Ldpc,
}

/// Periodic measurements and state changes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Report {
    /// Carrier to noise ratio in dB.
    Cnr(f32),
    /// Modulation error ratio in dB.
    Mer(f32),
    /// Carrier frequency error in Hz.
    FrequencyError(f32),
    /// RMS amplitude of the symbols before gain control.
    SignalStrength(f32),
    /// Mean power of the channel samples in dB.
    ChannelPower(f32),
    Lock { source: Source, locked: bool },
    /// Packets decoded since lock was acquired.
    LockDuration { source: Source, packets: u64 },
    Fec { source: Source, counters: FecCounters },
}

/// MODCOD observed in the DVB-S2 physical layer signalling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModcodChange {
    pub modulation: Modulation,
    pub code_rate: CodeRate,
    /// Raw MODCOD value, 1 to 28.
    pub modcod: u8,
    pub short_frames: bool,
    pub pilots: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, derive_more::From)]
pub enum Event {
    Report(Report),
    Modcod(ModcodChange),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_disposition() {
        assert_eq!(FecCounters::new(1632, Some(0)).integrity, Integrity::Ok);
        let c = FecCounters::new(1632, Some(3));
        assert_eq!(c.integrity, Integrity::Corrected);
        assert_eq!(c.bits_corrected, 3);
        assert!(!FecCounters::new(1632, None).integrity.ok());
    }
}
