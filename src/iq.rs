//! Interleaved IQ sample encodings found in recordings and SDR streams.
use serde::{Deserialize, Serialize};

use crate::{Error, Result, Sample};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// Little endian 32 bit floats.
    #[default]
    Cf32,
    /// Little endian signed 16 bit integers, full scale 32768.
    Cs16,
    /// Unsigned bytes centered on 127.5, as produced by RTL-SDR dongles.
    Cu8,
}

impl SampleFormat {
    /// Bytes per complex sample.
    pub fn sample_len(&self) -> usize {
        match self {
            SampleFormat::Cf32 => 8,
            SampleFormat::Cs16 => 4,
            SampleFormat::Cu8 => 2,
        }
    }

    /// Decode as many whole samples as `bytes` holds, appending them to `out`. Returns the number
    /// of bytes consumed; a trailing partial sample is left for the next call.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if `bytes` is shorter than one sample.
    pub fn decode(&self, bytes: &[u8], out: &mut Vec<Sample>) -> Result<usize> {
        let len = self.sample_len();
        if bytes.len() < len {
            return Err(Error::NotEnoughData {
                actual: bytes.len(),
                minimum: len,
            });
        }
        let chunks = bytes.chunks_exact(len);
        out.reserve(chunks.len());
        for c in chunks {
            let s = match self {
                SampleFormat::Cf32 => Sample::new(
                    f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                    f32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                ),
                SampleFormat::Cs16 => Sample::new(
                    f32::from(i16::from_le_bytes([c[0], c[1]])) / 32768.0,
                    f32::from(i16::from_le_bytes([c[2], c[3]])) / 32768.0,
                ),
                SampleFormat::Cu8 => Sample::new(
                    (f32::from(c[0]) - 127.5) / 128.0,
                    (f32::from(c[1]) - 127.5) / 128.0,
                ),
            };
            out.push(s);
        }
        Ok(bytes.len() / len * len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(SampleFormat::Cf32, "0000803f000000bf", (1.0, -0.5); "cf32")]
    #[test_case(SampleFormat::Cs16, "00400080", (0.5, -1.0); "cs16")]
    #[test_case(SampleFormat::Cu8, "ff00", (0.99609375, -0.99609375); "cu8")]
    fn test_decode(format: SampleFormat, input: &str, expected: (f32, f32)) {
        let mut bytes = hex::decode(input).unwrap();
        // a partial sample stays behind
        bytes.push(0);
        let mut out = Vec::new();
        let used = format.decode(&bytes, &mut out).unwrap();
        assert_eq!(used, format.sample_len());
        assert_eq!(out, vec![Sample::new(expected.0, expected.1)]);
    }

    #[test]
    fn test_short_input() {
        let mut out = Vec::new();
        let err = SampleFormat::Cs16.decode(&[1, 2], &mut out);
        assert!(matches!(
            err,
            Err(Error::NotEnoughData {
                actual: 2,
                minimum: 4
            })
        ));
    }
}
