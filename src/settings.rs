//! Demodulator configuration.
//!
//! [Settings] is what a caller hands to [crate::Demodulator::apply_settings]. Most fields define the
//! shape of the processing graph and changing them forces a rebuild, see
//! [Settings::requires_rebuild]. The remaining fields (RF bandwidth, channel offset, UDP output)
//! only reconfigure the collaborator that owns them.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{Error, Result};

/// Largest accepted [Settings::rrc_rejection], the filter order grows linearly with it.
pub const MAX_RRC_REJECTION: u32 = 100;
/// Largest accepted [Settings::notch_filters].
pub const MAX_NOTCH_FILTERS: u32 = 32;
/// Largest accepted [Settings::buffer_factor].
pub const MAX_BUFFER_FACTOR: usize = 64;

/// Broadcast standard the graph is built for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Standard {
    #[default]
    DvbS,
    DvbS2,
}

/// Constellations understood by the receivers.
///
/// DVB-S only defines [Modulation::Bpsk] and [Modulation::Qpsk]; the others are accepted for
/// experimentation and by the DVB-S2 MODCOD signalling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modulation {
    Bpsk,
    #[default]
    Qpsk,
    Psk8,
    Apsk16,
    Apsk32,
    Apsk64e,
    Qam16,
    Qam64,
    Qam256,
    Unset,
}

impl Modulation {
    pub fn bits_per_symbol(&self) -> Option<usize> {
        match self {
            Self::Bpsk => Some(1),
            Self::Qpsk => Some(2),
            Self::Psk8 => Some(3),
            Self::Apsk16 | Self::Qam16 => Some(4),
            Self::Apsk32 => Some(5),
            Self::Apsk64e | Self::Qam64 => Some(6),
            Self::Qam256 => Some(8),
            Self::Unset => None,
        }
    }
}

/// Inner code rates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeRate {
    #[default]
    Fec12,
    Fec23,
    /// Rate 2/3 punctured with a period of 4 input bits.
    Fec46,
    Fec34,
    Fec56,
    Fec78,
    /// Non-standard rate used by some DVB-S transmitters.
    Fec45,
    Fec89,
    Fec910,
    Fec14,
    Fec13,
    Fec25,
    Fec35,
    Unset,
}

impl CodeRate {
    /// Numerator and denominator, `None` for [CodeRate::Unset].
    pub fn ratio(&self) -> Option<(u32, u32)> {
        let r = match self {
            Self::Fec12 => (1, 2),
            Self::Fec23 => (2, 3),
            Self::Fec46 => (4, 6),
            Self::Fec34 => (3, 4),
            Self::Fec56 => (5, 6),
            Self::Fec78 => (7, 8),
            Self::Fec45 => (4, 5),
            Self::Fec89 => (8, 9),
            Self::Fec910 => (9, 10),
            Self::Fec14 => (1, 4),
            Self::Fec13 => (1, 3),
            Self::Fec25 => (2, 5),
            Self::Fec35 => (3, 5),
            Self::Unset => return None,
        };
        Some(r)
    }
}

/// Symbol interpolator used by the receivers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SamplerKind {
    Nearest,
    Linear,
    /// Root-raised-cosine matched filter using [Settings::rolloff] and [Settings::rrc_rejection].
    #[default]
    Rrc,
}

/// DVB-S2 LDPC decoding strategy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LdpcMode {
    /// In-process hard-decision bit flipping, giving up after `max_bitflips` flips.
    BitFlip { max_bitflips: usize },
    /// Delegate to an external soft-decision decoder executable.
    Soft {
        tool: PathBuf,
        max_trials: u32,
        /// Number of helper processes per MODCOD.
        helpers: usize,
    },
}

impl Default for LdpcMode {
    fn default() -> Self {
        Self::BitFlip { max_bitflips: 10 }
    }
}

/// Transport stream re-transmission over UDP.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct UdpOutput {
    #[builder(default = false)]
    pub enabled: bool,
    #[builder(default = String::from("127.0.0.1"), setter(into))]
    pub address: String,
    #[builder(default = 8882)]
    pub port: u16,
}

impl Default for UdpOutput {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct Settings {
    #[builder(default)]
    pub standard: Standard,
    /// Symbols per second.
    #[builder(default = 1_000_000)]
    pub symbol_rate: u32,
    /// Constellation. For DVB-S2 this is only the initial guess, frames carry their own MODCOD.
    #[builder(default)]
    pub modulation: Modulation,
    #[builder(default)]
    pub code_rate: CodeRate,
    #[builder(default)]
    pub sampler: SamplerKind,
    /// Root-raised-cosine roll-off factor.
    #[builder(default = 0.35)]
    pub rolloff: f32,
    /// Out of band rejection of the RRC filter, drives the filter order.
    #[builder(default = 10)]
    pub rrc_rejection: u32,
    /// Number of adaptive notch filters, zero disables notching.
    #[builder(default = 0)]
    pub notch_filters: u32,
    /// Let the carrier drift outside of the initial capture range.
    #[builder(default = false)]
    pub allow_drift: bool,
    #[builder(default = false)]
    pub fast_lock: bool,
    /// Feed hard decisions instead of soft symbols to the inner decoder.
    #[builder(default = false)]
    pub hard_metric: bool,
    /// Use the Viterbi decoder instead of algebraic deconvolution (DVB-S).
    #[builder(default = false)]
    pub viterbi: bool,
    #[builder(default)]
    pub ldpc: LdpcMode,
    /// Bandwidth of the channel filter in Hz.
    #[builder(default = 2_000_000)]
    pub rf_bandwidth: u32,
    /// Channel offset from the input center frequency in Hz.
    #[builder(default = 0)]
    pub center_frequency: i64,
    /// Measurement reports per second.
    #[builder(default = 5.0)]
    pub report_rate: f32,
    /// Scales the capacity of every pipe.
    #[builder(default = 4)]
    pub buffer_factor: usize,
    #[builder(default)]
    pub udp: UdpOutput,
}

impl Default for Settings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Settings {
    /// Pipeline working rate, two samples per symbol.
    pub fn working_rate(&self) -> f64 {
        2.0 * self.symbol_rate as f64
    }

    /// `true` if switching from `self` to `other` invalidates the processing graph.
    pub fn requires_rebuild(&self, other: &Settings) -> bool {
        self.standard != other.standard
            || self.symbol_rate != other.symbol_rate
            || self.modulation != other.modulation
            || self.code_rate != other.code_rate
            || self.sampler != other.sampler
            || self.rolloff != other.rolloff
            || self.rrc_rejection != other.rrc_rejection
            || self.notch_filters != other.notch_filters
            || self.allow_drift != other.allow_drift
            || self.fast_lock != other.fast_lock
            || self.hard_metric != other.hard_metric
            || self.viterbi != other.viterbi
            || self.ldpc != other.ldpc
            || self.report_rate != other.report_rate
            || self.buffer_factor != other.buffer_factor
    }

    /// Check that a graph can be built from these settings.
    pub fn validate(&self) -> Result<()> {
        if self.symbol_rate == 0 {
            return Err(Error::Configuration("symbol rate must be positive".into()));
        }
        if !(self.rolloff > 0.0 && self.rolloff <= 1.0) {
            return Err(Error::Configuration(format!(
                "rolloff {} outside of (0, 1]",
                self.rolloff
            )));
        }
        if self.sampler == SamplerKind::Rrc && self.rrc_rejection == 0 {
            return Err(Error::Configuration(
                "RRC sampler requires a positive rejection".into(),
            ));
        }
        if self.rrc_rejection > MAX_RRC_REJECTION {
            return Err(Error::Configuration(format!(
                "RRC rejection {} above {MAX_RRC_REJECTION}",
                self.rrc_rejection
            )));
        }
        if self.notch_filters > MAX_NOTCH_FILTERS {
            return Err(Error::Configuration(format!(
                "{} notch filters, at most {MAX_NOTCH_FILTERS} supported",
                self.notch_filters
            )));
        }
        if !(1..=MAX_BUFFER_FACTOR).contains(&self.buffer_factor) {
            return Err(Error::Configuration(format!(
                "buffer factor {} outside of 1..={MAX_BUFFER_FACTOR}",
                self.buffer_factor
            )));
        }
        if !(self.report_rate > 0.0) {
            return Err(Error::Configuration("report rate must be positive".into()));
        }

        match self.standard {
            Standard::DvbS => {
                if self.modulation == Modulation::Unset {
                    return Err(Error::Configuration("DVB-S requires a modulation".into()));
                }
                match self.code_rate {
                    CodeRate::Fec12
                    | CodeRate::Fec23
                    | CodeRate::Fec46
                    | CodeRate::Fec34
                    | CodeRate::Fec56
                    | CodeRate::Fec78
                    | CodeRate::Fec45 => {}
                    other => {
                        return Err(Error::Configuration(format!(
                            "code rate {other:?} is not available for DVB-S"
                        )))
                    }
                }
            }
            Standard::DvbS2 => match &self.ldpc {
                LdpcMode::BitFlip { .. } => {}
                LdpcMode::Soft {
                    tool,
                    max_trials,
                    helpers,
                } => {
                    if *max_trials == 0 || *helpers == 0 {
                        return Err(Error::Configuration(
                            "soft LDPC decoding requires at least one trial and one helper".into(),
                        ));
                    }
                    check_executable(tool)?;
                }
            },
        }
        Ok(())
    }
}

/// Verify `path` is a regular file the current user may execute.
pub fn check_executable(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|e| {
        Error::Configuration(format!("LDPC tool {}: {e}", path.display()))
    })?;
    if !meta.is_file() {
        return Err(Error::Configuration(format!(
            "LDPC tool {} is not a file",
            path.display()
        )));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(Error::Configuration(format!(
                "LDPC tool {} is not executable",
                path.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test_case(Settings::builder().rrc_rejection(MAX_RRC_REJECTION + 1).build(); "rrc rejection")]
    #[test_case(Settings::builder().rrc_rejection(1_000_000).build(); "huge rrc rejection")]
    #[test_case(Settings::builder().notch_filters(MAX_NOTCH_FILTERS + 1).build(); "notch filters")]
    #[test_case(Settings::builder().buffer_factor(0).build(); "no buffers")]
    #[test_case(Settings::builder().buffer_factor(MAX_BUFFER_FACTOR + 1).build(); "buffer factor")]
    fn test_rejects_out_of_range(settings: Settings) {
        assert!(matches!(settings.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_accepts_limits() {
        Settings::builder()
            .rrc_rejection(MAX_RRC_REJECTION)
            .notch_filters(MAX_NOTCH_FILTERS)
            .buffer_factor(MAX_BUFFER_FACTOR)
            .build()
            .validate()
            .unwrap();
    }

    #[test]
    fn test_dvbs_rejects_s2_only_rates() {
        let settings = Settings::builder().code_rate(CodeRate::Fec35).build();
        assert!(matches!(settings.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_rebuild_classification() {
        let a = Settings::default();
        let mut b = a.clone();
        b.udp.enabled = true;
        b.rf_bandwidth = 3_000_000;
        b.center_frequency = 12_000;
        assert!(!a.requires_rebuild(&b));

        b.viterbi = true;
        assert!(a.requires_rebuild(&b));
    }

    #[test]
    fn test_soft_ldpc_requires_tool() {
        let settings = Settings::builder()
            .standard(Standard::DvbS2)
            .ldpc(LdpcMode::Soft {
                tool: PathBuf::from("/nonexistent/ldpc_tool"),
                max_trials: 25,
                helpers: 2,
            })
            .build();
        assert!(matches!(settings.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_json_roundtrip_with_missing_fields() {
        let settings: Settings =
            serde_json::from_str(r#"{"standard": "DvbS2", "symbol_rate": 333000}"#).unwrap();
        assert_eq!(settings.standard, Standard::DvbS2);
        assert_eq!(settings.symbol_rate, 333000);
        assert_eq!(settings.rolloff, 0.35);
    }
}
