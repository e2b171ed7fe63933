//! Assembly of the processing [Graph] for a [Settings].
use std::sync::Arc;

use tracing::{debug, info, info_span, warn};

use crate::{
    constellation::Constellation,
    dsp::Sampler,
    dvbs::{
        convolutional::puncture_spec, deconvolution::Deconvolver, hypotheses,
        interleaver::Deinterleaver, mpeg_sync::MpegSync, randomizer::Derandomizer,
        reed_solomon::RsDecoder, viterbi::ViterbiDecoder, SyncFeedback,
    },
    dvbs2::{
        deframer::{Deframer, MAX_TS_PER_BBFRAME},
        deinterleaver::SlotDeinterleaver,
        fecdec::{BitFlipDecoder, SoftDecoder},
        frame_receiver::{FrameReceiver, MAX_SLOTS},
        helper::HelperConfig,
        ldpc::{GeneratedCodebook, LdpcCodebook},
    },
    notch::{NotchCnr, NOTCH_FFT},
    packet::RS_PACKET_LEN,
    pipe::Pipes,
    receiver::{ConstellationReceiver, ReceiverConfig},
    scheduler::{Graph, Stage},
    settings::{LdpcMode, Modulation, Settings, Standard},
    Result,
};

/// Samples moved per scheduler pass at buffer factor 1.
const BASE_CHUNK: usize = 4096;
/// Bytes the DVB-S deinterleaver looks ahead.
const DEINTERLEAVER_SPAN: usize = 17 * 11 * 12 + RS_PACKET_LEN;
/// Frames handed to an external LDPC helper per batch.
pub const DEFAULT_HELPER_BATCH: usize = 16;
/// The pipeline always runs at two samples per symbol.
const OMEGA: f32 = 2.0;

/// Builds the [Graph] of one configuration generation.
///
/// ```
/// use dvbdemod::{builder::GraphBuilder, settings::Settings};
///
/// let graph = GraphBuilder::new(Settings::default(), 1).build().unwrap();
/// assert_eq!(graph.generation(), 1);
/// ```
pub struct GraphBuilder {
    settings: Settings,
    generation: u64,
    codebook: Arc<dyn LdpcCodebook>,
    helper_batch: usize,
}

impl GraphBuilder {
    pub fn new(settings: Settings, generation: u64) -> Self {
        GraphBuilder {
            settings,
            generation,
            codebook: Arc::new(GeneratedCodebook),
            helper_batch: DEFAULT_HELPER_BATCH,
        }
    }

    /// LDPC parity tables used by the bit flipping decoder. Defaults to [GeneratedCodebook].
    pub fn codebook(mut self, codebook: Arc<dyn LdpcCodebook>) -> Self {
        self.codebook = codebook;
        self
    }

    /// Frames per batch for external LDPC helpers.
    pub fn helper_batch(mut self, frames: usize) -> Self {
        self.helper_batch = frames.max(1);
        self
    }

    /// Samples between two measurement reports.
    fn meas_decimation(&self) -> usize {
        ((self.settings.working_rate() / f64::from(self.settings.report_rate)) as usize).max(1)
    }

    fn receiver_config(&self, pll_adjustment: f32) -> ReceiverConfig {
        ReceiverConfig::builder()
            .sample_rate(self.settings.working_rate() as f32)
            .omega(OMEGA)
            .pll_adjustment(pll_adjustment)
            .allow_drift(self.settings.allow_drift)
            .fast_lock(self.settings.fast_lock)
            .hard_metric(self.settings.hard_metric)
            .meas_decimation(self.meas_decimation())
            .build()
    }

    fn sampler(&self) -> Sampler {
        Sampler::new(
            self.settings.sampler,
            OMEGA,
            self.settings.rolloff,
            self.settings.rrc_rejection,
        )
    }

    /// # Errors
    /// [crate::Error::Configuration] if the settings are invalid or describe a combination no
    /// decoder exists for.
    pub fn build(self) -> Result<Graph> {
        self.settings.validate()?;
        let span = info_span!(
            "build",
            generation = self.generation,
            standard = ?self.settings.standard
        );
        let _guard = span.enter();
        let graph = match self.settings.standard {
            Standard::DvbS => self.build_dvbs()?,
            Standard::DvbS2 => self.build_dvbs2()?,
        };
        info!(stages = ?graph.stage_names(), "graph ready");
        Ok(graph)
    }

    fn build_dvbs(&self) -> Result<Graph> {
        let s = &self.settings;
        let factor = s.buffer_factor;
        if !matches!(s.modulation, Modulation::Bpsk | Modulation::Qpsk) {
            warn!(modulation = ?s.modulation, "non-standard constellation for DVB-S");
        }
        let constellation = Constellation::new(s.modulation)?;
        let bps = constellation.bits_per_symbol();
        let spec = puncture_spec(s.code_rate, bps)?;
        let pll_adjustment = if s.viterbi { 1.0 / 6.0 } else { 1.0 };
        let sampler = self.sampler();
        let readahead = sampler.readahead();

        let mut pipes = Pipes::new(self.generation);
        let chunk = BASE_CHUNK.max(NOTCH_FFT);
        let input = pipes.add("baseband", factor * chunk + readahead);
        let filtered = pipes.add("filtered", factor * chunk + 128 + readahead);
        let symbols = pipes.add("symbols", factor * BASE_CHUNK);
        let raw = pipes.add("deconvolved", factor * BASE_CHUNK);
        let synced = pipes.add("mpeg_synced", DEINTERLEAVER_SPAN + factor * 8 * RS_PACKET_LEN);
        let rs_packets = pipes.add("rs_packets", factor * 16);
        let decoded = pipes.add("rs_decoded", factor * 16);
        let output = pipes.add("transport_stream", factor * 64);

        let feedback = SyncFeedback::default();
        let mut stages: Vec<Box<dyn Stage>> = vec![
            Box::new(NotchCnr::new(
                input,
                filtered,
                s.notch_filters,
                self.meas_decimation(),
            )),
            Box::new(ConstellationReceiver::new(
                filtered,
                symbols,
                sampler,
                constellation.clone(),
                self.receiver_config(pll_adjustment),
            )),
        ];
        if s.viterbi {
            stages.push(Box::new(ViterbiDecoder::new(
                symbols,
                raw,
                constellation.clone(),
                spec,
                hypotheses(&constellation),
                feedback.clone(),
                s.fast_lock,
            )?));
        } else {
            stages.push(Box::new(Deconvolver::new(
                symbols,
                raw,
                spec,
                bps,
                hypotheses(&constellation),
                feedback.clone(),
                s.fast_lock,
            )?));
        }
        stages.push(Box::new(MpegSync::new(raw, synced, feedback, s.fast_lock)));
        stages.push(Box::new(Deinterleaver::new(synced, rs_packets)));
        stages.push(Box::new(RsDecoder::new(rs_packets, decoded)));
        stages.push(Box::new(Derandomizer::new(decoded, output)));
        debug!(rate = ?spec.rate, bps, viterbi = s.viterbi, "DVB-S chain");

        Ok(Graph::new(Standard::DvbS, pipes, stages, input, output))
    }

    fn build_dvbs2(&self) -> Result<Graph> {
        let s = &self.settings;
        let factor = s.buffer_factor;
        let sampler = self.sampler();
        let frame_input = FrameReceiver::min_input(OMEGA, sampler.readahead());
        let chunk = BASE_CHUNK.max(NOTCH_FFT);

        let mut pipes = Pipes::new(self.generation);
        let input = pipes.add("baseband", factor * chunk);
        let filtered = pipes.add("filtered", frame_input + factor * chunk);
        let slots = pipes.add("pl_slots", (MAX_SLOTS + 1) * factor);
        let fec_frames = pipes.add("fec_frames", 2 * factor);
        let bb_frames = pipes.add("bb_frames", 2 * factor);
        let output = pipes.add("transport_stream", 2 * factor * MAX_TS_PER_BBFRAME);

        let fecdec: Box<dyn Stage> = match &s.ldpc {
            LdpcMode::BitFlip { max_bitflips } => Box::new(BitFlipDecoder::new(
                fec_frames,
                bb_frames,
                self.codebook.clone(),
                *max_bitflips,
            )),
            LdpcMode::Soft {
                tool,
                max_trials,
                helpers,
            } => Box::new(SoftDecoder::new(
                fec_frames,
                bb_frames,
                HelperConfig {
                    tool: tool.clone(),
                    max_trials: *max_trials,
                    helpers: *helpers,
                    batch_size: self.helper_batch,
                },
            )),
        };
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(NotchCnr::new(
                input,
                filtered,
                s.notch_filters,
                self.meas_decimation(),
            )),
            Box::new(FrameReceiver::new(
                filtered,
                slots,
                sampler,
                self.receiver_config(1.0),
            )),
            Box::new(SlotDeinterleaver::new(slots, fec_frames)),
            fecdec,
            Box::new(Deframer::new(bb_frames, output)),
        ];
        debug!(ldpc = ?s.ldpc, "DVB-S2 chain");

        Ok(Graph::new(Standard::DvbS2, pipes, stages, input, output))
    }
}
