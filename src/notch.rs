//! Narrowband interference removal and carrier to noise estimation.
use std::sync::Arc;

use rustfft::{Fft, FftPlanner};
use tracing::debug;

use crate::{
    dsp::expj,
    pipe::{Pipe, PipeId, Pipes},
    report::{Event, Report},
    scheduler::Stage,
    Sample,
};

pub const NOTCH_FFT: usize = 4096;
/// Samples between peak searches.
const NOTCH_DECIMATION: usize = 1024 * 4096;
/// Tone tracking loop gain.
const NOTCH_K: f32 = 0.002;
const CNR_FFT: usize = 4096;
/// Spectrum averaging factor.
const CNR_KAVG: f32 = 0.1;

struct NotchSlot {
    bin: usize,
    estimate: Sample,
    /// `expj[i] = e^(j*2*pi*bin*i/N)`
    expj: Vec<Sample>,
}

/// Cancels the strongest spectral lines of the input.
///
/// The spectrum is searched for peaks every [NOTCH_DECIMATION] samples. Each peak gets a slot that
/// tracks the complex amplitude of the tone at its bin and subtracts it from the signal.
pub struct AutoNotch {
    fft: Arc<dyn Fft<f32>>,
    slots: Vec<Option<NotchSlot>>,
    phase: usize,
    gain: f32,
    agc_rms_setpoint: Option<f32>,
}

impl AutoNotch {
    pub fn new(nslots: usize, agc_rms_setpoint: Option<f32>) -> Self {
        AutoNotch {
            fft: FftPlanner::new().plan_fft_forward(NOTCH_FFT),
            slots: (0..nslots).map(|_| None).collect(),
            // search on the first block
            phase: NOTCH_DECIMATION,
            gain: 1.0,
            agc_rms_setpoint,
        }
    }

    pub fn block_len(&self) -> usize {
        NOTCH_FFT
    }

    /// Bins currently being cancelled.
    pub fn bins(&self) -> Vec<usize> {
        self.slots.iter().flatten().map(|s| s.bin).collect()
    }

    fn detect(&mut self, block: &[Sample]) {
        let m2: f32 = block.iter().map(|s| s.norm_sqr()).sum();
        if let Some(setpoint) = self.agc_rms_setpoint {
            if m2 > 0.0 {
                let rms = (m2 / block.len() as f32).sqrt();
                self.gain = self.gain * 0.9 + setpoint / rms * 0.1;
            }
        }

        let mut data = block.to_vec();
        self.fft.process(&mut data);
        let mut amp: Vec<f32> = data.iter().map(|c| c.norm()).collect();

        for (idx, slot) in self.slots.iter_mut().enumerate() {
            let mut iamax = 0;
            for (i, a) in amp.iter().enumerate() {
                if *a > amp[iamax] {
                    iamax = i;
                }
            }
            if slot.as_ref().map(|s| s.bin) != Some(iamax) {
                debug!(slot = idx, bin = iamax, "notch peak moved");
                let expj = (0..NOTCH_FFT)
                    .map(|i| {
                        expj(2.0 * std::f32::consts::PI * (iamax * i) as f32 / NOTCH_FFT as f32)
                    })
                    .collect();
                *slot = Some(NotchSlot {
                    bin: iamax,
                    estimate: Sample::default(),
                    expj,
                });
            }
            amp[iamax] = 0.0;
            if iamax > 0 {
                amp[iamax - 1] = 0.0;
            }
            if iamax + 1 < amp.len() {
                amp[iamax + 1] = 0.0;
            }
        }
    }

    /// Filter one block of [Self::block_len] samples.
    pub fn process(&mut self, block: &[Sample], out: &mut [Sample]) {
        self.phase += NOTCH_FFT;
        if self.phase >= NOTCH_DECIMATION {
            self.phase -= NOTCH_DECIMATION;
            self.detect(block);
        }

        for (i, (x, y)) in block.iter().zip(out.iter_mut()).enumerate() {
            let mut v = *x;
            for slot in self.slots.iter_mut().flatten() {
                let ej = slot.expj[i];
                let bb = x * ej.conj();
                slot.estimate = bb * NOTCH_K + slot.estimate * (1.0 - NOTCH_K);
                v -= slot.estimate * ej;
            }
            *y = v * self.gain;
        }
    }
}

/// Carrier to noise estimate from the averaged spectrum of a signal sampled at twice the symbol
/// rate.
///
/// The spectrum around the carrier is sorted; the weakest fifth is taken as noise and the
/// strongest fifth as carrier plus noise.
pub struct CnrEstimator {
    fft: Arc<dyn Fft<f32>>,
    decimation: usize,
    phase: usize,
    collecting: bool,
    buffer: Vec<Sample>,
    avgpower: Option<Vec<f32>>,
}

impl CnrEstimator {
    /// One estimate every `decimation` samples.
    pub fn new(decimation: usize) -> Self {
        CnrEstimator {
            fft: FftPlanner::new().plan_fft_forward(CNR_FFT),
            decimation: decimation.max(CNR_FFT),
            phase: 0,
            collecting: true,
            buffer: Vec::with_capacity(CNR_FFT),
            avgpower: None,
        }
    }

    pub fn feed(&mut self, samples: &[Sample], events: &mut Vec<Event>) {
        self.phase += samples.len();
        let mut samples = samples;
        while !samples.is_empty() {
            if !self.collecting {
                if self.phase < self.decimation {
                    return;
                }
                self.phase -= self.decimation;
                self.collecting = true;
            }
            let n = (CNR_FFT - self.buffer.len()).min(samples.len());
            self.buffer.extend_from_slice(&samples[..n]);
            samples = &samples[n..];
            if self.buffer.len() == CNR_FFT {
                let cnr = self.estimate();
                events.push(Report::Cnr(cnr).into());
                self.buffer.clear();
                self.collecting = false;
            }
        }
    }

    fn estimate(&mut self) -> f32 {
        let mut data = self.buffer.clone();
        self.fft.process(&mut data);
        let power: Vec<f32> = data.iter().map(|c| c.norm_sqr()).collect();
        let avg = match self.avgpower.take() {
            Some(mut avg) => {
                for (a, p) in avg.iter_mut().zip(power.iter()) {
                    *a = *a * (1.0 - CNR_KAVG) + p * CNR_KAVG;
                }
                avg
            }
            None => power,
        };

        // carrier assumed at bin 0, occupied band +-0.3 of the sample rate
        let n = CNR_FFT as isize;
        let bw = (0.5 * 0.6 * CNR_FFT as f32) as isize;
        let mut sorted: Vec<f32> = (-bw..=bw)
            .map(|i| avg[i.rem_euclid(n) as usize])
            .collect();
        sorted.sort_by(f32::total_cmp);
        let m = sorted.len() / 5;
        let n2 = sorted[..m].iter().sum::<f32>() / (m + 1) as f32;
        let c2plusn2 = sorted[sorted.len() - m..].iter().sum::<f32>() / (m + 1) as f32;
        self.avgpower = Some(avg);
        let c2 = c2plusn2 - n2;
        if c2 > 0.0 && n2 > 0.0 {
            10.0 * (c2 / n2).log10()
        } else {
            -50.0
        }
    }
}

/// Optional notching followed by CNR measurement, samples pass through otherwise unchanged.
pub struct NotchCnr {
    input: PipeId<Sample>,
    output: PipeId<Sample>,
    notch: Option<AutoNotch>,
    cnr: CnrEstimator,
}

impl NotchCnr {
    pub fn new(
        input: PipeId<Sample>,
        output: PipeId<Sample>,
        notch_filters: u32,
        cnr_decimation: usize,
    ) -> Self {
        NotchCnr {
            input,
            output,
            notch: (notch_filters > 0).then(|| AutoNotch::new(notch_filters as usize, None)),
            cnr: CnrEstimator::new(cnr_decimation),
        }
    }

    /// Minimum chunk handled per run.
    pub fn chunk(&self) -> usize {
        self.notch.as_ref().map_or(1, AutoNotch::block_len)
    }
}

impl Stage for NotchCnr {
    fn name(&self) -> &'static str {
        "notch_cnr"
    }

    fn can_run(&self, pipes: &Pipes) -> bool {
        let chunk = self.chunk();
        pipes.get(self.input).available_for_read() >= chunk
            && pipes.get(self.output).available_for_write() >= chunk
    }

    fn run(&mut self, pipes: &mut Pipes, events: &mut Vec<Event>) {
        let chunk = self.chunk();
        let notch = &mut self.notch;
        let cnr = &mut self.cnr;
        pipes.with(
            self.input,
            self.output,
            |input: &mut Pipe<Sample>, output: &mut Pipe<Sample>| match notch {
                Some(notch) => {
                    while input.available_for_read() >= chunk && output.available_for_write() >= chunk
                    {
                        let block = &input.rd()[..chunk];
                        notch.process(block, &mut output.wr()[..chunk]);
                        cnr.feed(block, events);
                        input.read(chunk);
                        output.written(chunk);
                    }
                }
                None => {
                    let n = input.available_for_read().min(output.available_for_write());
                    let block = &input.rd()[..n];
                    output.wr()[..n].copy_from_slice(block);
                    cnr.feed(block, events);
                    input.read(n);
                    output.written(n);
                }
            },
        );
    }
}
