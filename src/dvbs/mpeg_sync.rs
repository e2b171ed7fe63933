//! Byte and bit alignment on the 204 byte cadence of MPEG sync bytes.
//!
//! The deconvolver output is neither byte aligned nor of known polarity. The detector shifts the
//! stream through each of the 8 bit phases looking for enough sync bytes (0x47, or 0xB8 on the
//! first packet of each dispersal group) spaced 204 bytes apart.
use tracing::{debug, info};

use super::SyncFeedback;
use crate::{
    packet::{MPEG_SYNC, MPEG_SYNC_INV, RS_PACKET_LEN},
    pipe::{Pipe, PipeId, Pipes},
    report::{Event, Report, Source},
    scheduler::Stage,
};

/// Packets examined per search.
const SCAN_SYNCS: usize = 8;
/// Sync bytes required among [SCAN_SYNCS] packets to lock.
const WANT_SYNCS: usize = 4;
/// Consecutive bad sync bytes tolerated while locked.
const LOCK_TIMEOUT: u32 = 4;
/// Failed bit phase cycles before asking the deconvolver for another hypothesis.
const CYCLES_BEFORE_RESYNC: u32 = 3;
/// Lock duration reports are emitted every this many packets.
const DURATION_PERIOD: u64 = 256;

const CHUNK: usize = RS_PACKET_LEN * SCAN_SYNCS;

pub struct MpegSync {
    input: PipeId<u8>,
    output: PipeId<u8>,
    feedback: SyncFeedback,
    fast_lock: bool,
    /// XOR mask, 0 or 0xff.
    polarity: u8,
    bitphase: u32,
    synchronized: bool,
    failed_cycles: u32,
    /// Position in the 8 packet dispersal group, 0 for the packet with an inverted sync.
    phase8: usize,
    lock_timeleft: u32,
    locktime: u64,
    report_state: bool,
    scratch: Vec<u8>,
}

impl MpegSync {
    pub fn new(
        input: PipeId<u8>,
        output: PipeId<u8>,
        feedback: SyncFeedback,
        fast_lock: bool,
    ) -> Self {
        MpegSync {
            input,
            output,
            feedback,
            fast_lock,
            polarity: 0,
            bitphase: 0,
            synchronized: false,
            failed_cycles: 0,
            phase8: 0,
            lock_timeleft: 0,
            locktime: 0,
            report_state: true,
            scratch: vec![0u8; CHUNK],
        }
    }

    pub fn is_locked(&self) -> bool {
        self.synchronized
    }

    /// Shift `CHUNK + 1` input bytes by the current bit phase into the scratch buffer.
    fn shift_chunk(&mut self, input: &[u8]) {
        let mut w = u16::from(input[0]);
        for (out, b) in self.scratch.iter_mut().zip(&input[1..=CHUNK]) {
            w = (w << 8) | u16::from(*b);
            *out = (w >> self.bitphase) as u8;
        }
    }

    /// Look for [WANT_SYNCS] sync bytes at any of the 204 offsets, locking on success.
    fn search(&mut self, input: &mut Pipe<u8>, events: &mut Vec<Event>) -> bool {
        self.shift_chunk(input.rd());
        for offset in 0..RS_PACKET_LEN {
            let (mut syncs_p, mut syncs_n) = (0, 0);
            let (mut phase8_p, mut phase8_n) = (None, None);
            for j in 0..SCAN_SYNCS {
                match self.scratch[offset + j * RS_PACKET_LEN] {
                    MPEG_SYNC => {
                        syncs_p += 1;
                        phase8_n = Some((8 - j) & 7);
                    }
                    MPEG_SYNC_INV => {
                        syncs_n += 1;
                        phase8_p = Some((8 - j) & 7);
                    }
                    _ => {}
                }
            }
            let (polarity, syncs, phase8) = if syncs_p > syncs_n {
                (0u8, syncs_p, phase8_p)
            } else {
                (0xffu8, syncs_n, phase8_n)
            };
            let Some(mut phase8) = phase8 else {
                continue;
            };
            if syncs < WANT_SYNCS {
                continue;
            }

            // always consume something so the scheduler sees progress
            let skip = if offset == 0 {
                phase8 = (phase8 + 1) & 7;
                RS_PACKET_LEN
            } else {
                offset
            };
            input.read(skip);
            self.polarity = polarity;
            self.phase8 = phase8;
            self.synchronized = true;
            self.lock_timeleft = LOCK_TIMEOUT;
            self.locktime = 0;
            info!(bitphase = self.bitphase, polarity, syncs, "MPEG sync locked");
            events.push(
                Report::Lock {
                    source: Source::MpegSync,
                    locked: true,
                }
                .into(),
            );
            return true;
        }
        false
    }

    fn run_searching(&mut self, input: &mut Pipe<u8>, events: &mut Vec<Event>) {
        while input.available_for_read() > CHUNK {
            if self.search(input, events) {
                return;
            }
            input.read(CHUNK);
            self.bitphase += 1;
            if self.bitphase < 8 {
                continue;
            }
            self.bitphase = 0;
            self.failed_cycles += 1;
            if self.failed_cycles >= CYCLES_BEFORE_RESYNC {
                self.failed_cycles = 0;
                debug!("no MPEG sync, requesting deconvolver resync");
                self.feedback.request_next();
            }
        }
    }

    fn run_searching_fast(&mut self, input: &mut Pipe<u8>, events: &mut Vec<Event>) {
        while input.available_for_read() > CHUNK {
            for bitphase in 0..8 {
                self.bitphase = bitphase;
                if self.search(input, events) {
                    return;
                }
            }
            input.read(RS_PACKET_LEN);
        }
    }

    fn run_decoding(
        &mut self,
        input: &mut Pipe<u8>,
        output: &mut Pipe<u8>,
        events: &mut Vec<Event>,
    ) {
        while input.available_for_read() > RS_PACKET_LEN
            && output.available_for_write() >= RS_PACKET_LEN
        {
            let src = input.rd();
            let dst = output.wr();
            let mut w = u16::from(src[0]);
            for (out, b) in dst[..RS_PACKET_LEN].iter_mut().zip(&src[1..=RS_PACKET_LEN]) {
                w = (w << 8) | u16::from(*b);
                *out = (w >> self.bitphase) as u8 ^ self.polarity;
            }
            let sync = dst[0];
            input.read(RS_PACKET_LEN);
            output.written(RS_PACKET_LEN);
            self.locktime += 1;
            if self.locktime % DURATION_PERIOD == 0 {
                events.push(self.duration().into());
            }

            let expected = if self.phase8 == 0 {
                MPEG_SYNC_INV
            } else {
                MPEG_SYNC
            };
            if sync == expected {
                self.lock_timeleft = LOCK_TIMEOUT;
            }
            self.phase8 = (self.phase8 + 1) & 7;
            self.lock_timeleft -= 1;
            if self.lock_timeleft == 0 {
                info!(packets = self.locktime, "MPEG sync lost");
                self.synchronized = false;
                self.failed_cycles = 0;
                events.push(self.duration().into());
                events.push(
                    Report::Lock {
                        source: Source::MpegSync,
                        locked: false,
                    }
                    .into(),
                );
                return;
            }
        }
    }

    fn duration(&self) -> Report {
        Report::LockDuration {
            source: Source::MpegSync,
            packets: self.locktime,
        }
    }
}

impl Stage for MpegSync {
    fn name(&self) -> &'static str {
        "mpeg_sync"
    }

    fn can_run(&self, pipes: &Pipes) -> bool {
        let readable = pipes.get(self.input).available_for_read();
        if self.synchronized {
            readable > RS_PACKET_LEN
                && pipes.get(self.output).available_for_write() >= RS_PACKET_LEN
        } else {
            self.report_state || readable > CHUNK
        }
    }

    fn run(&mut self, pipes: &mut Pipes, events: &mut Vec<Event>) {
        if self.report_state {
            events.push(
                Report::Lock {
                    source: Source::MpegSync,
                    locked: false,
                }
                .into(),
            );
            self.report_state = false;
        }
        pipes.with(self.input, self.output, |input, output| {
            if !self.synchronized {
                if self.fast_lock {
                    self.run_searching_fast(input, events);
                } else {
                    self.run_searching(input, events);
                }
            }
            if self.synchronized {
                self.run_decoding(input, output, events);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// Sync bytes with the dispersal group cadence and pseudo random filler.
    fn rs_stream(packets: usize) -> Vec<u8> {
        let mut seed = 0x1234_5678u32;
        let mut out = Vec::with_capacity(packets * RS_PACKET_LEN);
        for p in 0..packets {
            out.push(if p % 8 == 0 { MPEG_SYNC_INV } else { MPEG_SYNC });
            for _ in 1..RS_PACKET_LEN {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
                // keep filler clear of both sync values
                let b = (seed >> 16) as u8;
                out.push(if b == MPEG_SYNC || b == MPEG_SYNC_INV { 0 } else { b });
            }
        }
        out
    }

    /// Delay by `shift` bits and optionally invert.
    fn misalign(bytes: &[u8], shift: u32, invert: bool) -> Vec<u8> {
        let mask = if invert { 0xff } else { 0 };
        let mut out = Vec::with_capacity(bytes.len() + 1);
        let mut prev = 0u8;
        for b in bytes {
            let w = (u16::from(prev) << 8) | u16::from(*b);
            out.push((w >> shift) as u8 ^ mask);
            prev = *b;
        }
        out
    }

    fn run(stage: &mut MpegSync, bytes: &[u8]) -> (Vec<u8>, Vec<Event>) {
        let mut pipes = Pipes::new(1);
        let input = pipes.add("bytes", bytes.len());
        let output = pipes.add("aligned", bytes.len());
        stage.input = input;
        stage.output = output;
        let pipe = pipes.get_mut(input);
        pipe.wr()[..bytes.len()].copy_from_slice(bytes);
        pipe.written(bytes.len());

        let mut events = Vec::default();
        while stage.can_run(&pipes) {
            let before = pipes.activity();
            stage.run(&mut pipes, &mut events);
            if pipes.activity() == before && !stage.report_state {
                break;
            }
        }
        (pipes.get(output).rd().to_vec(), events)
    }

    fn new_stage(feedback: SyncFeedback, fast_lock: bool) -> MpegSync {
        let mut pipes = Pipes::new(0);
        let input = pipes.add("in", 1);
        let output = pipes.add("out", 1);
        MpegSync::new(input, output, feedback, fast_lock)
    }

    #[test]
    fn test_locks_on_shifted_inverted_stream() {
        let stream = rs_stream(40);
        for fast_lock in [false, true] {
            for shift in [0, 3, 7] {
                let mut stage = new_stage(SyncFeedback::default(), fast_lock);
                let (out, events) = run(&mut stage, &misalign(&stream, shift, true));
                assert!(stage.is_locked(), "shift {shift} fast {fast_lock}");
                assert!(out.len() >= 10 * RS_PACKET_LEN);
                // output starts on a sync byte and carries the dispersal cadence
                assert!(out[0] == MPEG_SYNC || out[0] == MPEG_SYNC_INV);
                let syncs: Vec<u8> = out.chunks_exact(RS_PACKET_LEN).map(|p| p[0]).collect();
                let inv = syncs.iter().position(|s| *s == MPEG_SYNC_INV).unwrap();
                for (k, s) in syncs.iter().enumerate() {
                    let expected = if k % 8 == inv % 8 { MPEG_SYNC_INV } else { MPEG_SYNC };
                    assert_eq!(*s, expected, "packet {k}");
                }
                assert_eq!(
                    events[0],
                    Event::Report(Report::Lock {
                        source: Source::MpegSync,
                        locked: false
                    })
                );
                assert!(events.contains(&Event::Report(Report::Lock {
                    source: Source::MpegSync,
                    locked: true
                })));
            }
        }
    }

    #[test]
    fn test_noise_requests_resync() {
        let feedback = SyncFeedback::default();
        let mut stage = new_stage(feedback.clone(), false);
        let mut rng = StdRng::seed_from_u64(3);
        let noise: Vec<u8> = (0..CHUNK * 8 * 3 + 1).map(|_| rng.gen()).collect();
        run(&mut stage, &noise);
        assert!(!stage.is_locked());
        assert_eq!(feedback.requests(), 1);
    }

    #[test]
    fn test_loses_lock_after_timeout() {
        let mut stream = rs_stream(24);
        stream.extend(std::iter::repeat(0u8).take(16 * RS_PACKET_LEN));
        let mut stage = new_stage(SyncFeedback::default(), false);
        let (_, events) = run(&mut stage, &stream);
        assert!(!stage.is_locked());
        assert_eq!(
            events.last(),
            Some(&Event::Report(Report::Lock {
                source: Source::MpegSync,
                locked: false
            }))
        );
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Report(Report::LockDuration { packets, .. }) if *packets > 0
        )));
    }
}
