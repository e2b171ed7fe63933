//! Cooperative execution of a processing graph.
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, trace};

use crate::{
    packet::TsPacket,
    pipe::{PipeId, Pipes},
    report::Event,
    settings::Standard,
    Sample,
};

static LIVE_GRAPHS: AtomicUsize = AtomicUsize::new(0);

/// Number of [Graph]s currently alive in this process.
pub fn live_graphs() -> usize {
    LIVE_GRAPHS.load(Ordering::SeqCst)
}

/// A unit of computation connected to its neighbours through pipes.
pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Whether [Self::run] would make progress with the current pipe contents.
    fn can_run(&self, pipes: &Pipes) -> bool;

    /// Consume what input is available and produce as much output as fits. Measurements and
    /// state changes go to `events`.
    fn run(&mut self, pipes: &mut Pipes, events: &mut Vec<Event>);
}

/// Pipes and stages of one configuration generation.
///
/// Stages are kept producer before consumer, so a single pass moves data as far downstream as
/// buffer space allows.
pub struct Graph {
    standard: Standard,
    pipes: Pipes,
    stages: Vec<Box<dyn Stage>>,
    input: PipeId<Sample>,
    output: PipeId<TsPacket>,
}

impl Graph {
    pub fn new(
        standard: Standard,
        pipes: Pipes,
        stages: Vec<Box<dyn Stage>>,
        input: PipeId<Sample>,
        output: PipeId<TsPacket>,
    ) -> Self {
        LIVE_GRAPHS.fetch_add(1, Ordering::SeqCst);
        debug!(
            generation = pipes.generation(),
            stages = stages.len(),
            pipes = pipes.len(),
            "graph created"
        );
        Graph {
            standard,
            pipes,
            stages,
            input,
            output,
        }
    }

    pub fn standard(&self) -> Standard {
        self.standard
    }

    pub fn generation(&self) -> u64 {
        self.pipes.generation()
    }

    pub fn pipes(&self) -> &Pipes {
        &self.pipes
    }

    pub fn pipes_mut(&mut self) -> &mut Pipes {
        &mut self.pipes
    }

    pub fn input(&self) -> PipeId<Sample> {
        self.input
    }

    pub fn output(&self) -> PipeId<TsPacket> {
        self.output
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run stages until a full pass moves no data. Returns the number of passes.
    pub fn step(&mut self, events: &mut Vec<Event>) -> usize {
        let mut passes = 0;
        loop {
            let before = self.pipes.activity();
            for stage in self.stages.iter_mut() {
                if stage.can_run(&self.pipes) {
                    trace!(stage = stage.name(), "run");
                    stage.run(&mut self.pipes, events);
                }
            }
            passes += 1;
            if self.pipes.activity() == before {
                break;
            }
        }
        passes
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        LIVE_GRAPHS.fetch_sub(1, Ordering::SeqCst);
        debug!(generation = self.pipes.generation(), "graph destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pipe::Pipe, report::Report};

    /// Moves one sample per run into the output as a packet whose first byte is the real part.
    struct Packetize {
        input: PipeId<Sample>,
        output: PipeId<TsPacket>,
    }

    impl Stage for Packetize {
        fn name(&self) -> &'static str {
            "packetize"
        }

        fn can_run(&self, pipes: &Pipes) -> bool {
            pipes.get(self.input).available_for_read() > 0
                && pipes.get(self.output).available_for_write() > 0
        }

        fn run(&mut self, pipes: &mut Pipes, events: &mut Vec<Event>) {
            pipes.with(
                self.input,
                self.output,
                |input: &mut Pipe<Sample>, output: &mut Pipe<TsPacket>| {
                    let mut pkt = TsPacket::default();
                    pkt.0[0] = input.rd()[0].re as u8;
                    input.read(1);
                    output.write(pkt).unwrap();
                },
            );
            events.push(Report::Cnr(0.0).into());
        }
    }

    #[test]
    fn test_step_runs_to_quiescence() {
        let mut pipes = Pipes::new(1);
        let input = pipes.add("in", 8);
        let output = pipes.add("out", 3);
        let stage = Packetize { input, output };
        let mut graph = Graph::new(Standard::DvbS, pipes, vec![Box::new(stage)], input, output);
        assert!(live_graphs() >= 1);

        for i in 0..5 {
            graph
                .pipes_mut()
                .get_mut(input)
                .write(Sample::new(i as f32, 0.0))
                .unwrap();
        }
        let mut events = Vec::default();
        graph.step(&mut events);

        // output capacity bounds progress, the rest stays queued
        assert_eq!(events.len(), 3);
        assert_eq!(graph.pipes().get(input).available_for_read(), 2);
        let firsts: Vec<u8> = graph.pipes().get(output).rd().iter().map(|p| p.0[0]).collect();
        assert_eq!(firsts, vec![0, 1, 2]);
    }
}
