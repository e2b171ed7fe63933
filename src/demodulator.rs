//! The mode controller: owns the active graph and rebuilds it when the configuration or the
//! received MODCOD changes.
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, trace, warn};

use crate::{
    builder::GraphBuilder,
    dvbs2::ldpc::{GeneratedCodebook, LdpcCodebook},
    frontend::FrontEnd,
    report::{Event, ModcodChange, Report},
    scheduler::Graph,
    settings::{CodeRate, Modulation, Settings, Standard},
    sink::{TsSink, UdpSink},
    Result, Sample,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DemodState {
    /// No valid configuration was applied yet, or the last one was rejected.
    Uninitialized,
    /// A graph for the standard is running.
    Ready(Standard),
    /// A MODCOD change was adopted, the graph is rebuilt before the next samples are processed.
    Rebuilding(Standard),
}

/// What in-band signalling changed about the configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiveAdaptation {
    /// The active modulation and code rate came from a MODCOD rather than from the caller.
    pub set_by_modcod: bool,
    pub last_modcod: Option<(Modulation, CodeRate)>,
}

/// DVB-S/DVB-S2 demodulator, from channel samples to transport stream packets.
///
/// ```
/// use dvbdemod::{settings::Settings, Demodulator, Sample};
///
/// let mut demod = Demodulator::new(2e6);
/// demod.apply_settings(Settings::default(), false).unwrap();
/// demod.feed(&[Sample::default(); 1000]);
/// demod.flush();
/// ```
pub struct Demodulator {
    channel_rate: f64,
    frequency_offset: f64,
    settings: Option<Settings>,
    front_end: Option<FrontEnd>,
    graph: Option<Graph>,
    generation: u64,
    rebuild_pending: bool,
    live: LiveAdaptation,
    codebook: Arc<dyn LdpcCodebook>,
    subscribers: Vec<Sender<Event>>,
    sinks: Vec<Box<dyn TsSink>>,
    udp: Option<UdpSink>,
    scratch: Vec<Sample>,
    events: Vec<Event>,
    power_count: usize,
}

impl Demodulator {
    /// A demodulator for a channel sampled at `channel_rate`. Nothing is processed before
    /// [Self::apply_settings] succeeds.
    pub fn new(channel_rate: f64) -> Self {
        Demodulator {
            channel_rate,
            frequency_offset: 0.0,
            settings: None,
            front_end: None,
            graph: None,
            generation: 0,
            rebuild_pending: false,
            live: LiveAdaptation::default(),
            codebook: Arc::new(GeneratedCodebook),
            subscribers: Vec::default(),
            sinks: Vec::default(),
            udp: None,
            scratch: Vec::default(),
            events: Vec::default(),
            power_count: 0,
        }
    }

    /// Use `codebook` for bit flipping LDPC decoding from the next build on.
    pub fn with_codebook(mut self, codebook: Arc<dyn LdpcCodebook>) -> Self {
        self.codebook = codebook;
        self
    }

    pub fn state(&self) -> DemodState {
        match (&self.settings, &self.graph) {
            (Some(s), _) if self.rebuild_pending => DemodState::Rebuilding(s.standard),
            (Some(s), Some(_)) => DemodState::Ready(s.standard),
            _ => DemodState::Uninitialized,
        }
    }

    pub fn settings(&self) -> Option<&Settings> {
        self.settings.as_ref()
    }

    /// Generation of the current graph, incremented by every build.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn live_adaptation(&self) -> LiveAdaptation {
        self.live
    }

    /// Receive every [Event] from now on.
    pub fn subscribe(&mut self) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver decoded packets to `sink` in addition to the configured UDP output.
    pub fn add_sink(&mut self, sink: Box<dyn TsSink>) {
        self.sinks.push(sink);
    }

    /// Apply a new configuration.
    ///
    /// Rebuild classified changes (see [Settings::requires_rebuild]) or `force` tear the current
    /// graph down and build a new one, discarding whatever was in flight. Other changes only
    /// reconfigure the front end and the UDP output.
    ///
    /// # Errors
    /// [crate::Error::Configuration] if the settings are rejected, in which case the demodulator
    /// is left [DemodState::Uninitialized]. UDP setup errors leave the graph running.
    pub fn apply_settings(&mut self, settings: Settings, force: bool) -> Result<()> {
        if let Err(e) = settings.validate() {
            error!("rejected settings: {e}");
            self.teardown();
            self.settings = None;
            return Err(e);
        }
        let rebuild = force
            || self.graph.is_none()
            || self
                .settings
                .as_ref()
                .map_or(true, |current| current.requires_rebuild(&settings));
        let caller_modcod = self.settings.as_ref().map_or(true, |current| {
            (current.modulation, current.code_rate) != (settings.modulation, settings.code_rate)
        });
        if caller_modcod {
            // whatever is on air must be reported again against the new configuration
            self.live = LiveAdaptation::default();
        }
        self.settings = Some(settings);
        if rebuild {
            if let Err(e) = self.rebuild() {
                self.settings = None;
                return Err(e);
            }
        }
        self.configure_front_end()?;
        self.configure_udp()
    }

    /// The channel sample rate and the frequency of the channel relative to the input center.
    ///
    /// # Errors
    /// [crate::Error::Configuration] if the front end cannot be configured for the rates.
    pub fn apply_channel_settings(&mut self, sample_rate: f64, frequency_offset: f64) -> Result<()> {
        self.channel_rate = sample_rate;
        self.frequency_offset = frequency_offset;
        self.configure_front_end()
    }

    fn configure_front_end(&mut self) -> Result<()> {
        let Some(s) = &self.settings else {
            return Ok(());
        };
        let offset = self.frequency_offset + s.center_frequency as f64;
        let (rate, working, bw) = (self.channel_rate, s.working_rate(), f64::from(s.rf_bandwidth));
        match &mut self.front_end {
            Some(fe) => fe.configure(rate, working, offset, bw)?,
            None => self.front_end = Some(FrontEnd::new(rate, working, offset, bw)?),
        }
        Ok(())
    }

    fn configure_udp(&mut self) -> Result<()> {
        let Some(s) = &self.settings else {
            return Ok(());
        };
        if !s.udp.enabled {
            if self.udp.take().is_some() {
                info!("UDP output disabled");
            }
            return Ok(());
        }
        let unchanged = self.udp.as_ref().is_some_and(|u| {
            u.target().port() == s.udp.port && u.target().ip().to_string() == s.udp.address
        });
        if !unchanged {
            let sink = UdpSink::new(&s.udp.address, s.udp.port)?;
            info!(addr = %sink.target(), "UDP output enabled");
            self.udp = Some(sink);
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(graph) = self.graph.take() {
            debug!(generation = graph.generation(), "tearing down graph");
        }
    }

    fn rebuild(&mut self) -> Result<()> {
        self.teardown();
        self.rebuild_pending = false;
        let Some(settings) = self.settings.clone() else {
            return Ok(());
        };
        self.generation += 1;
        match GraphBuilder::new(settings, self.generation)
            .codebook(self.codebook.clone())
            .build()
        {
            Ok(graph) => {
                info!(generation = self.generation, standard = ?graph.standard(), "graph built");
                self.graph = Some(graph);
                Ok(())
            }
            Err(e) => {
                error!("graph build failed: {e}");
                Err(e)
            }
        }
    }

    /// Process channel samples. Complete output is delivered to the sinks as it becomes
    /// available.
    pub fn feed(&mut self, samples: &[Sample]) {
        if self.rebuild_pending {
            if let Err(e) = self.rebuild() {
                self.settings = None;
                warn!("MODCOD rebuild failed, demodulator stopped: {e}");
            }
        }
        let Some(fe) = self.front_end.as_mut() else {
            trace!(n = samples.len(), "not configured, dropping samples");
            return;
        };
        let scratch = &mut self.scratch;
        scratch.clear();
        for x in samples {
            fe.process(*x, |s| scratch.push(s));
        }
        self.count_power(samples.len());

        let mut offset = 0;
        while offset < self.scratch.len() {
            let Some(graph) = self.graph.as_mut() else {
                return;
            };
            let input = graph.input();
            let pipe = graph.pipes_mut().get_mut(input);
            let n = pipe.available_for_write().min(self.scratch.len() - offset);
            if n == 0 {
                self.run_graph();
                let stuck = self.graph.as_ref().map_or(true, |g| {
                    g.pipes().get(g.input()).available_for_write() == 0
                });
                if stuck {
                    warn!(dropped = self.scratch.len() - offset, "input pipe stalled");
                    return;
                }
                continue;
            }
            pipe.wr()[..n].copy_from_slice(&self.scratch[offset..offset + n]);
            pipe.written(n);
            offset += n;
            if pipe.available_for_write() == 0 {
                self.run_graph();
            }
        }
    }

    /// Run the graph on whatever is buffered.
    pub fn flush(&mut self) {
        self.run_graph();
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.flush() {
                warn!("sink flush failed: {e}");
            }
        }
        if let Some(udp) = self.udp.as_mut() {
            if let Err(e) = udp.flush() {
                warn!("UDP flush failed: {e}");
            }
        }
    }

    fn count_power(&mut self, n: usize) {
        let Some(s) = &self.settings else {
            return;
        };
        let period = (self.channel_rate / f64::from(s.report_rate)).max(1.0) as usize;
        self.power_count += n;
        if self.power_count >= period {
            self.power_count %= period;
            if let Some(db) = self.front_end.as_mut().and_then(FrontEnd::take_power_db) {
                self.events.push(Report::ChannelPower(db).into());
            }
        }
    }

    fn run_graph(&mut self) {
        if let Some(graph) = self.graph.as_mut() {
            graph.step(&mut self.events);
            let output = graph.output();
            let pipe = graph.pipes_mut().get_mut(output);
            let n = pipe.available_for_read();
            let udp = &mut self.udp;
            let sinks = &mut self.sinks;
            for packet in pipe.rd() {
                sinks.retain_mut(|sink| match sink.send(packet) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("detaching sink: {e}");
                        false
                    }
                });
                if let Some(sink) = udp.as_mut() {
                    if let Err(e) = sink.send(packet) {
                        warn!("UDP send failed: {e}");
                    }
                }
            }
            pipe.read(n);
        }
        self.dispatch_events();
    }

    fn dispatch_events(&mut self) {
        let events = std::mem::take(&mut self.events);
        for event in events {
            if let Event::Modcod(change) = &event {
                if !self.on_modcod(change) {
                    continue;
                }
            }
            self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Returns whether observers should hear about `change`.
    fn on_modcod(&mut self, change: &ModcodChange) -> bool {
        let key = (change.modulation, change.code_rate);
        if self.live.last_modcod == Some(key) {
            return false;
        }
        self.live.last_modcod = Some(key);
        if let Some(s) = self.settings.as_mut() {
            if (s.modulation, s.code_rate) != key {
                info!(
                    modulation = ?change.modulation,
                    rate = ?change.code_rate,
                    "MODCOD differs from configuration, rebuilding"
                );
                s.modulation = change.modulation;
                s.code_rate = change.code_rate;
                self.live.set_by_modcod = true;
                self.rebuild_pending = true;
            }
        }
        true
    }
}
