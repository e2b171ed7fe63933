//! DVB-S and DVB-S2 demodulation, from complex baseband samples to MPEG transport stream packets.
//!
//! A [Demodulator] owns a processing graph of [scheduler::Stage]s connected by bounded
//! [pipe::Pipe]s. Samples go in through [Demodulator::feed], are resampled to two samples per
//! symbol, demodulated and decoded by the chain of the configured [settings::Standard]; decoded
//! packets come out through [sink::TsSink]s and measurements through [Demodulator::subscribe].
//!
//! References:
//! * ETSI EN 300 421, DVB-S framing structure, channel coding and modulation
//! * ETSI EN 302 307-1, DVB-S2
//!
//! ```
//! use dvbdemod::{settings::{Settings, Standard}, sink::ChannelSink, Demodulator};
//!
//! let mut demod = Demodulator::new(2_000_000.0);
//! let settings = Settings::builder()
//!     .standard(Standard::DvbS2)
//!     .symbol_rate(1_000_000)
//!     .build();
//! demod.apply_settings(settings, false).unwrap();
//! let (sink, packets) = ChannelSink::new(1024);
//! demod.add_sink(Box::new(sink));
//! let events = demod.subscribe();
//! # drop((packets, events));
//! ```
pub mod builder;
pub mod constellation;
pub mod demodulator;
pub mod dsp;
pub mod dvbs;
pub mod dvbs2;
mod error;
pub mod frontend;
pub mod iq;
pub mod notch;
pub mod packet;
pub mod pipe;
pub mod receiver;
pub mod report;
pub mod scheduler;
pub mod settings;
pub mod sink;

pub use rustfft::num_complex;

/// Complex baseband sample.
pub type Sample = num_complex::Complex<f32>;

pub use demodulator::{DemodState, Demodulator};
pub use error::{Error, Result};
pub use report::{Event, FecCounters, Integrity, ModcodChange, Report, Source};
