//! Kept in its own test binary, the graph count is process wide.
use dvbdemod::{
    scheduler::live_graphs,
    settings::{Settings, Standard},
    DemodState, Demodulator, Sample,
};

#[test]
fn forced_rebuilds_leave_one_graph() {
    let mut demod = Demodulator::new(2e6);
    assert_eq!(live_graphs(), 0);

    let noise: Vec<Sample> = (0..50_000i64)
        .map(|n| Sample::new(((n * 7919) % 101) as f32 / 500.0, ((n * 104_729) % 97) as f32 / 500.0))
        .collect();
    let mut last = 0;
    for round in 0..6 {
        let standard = if round % 2 == 0 {
            Standard::DvbS
        } else {
            Standard::DvbS2
        };
        let settings = Settings::builder().standard(standard).build();
        demod.apply_settings(settings, true).unwrap();
        demod.feed(&noise);

        assert_eq!(live_graphs(), 1);
        assert!(demod.generation() > last);
        last = demod.generation();
        assert_eq!(demod.state(), DemodState::Ready(standard));
    }

    drop(demod);
    assert_eq!(live_graphs(), 0);
}
