use super::*;

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[test]
fn delays_double_until_capped() {
    let mut backoff = ReconnectBackoff::default();
    let mut delays = Vec::new();
    for _ in 0..7 {
        delays.push(backoff.schedule().expect("slot free"));
        backoff.fired();
    }
    assert_eq!(
        delays,
        vec![
            ms(1_000),
            ms(2_000),
            ms(4_000),
            ms(8_000),
            ms(16_000),
            ms(30_000),
            ms(30_000)
        ]
    );
    assert_eq!(backoff.attempt(), 7);
}

#[test]
fn success_resets_the_schedule() {
    let mut backoff = ReconnectBackoff::default();
    for _ in 0..3 {
        backoff.schedule();
        backoff.fired();
    }
    backoff.reset();
    assert_eq!(backoff.attempt(), 0);
    assert_eq!(backoff.schedule(), Some(ms(1_000)));
}

#[test]
fn only_one_reconnect_in_flight() {
    let mut backoff = ReconnectBackoff::default();
    assert_eq!(backoff.schedule(), Some(ms(1_000)));
    assert_eq!(backoff.schedule(), None);
    assert_eq!(backoff.attempt(), 1);

    backoff.fired();
    assert_eq!(backoff.schedule(), Some(ms(2_000)));
}

#[test]
fn huge_attempt_counts_saturate_at_cap() {
    let backoff = ReconnectBackoff::new(ms(1_000), ms(30_000));
    assert_eq!(backoff.delay_for(40), ms(30_000));
    assert_eq!(backoff.delay_for(u32::MAX), ms(30_000));
}
