use super::*;
use tokio::sync::mpsc;

#[tokio::test(start_paused = true)]
async fn one_shot_fires_once_with_its_generation() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut slot = TimerSlot::new();
    let armed = slot.arm_once(Duration::from_secs(30), &tx, |generation| generation);

    time::sleep(Duration::from_secs(29)).await;
    assert!(rx.try_recv().is_err());

    time::sleep(Duration::from_secs(2)).await;
    let fired = rx.recv().await.expect("timer fired");
    assert_eq!(fired, armed);
    assert!(slot.accept_once(fired));
    assert!(!slot.is_armed());
    assert!(!slot.accept_once(fired));
}

#[tokio::test(start_paused = true)]
async fn cancelled_timer_never_fires() {
    let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
    let mut slot = TimerSlot::new();
    slot.arm_once(Duration::from_secs(1), &tx, |generation| generation);
    slot.cancel();

    time::sleep(Duration::from_secs(5)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn rearming_makes_queued_firings_stale() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut slot = TimerSlot::new();
    let first = slot.arm_interval(Duration::from_secs(1), &tx, |generation| generation);

    time::sleep(Duration::from_millis(1_500)).await;
    let queued = rx.recv().await.expect("first tick");
    assert_eq!(queued, first);

    let second = slot.arm_interval(Duration::from_secs(1), &tx, |generation| generation);
    assert_ne!(first, second);
    assert!(!slot.accept(queued));

    time::sleep(Duration::from_secs(1)).await;
    let fresh = rx.recv().await.expect("second timer tick");
    assert!(slot.accept(fresh));
}

#[tokio::test(start_paused = true)]
async fn interval_keeps_ticking_until_dropped() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut slot = TimerSlot::new();
    slot.arm_interval(Duration::from_secs(1), &tx, |_| ());

    time::sleep(Duration::from_millis(3_500)).await;
    let mut ticks = 0;
    while rx.try_recv().is_ok() {
        ticks += 1;
    }
    assert_eq!(ticks, 3);

    drop(slot);
    time::sleep(Duration::from_secs(5)).await;
    assert!(rx.try_recv().is_err());
}
