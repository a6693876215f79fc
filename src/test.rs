//! Internal unit test utilities.

use std::{
    thread,
    time::{Duration, Instant},
};

use crate::{projector, MainContext, Region, StateFeed};

/// The period used by tests running on a [`ManualClock`][crate::ManualClock].
pub const TICK: Duration = Duration::from_secs(1);

/// Spawns a main context holding a fresh projector.
pub fn main_context() -> (MainContext, StateFeed) {
    let (projector, feed) = projector();
    let main = Region::builder().name("main").spawn(projector).unwrap();
    (main, feed)
}

/// Spins until `cond` holds, failing the test if that takes unreasonably long.
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "condition not reached in time"
        );
        thread::sleep(Duration::from_millis(1));
    }
}
