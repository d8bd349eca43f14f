//! An [`Interval`]-based timer for beacon chain slots.
//!
//! [`Interval`]s may produce items late, but the delays do not accumulate.
//! It is unclear how [`Interval`] behaves around leap seconds.
//!
//! [`Interval`]: tokio::time::Interval

use core::time::Duration;
use std::time::{Instant, SystemTime};

use anyhow::Result;
use enum_iterator::Sequence;
use futures::stream::{Stream, StreamExt as _, TryStreamExt as _};
use strum::AsRefStr;
use thiserror::Error;
use tokio_stream::wrappers::IntervalStream;
use types::{
    config::Config,
    consts::{GENESIS_SLOT, INTERVALS_PER_SLOT},
    misc,
    primitives::{Epoch, Slot, UnixSeconds},
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Tick {
    pub slot: Slot,
    pub kind: TickKind,
}

/// The three intervals of a slot. `Propose` marks the start of the slot,
/// `Attest` a third in, `Aggregate` two thirds in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Sequence, AsRefStr)]
pub enum TickKind {
    Propose,
    Attest,
    Aggregate,
}

impl Tick {
    #[must_use]
    pub const fn start_of_slot(slot: Slot) -> Self {
        Self::new(slot, TickKind::Propose)
    }

    pub fn current(config: &Config, genesis_time: UnixSeconds) -> Result<Self> {
        let duration_since_unix_epoch = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH)?;
        Ok(Self::from_duration(
            config,
            duration_since_unix_epoch,
            genesis_time,
        ))
    }

    pub fn at_time(config: &Config, time: UnixSeconds, genesis_time: UnixSeconds) -> Self {
        Self::from_duration(config, Duration::from_secs(time), genesis_time)
    }

    #[must_use]
    pub fn epoch(self) -> Epoch {
        misc::compute_epoch_at_slot(self.slot)
    }

    #[must_use]
    pub const fn is_start_of_slot(self) -> bool {
        matches!(self.kind, TickKind::Propose)
    }

    #[must_use]
    pub fn is_start_of_epoch(self) -> bool {
        misc::is_epoch_start(self.slot) && self.is_start_of_slot()
    }

    fn from_duration(
        config: &Config,
        duration_since_unix_epoch: Duration,
        genesis_time: UnixSeconds,
    ) -> Self {
        let unix_epoch_to_genesis = Duration::from_secs(genesis_time);

        // `Duration` does not implement `Div<Duration>` or `Rem<Duration>`,
        // so the arithmetic is done on nanoseconds.
        let nanos_since_genesis = duration_since_unix_epoch
            .saturating_sub(unix_epoch_to_genesis)
            .as_nanos();

        let nanos_per_tick = tick_duration(config).as_nanos();
        let ticks_per_slot = INTERVALS_PER_SLOT.get() as u128;
        let ticks_since_genesis = nanos_since_genesis / nanos_per_tick;
        let slots_since_genesis = (ticks_since_genesis / ticks_per_slot) as u64;
        let ticks_since_slot = (ticks_since_genesis % ticks_per_slot) as usize;

        let kind = enum_iterator::all::<TickKind>()
            .nth(ticks_since_slot)
            .expect("more ticks would add up to additional slots");

        Self::new(GENESIS_SLOT + slots_since_genesis, kind)
    }

    const fn new(slot: Slot, kind: TickKind) -> Self {
        Self { slot, kind }
    }

    fn next(self) -> Result<Self, ClockError> {
        let Self { slot, kind } = self;

        let next_slot = match kind.next() {
            Some(_) => slot,
            None => slot.checked_add(1).ok_or(ClockError::RanOutOfSlots)?,
        };

        Ok(Self::new(next_slot, enum_iterator::next_cycle(&kind)))
    }
}

#[derive(Debug, Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum ClockError {
    #[error("time of next tick overflowed")]
    NextInstantOverflow,
    #[error("ran out of slots")]
    RanOutOfSlots,
}

/// A stream of interval ticks starting at the next tick boundary.
pub fn ticks(
    config: &Config,
    genesis_time: UnixSeconds,
) -> Result<impl Stream<Item = Result<Tick>>> {
    // The `Instant` and `SystemTime` obtained here are assumed to correspond
    // to the same point in time. The error is negligible compared to clock
    // differences between nodes in the network.
    let now_instant = Instant::now();
    let now_system_time = SystemTime::now();

    let (mut next_tick, next_instant) =
        next_tick_with_instant(config, now_instant, now_system_time, genesis_time)?;

    let interval = tokio::time::interval_at(next_instant.into(), tick_duration(config));

    Ok(IntervalStream::new(interval)
        .map(move |_| {
            let current_tick = next_tick;
            next_tick = current_tick.next()?;
            Ok::<Tick, ClockError>(current_tick)
        })
        .map_err(Into::into))
}

/// Time remaining until the given offset within `slot`, measured from now.
/// Zero if the point has already passed.
pub fn time_until_slot_offset(
    config: &Config,
    genesis_time: UnixSeconds,
    slot: Slot,
    offset: Duration,
) -> Result<Duration> {
    let unix_epoch_to_now = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH)?;
    let unix_epoch_to_genesis = Duration::from_secs(genesis_time);

    let genesis_to_point = config
        .slot_duration()
        .saturating_mul(u32::try_from(slot - GENESIS_SLOT)?)
        .saturating_add(offset);

    Ok(unix_epoch_to_genesis
        .saturating_add(genesis_to_point)
        .saturating_sub(unix_epoch_to_now))
}

fn next_tick_with_instant(
    config: &Config,
    now_instant: Instant,
    now_system_time: SystemTime,
    genesis_time: UnixSeconds,
) -> Result<(Tick, Instant)> {
    let unix_epoch_to_now = now_system_time.duration_since(SystemTime::UNIX_EPOCH)?;
    let unix_epoch_to_genesis = Duration::from_secs(genesis_time);

    let mut next_tick;
    let mut now_to_next_tick;

    if unix_epoch_to_now <= unix_epoch_to_genesis {
        next_tick = Tick::start_of_slot(GENESIS_SLOT);
        now_to_next_tick = unix_epoch_to_genesis - unix_epoch_to_now;
    } else {
        let tick_duration = tick_duration(config);
        let genesis_to_now = unix_epoch_to_now - unix_epoch_to_genesis;
        let slots_since_genesis = genesis_to_now.as_secs() / config.seconds_per_slot.get();
        let genesis_to_current_slot =
            Duration::from_secs(slots_since_genesis * config.seconds_per_slot.get());
        let current_slot_to_now = genesis_to_now - genesis_to_current_slot;

        next_tick = Tick::start_of_slot(GENESIS_SLOT + slots_since_genesis);
        now_to_next_tick = Duration::ZERO;

        while now_to_next_tick < current_slot_to_now {
            next_tick = next_tick.next()?;
            now_to_next_tick += tick_duration;
        }

        now_to_next_tick -= current_slot_to_now;
    }

    let next_instant = now_instant
        .checked_add(now_to_next_tick)
        .ok_or(ClockError::NextInstantOverflow)?;

    Ok((next_tick, next_instant))
}

fn tick_duration(config: &Config) -> Duration {
    let intervals =
        u32::try_from(INTERVALS_PER_SLOT.get()).expect("number of intervals per slot fits in u32");

    config.slot_duration() / intervals
}

#[cfg(test)]
mod tests {
    use core::ops::Add as _;

    use futures::future::FutureExt as _;
    use test_case::test_case;

    use super::*;

    #[test_case(-24 => Tick::new(0, TickKind::Propose);   "24 seconds before genesis")]
    #[test_case(  0 => Tick::new(0, TickKind::Propose);   "at genesis")]
    #[test_case(  3 => Tick::new(0, TickKind::Propose);   "3 seconds after genesis")]
    #[test_case(  4 => Tick::new(0, TickKind::Attest);    "4 seconds after genesis")]
    #[test_case(  8 => Tick::new(0, TickKind::Aggregate); "8 seconds after genesis")]
    #[test_case( 12 => Tick::new(1, TickKind::Propose);   "12 seconds after genesis")]
    #[test_case( 25 => Tick::new(2, TickKind::Attest);    "25 seconds after genesis")]
    fn tick_at_time_relative_to_genesis_with_mainnet_config(offset: i64) -> Tick {
        let config = Config::mainnet();
        let genesis_time = config.min_genesis_time;

        let time = genesis_time
            .checked_add_signed(offset)
            .expect("offset is small enough for the resulting time to fit in UnixSeconds");

        Tick::at_time(&config, time, genesis_time)
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_with_mainnet_config_produces_a_tick_every_interval() -> Result<()> {
        let genesis_time = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_secs()
            .add(1);

        let mut ticks = ticks(&Config::mainnet(), genesis_time)?;
        let mut next_tick = || ticks.next().now_or_never().flatten().transpose();

        assert_eq!(next_tick()?, None);

        tokio::time::advance(Duration::from_secs(1)).await;

        assert_eq!(next_tick()?, Some(Tick::new(0, TickKind::Propose)));
        assert_eq!(next_tick()?, None);

        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(next_tick()?, Some(Tick::new(0, TickKind::Attest)));
        assert_eq!(next_tick()?, None);

        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(next_tick()?, Some(Tick::new(0, TickKind::Aggregate)));
        assert_eq!(next_tick()?, None);

        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(next_tick()?, Some(Tick::new(1, TickKind::Propose)));

        Ok(())
    }
}
