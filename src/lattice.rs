//! Slot lattice: the bookable windows of a set of pools on one day.
//!
//! Pool `i` opens `i * stagger` minutes after the facility and also closes that much
//! later, so every pool gets the same number of windows, shifted uniformly.

use chrono::{DateTime, NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::config::OperatingWindow;
use crate::limits::MAX_SLOTS_PER_POOL_DAY;
use crate::model::{Ms, Span, MINUTE_MS};

/// A pool as seen by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatticePool {
    pub pool_id: Ulid,
    pub stagger_index: u32,
}

/// A window the generator wants to exist. Ids are assigned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSpec {
    pub pool_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatticeError {
    MalformedWindow { open: NaiveTime, close: NaiveTime },
    ZeroDuration,
}

impl std::fmt::Display for LatticeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LatticeError::MalformedWindow { open, close } => {
                write!(f, "operating window closes ({close}) at or before it opens ({open})")
            }
            LatticeError::ZeroDuration => write!(f, "slot duration must be positive"),
        }
    }
}

impl std::error::Error for LatticeError {}

/// Instant of `time` on `date`, in facility time.
pub fn instant(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
}

/// Calendar date of an instant, in facility time.
pub fn date_of(t: Ms) -> NaiveDate {
    DateTime::from_timestamp_millis(t).map_or(NaiveDate::MIN, |dt| dt.date_naive())
}

pub fn generate(
    pools: &[LatticePool],
    date: NaiveDate,
    window: OperatingWindow,
    slot_minutes: u32,
    stagger_minutes: u32,
) -> Result<Vec<SlotSpec>, LatticeError> {
    if !window.is_well_formed() {
        return Err(LatticeError::MalformedWindow {
            open: window.open,
            close: window.close,
        });
    }
    if slot_minutes == 0 {
        return Err(LatticeError::ZeroDuration);
    }

    let open = instant(date, window.open);
    let close = instant(date, window.close);
    let duration = slot_minutes as Ms * MINUTE_MS;

    let mut specs = Vec::new();
    for pool in pools {
        let offset = pool.stagger_index as Ms * stagger_minutes as Ms * MINUTE_MS;
        let boundary = close + offset;
        let mut start = open + offset;
        let mut emitted = 0usize;
        while start + duration <= boundary && emitted < MAX_SLOTS_PER_POOL_DAY {
            specs.push(SlotSpec {
                pool_id: pool.pool_id,
                date,
                span: Span::new(start, start + duration),
            });
            start += duration;
            emitted += 1;
        }
    }
    Ok(specs)
}
