//! Recurring cadence arithmetic.
//!
//! Pure functions from a reference instant to the next firing time. All
//! arithmetic is done in UTC and every result is strictly after `from`.

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Timelike, Utc};

use crate::models::TaskType;

/// A wall-clock slot within a UTC day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTime {
    pub hour: u32,
    pub minute: u32,
}

impl SlotTime {
    pub const fn new(hour: u32, minute: u32) -> Self {
        Self { hour, minute }
    }

    fn on(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        date.and_hms_opt(self.hour, self.minute, 0)
            .map(|naive| naive.and_utc())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed `{hour, minute}` slots every UTC day.
    DailyAt(Vec<SlotTime>),
    /// Fixed minute offsets within every hour.
    HourlyAt(Vec<u32>),
    /// The start of every whole minute.
    EveryMinute,
}

impl Cadence {
    /// Soonest firing time strictly after `from`.
    ///
    /// Returns `None` only for a cadence with no usable slots (empty list or
    /// out-of-range values).
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::DailyAt(slots) => {
                let today = from.date_naive();
                let tomorrow = today.succ_opt()?;
                [today, tomorrow]
                    .into_iter()
                    .flat_map(|date| slots.iter().filter_map(move |slot| slot.on(date)))
                    .filter(|candidate| *candidate > from)
                    .min()
            }
            Cadence::HourlyAt(minutes) => {
                let hour_start = from
                    .date_naive()
                    .and_hms_opt(from.hour(), 0, 0)?
                    .and_utc();
                [hour_start, hour_start + Duration::hours(1)]
                    .into_iter()
                    .flat_map(|start| {
                        minutes
                            .iter()
                            .filter(|minute| **minute < 60)
                            .map(move |minute| start + Duration::minutes(i64::from(*minute)))
                    })
                    .filter(|candidate| *candidate > from)
                    .min()
            }
            Cadence::EveryMinute => {
                let minute_start = from
                    .date_naive()
                    .and_hms_opt(from.hour(), from.minute(), 0)?
                    .and_utc();
                Some(minute_start + Duration::minutes(1))
            }
        }
    }
}

/// Dedupe key for one recurring slot, e.g. `chargePaymentPlans:2024-01-02T00:00:00.000Z`.
pub fn slot_dedupe_key(task_type: TaskType, fire_at: DateTime<Utc>) -> String {
    format!(
        "{}:{}",
        task_type,
        fire_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}
