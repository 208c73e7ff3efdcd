//! Daily server-save timing.
//!
//! Players are warned before the save, so the prepare event is scheduled
//! five minutes ahead of the configured hour: hour `h` means `(h-1):55:00`
//! local time, and hour `0` means `23:55:00`. If that instant already
//! passed today the next day's occurrence is used.

use std::time::Duration;

use chrono::{Local, NaiveDateTime, TimeDelta};

/// Minute of the hour before the configured hour at which the prepare
/// event fires.
pub const PREPARE_MINUTE: u32 = 55;

/// Time from `now` until the next prepare-server-save instant for `hour`.
///
/// Returns `None` for hours outside `0..=24`.
pub fn server_save_delay(now: NaiveDateTime, hour: u32) -> Option<Duration> {
    if hour > 24 {
        return None;
    }
    let target_hour = hour.checked_sub(1).unwrap_or(23);
    let target = now.date().and_hms_opt(target_hour, PREPARE_MINUTE, 0)?;

    let mut difference = target.signed_duration_since(now);
    if difference < TimeDelta::zero() {
        difference = difference.checked_add(&TimeDelta::try_days(1)?)?;
    }
    difference.to_std().ok()
}

/// [`server_save_delay`] against the current local wall-clock time.
pub fn next_server_save_delay(hour: u32) -> Option<Duration> {
    server_save_delay(Local::now().naive_local(), hour)
}
