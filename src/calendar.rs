//! Deterministic calendar features for an hour in a city's local time.

use std::f64::consts::PI;

use chrono::{Datelike, NaiveDate, TimeZone, Timelike, Utc, Weekday};

use crate::City;

const HOURS_PER_WEEK: f64 = 7.0 * 24.0;

pub const CALENDAR_FEATURE_NAMES: [&str; 6] = [
    "hour_of_day",
    "day_of_week",
    "is_weekend",
    "is_holiday",
    "how_sin",
    "how_cos",
];

/// Returns the calendar feature values, in `CALENDAR_FEATURE_NAMES` order, for an hour
/// starting at `hour_ts_ms_utc`, or `None` if the timestamp is not representable.
pub fn calendar_features(hour_ts_ms_utc: i64, city: City) -> Option<[f64; 6]> {
    let local = Utc
        .timestamp_millis_opt(hour_ts_ms_utc)
        .single()?
        .with_timezone(&city.timezone());
    let weekday = local.weekday().num_days_from_monday();
    let hour = local.hour();
    let hour_of_week = (weekday * 24 + hour) as f64;
    let angle = 2.0 * PI * (hour_of_week / HOURS_PER_WEEK);
    let is_weekend = matches!(local.weekday(), Weekday::Sat | Weekday::Sun);

    Some([
        hour as f64,
        weekday as f64,
        bool_feature(is_weekend),
        bool_feature(is_us_federal_holiday(local.date_naive())),
        angle.sin(),
        angle.cos(),
    ])
}

/// US federal holidays as observed: Saturday holidays move to Friday, Sunday ones to Monday.
pub fn is_us_federal_holiday(date: NaiveDate) -> bool {
    observed_federal_holidays(date.year()).contains(&date)
        || observed_federal_holidays(date.year() + 1).contains(&date)
}

pub fn observed_federal_holidays(year: i32) -> Vec<NaiveDate> {
    let mut fixed = vec![(1, 1), (7, 4), (11, 11), (12, 25)];
    if year >= 2021 {
        fixed.push((6, 19));
    }

    let mut out: Vec<NaiveDate> = fixed
        .into_iter()
        .filter_map(|(month, day)| NaiveDate::from_ymd_opt(year, month, day))
        .map(observed)
        .collect();

    out.extend(
        [
            nth_weekday(year, 1, Weekday::Mon, 3),
            nth_weekday(year, 2, Weekday::Mon, 3),
            last_weekday(year, 5, Weekday::Mon),
            nth_weekday(year, 9, Weekday::Mon, 1),
            nth_weekday(year, 10, Weekday::Mon, 2),
            nth_weekday(year, 11, Weekday::Thu, 4),
        ]
        .into_iter()
        .flatten(),
    );

    out.sort();
    out
}

fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date.pred_opt().unwrap_or(date),
        Weekday::Sun => date.succ_opt().unwrap_or(date),
        _ => date,
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    nth_weekday(year, month, weekday, 5).or_else(|| nth_weekday(year, month, weekday, 4))
}

fn bool_feature(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}
