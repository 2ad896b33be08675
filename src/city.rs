//! Lyft-operated bike-share systems and the layout of their published trip data.
//!
//! Rules implemented:
//! - monthly archives are named `{YYYYMM}-{system}-tripdata.zip` (Portland: `{YYYYMM}.csv.zip`)
//! - archive timestamps are local wall-clock time in the city's IANA timezone
//! - each system has a declared valid data range; Portland publishes nothing after 2020

use std::fmt;
use std::str::FromStr;

use chrono_tz::America::{Chicago, Los_Angeles, New_York};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum City {
    BayArea,
    Chicago,
    NewYork,
    Columbus,
    WashingtonDc,
    Portland,
}

pub const ALL_CITIES: [City; 6] = [
    City::BayArea,
    City::Chicago,
    City::NewYork,
    City::Columbus,
    City::WashingtonDc,
    City::Portland,
];

pub const PORTLAND_LAST_PUBLISHED_YEAR: i32 = 2020;
/// 2021-01-01T00:00:00Z, the first instant after Portland's last published year.
const PORTLAND_RANGE_END_MS: i64 = 1_609_459_200_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CityError {
    #[error("Lyft doesn't operate a bike-sharing system in: {0}")]
    UnsupportedCity(String),
}

/// Half-open `[start, end)` window, in UTC milliseconds, in which trip events are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidRange {
    pub start_ts_ms_utc: i64,
    pub end_ts_ms_utc_exclusive: Option<i64>,
}

impl ValidRange {
    pub fn contains(&self, ts_ms_utc: i64) -> bool {
        ts_ms_utc >= self.start_ts_ms_utc
            && self
                .end_ts_ms_utc_exclusive
                .map(|end| ts_ms_utc < end)
                .unwrap_or(true)
    }
}

impl City {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BayArea => "bay_area",
            Self::Chicago => "chicago",
            Self::NewYork => "new_york",
            Self::Columbus => "columbus",
            Self::WashingtonDc => "washington_dc",
            Self::Portland => "portland",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::BayArea => "the Bay Area",
            Self::Chicago => "Chicago",
            Self::NewYork => "New York City",
            Self::Columbus => "Columbus",
            Self::WashingtonDc => "Washington DC",
            Self::Portland => "Portland",
        }
    }

    pub fn service_name(self) -> &'static str {
        match self {
            Self::BayArea => "bay-wheels",
            Self::Chicago => "divvybikes",
            Self::NewYork => "citibikenyc",
            Self::Columbus => "cogobikeshare",
            Self::WashingtonDc => "capitalbikeshare",
            Self::Portland => "biketownpdx",
        }
    }

    pub fn system_data_url(self) -> String {
        match self {
            // The Bay Area page lives under lyft.com rather than the system's own domain.
            Self::BayArea => format!("https://lyft.com/bikes/{}", self.service_name()),
            _ => format!("https://{}.com/system-data", self.service_name()),
        }
    }

    pub fn timezone(self) -> Tz {
        match self {
            Self::BayArea | Self::Portland => Los_Angeles,
            Self::Chicago => Chicago,
            Self::NewYork | Self::Columbus | Self::WashingtonDc => New_York,
        }
    }

    pub fn valid_range(self) -> ValidRange {
        // Service launch dates, 00:00Z.
        let start_ts_ms_utc = match self {
            Self::BayArea => 1_377_734_400_000,      // 2013-08-29
            Self::Chicago => 1_372_291_200_000,      // 2013-06-27
            Self::NewYork => 1_369_612_800_000,      // 2013-05-27
            Self::Columbus => 1_375_142_400_000,     // 2013-07-30
            Self::WashingtonDc => 1_284_940_800_000, // 2010-09-20
            Self::Portland => 1_468_886_400_000,     // 2016-07-19
        };
        let end_ts_ms_utc_exclusive = match self {
            Self::Portland => Some(PORTLAND_RANGE_END_MS),
            _ => None,
        };

        ValidRange {
            start_ts_ms_utc,
            end_ts_ms_utc_exclusive,
        }
    }

    pub fn publishes_year(self, year: i32) -> bool {
        !(matches!(self, Self::Portland) && year > PORTLAND_LAST_PUBLISHED_YEAR)
    }

    pub(crate) fn archive_url_head(self) -> &'static str {
        match self {
            Self::BayArea => "s3.amazonaws.com/baywheels-data/",
            Self::Chicago => "divvy-tripdata.s3.amazonaws.com/",
            Self::NewYork => "s3.amazonaws.com/tripdata/",
            Self::Columbus => "cogo-sys-data.s3.amazonaws.com/",
            Self::WashingtonDc => "s3.amazonaws.com/capitalbikeshare-data/",
            Self::Portland => "s3.amazonaws.com/biketown-tripdata-public/",
        }
    }

    pub fn archive_file_stem(self, year: i32, month: u32) -> String {
        let year_and_month = format!("{year}{month:02}");
        match self {
            Self::BayArea => format!("{year_and_month}-baywheels-tripdata"),
            Self::Chicago => format!("{year_and_month}-divvy-tripdata"),
            Self::NewYork => format!("{year_and_month}-citibike-tripdata"),
            Self::Columbus => format!("{year_and_month}-cogo-tripdata"),
            Self::WashingtonDc => format!("{year_and_month}-capitalbikeshare-tripdata"),
            Self::Portland => format!("{year_and_month}.csv"),
        }
    }
}

pub fn parse_city(input: &str) -> Result<City, CityError> {
    let normalized = input.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    match normalized.as_str() {
        "bay_area" | "san_francisco" => Ok(City::BayArea),
        "chicago" => Ok(City::Chicago),
        "new_york" | "new_york_city" | "nyc" => Ok(City::NewYork),
        "columbus" => Ok(City::Columbus),
        "washington_dc" | "washington" | "dc" => Ok(City::WashingtonDc),
        "portland" => Ok(City::Portland),
        _ => Err(CityError::UnsupportedCity(input.to_string())),
    }
}

impl FromStr for City {
    type Err = CityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_city(s)
    }
}

impl fmt::Display for City {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn utc_midnight_ms(year: i32, month: u32, day: u32) -> i64 {
        let date = NaiveDate::from_ymd_opt(year, month, day).unwrap();
        Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap())
            .timestamp_millis()
    }

    #[test]
    fn parse_accepts_spacing_and_aliases() {
        assert_eq!(parse_city("New York").unwrap(), City::NewYork);
        assert_eq!(parse_city("washington-dc").unwrap(), City::WashingtonDc);
        assert_eq!(parse_city("BAY_AREA").unwrap(), City::BayArea);
        assert!(matches!(
            parse_city("houston"),
            Err(CityError::UnsupportedCity(_))
        ));
    }

    #[test]
    fn archive_file_stems_follow_published_naming() {
        assert_eq!(
            City::Chicago.archive_file_stem(2024, 3),
            "202403-divvy-tripdata"
        );
        assert_eq!(
            City::NewYork.archive_file_stem(2024, 11),
            "202411-citibike-tripdata"
        );
        assert_eq!(City::Portland.archive_file_stem(2019, 7), "201907.csv");
    }

    #[test]
    fn system_data_url_special_cases_bay_area() {
        assert_eq!(
            City::BayArea.system_data_url(),
            "https://lyft.com/bikes/bay-wheels"
        );
        assert_eq!(
            City::Chicago.system_data_url(),
            "https://divvybikes.com/system-data"
        );
    }

    #[test]
    fn display_names_read_as_prose() {
        assert_eq!(City::BayArea.display_name(), "the Bay Area");
        assert_eq!(City::WashingtonDc.display_name(), "Washington DC");
    }

    #[test]
    fn launch_dates_are_utc_midnights() {
        assert_eq!(
            City::BayArea.valid_range().start_ts_ms_utc,
            utc_midnight_ms(2013, 8, 29)
        );
        assert_eq!(
            City::WashingtonDc.valid_range().start_ts_ms_utc,
            utc_midnight_ms(2010, 9, 20)
        );
        assert_eq!(
            City::Portland.valid_range().end_ts_ms_utc_exclusive,
            Some(utc_midnight_ms(PORTLAND_LAST_PUBLISHED_YEAR + 1, 1, 1))
        );
    }

    #[test]
    fn portland_range_is_closed_after_2020() {
        let range = City::Portland.valid_range();
        assert!(range.contains(utc_midnight_ms(2020, 12, 31)));
        assert!(!range.contains(utc_midnight_ms(2021, 1, 1)));
        assert!(!City::Portland.publishes_year(2021));
        assert!(City::Chicago.valid_range().contains(utc_midnight_ms(2030, 1, 1)));
        assert!(!City::Chicago.valid_range().contains(utc_midnight_ms(2012, 1, 1)));
    }
}
