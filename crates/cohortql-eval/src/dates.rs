//! Calendar arithmetic
//!
//! Month and year addition roll a day overflow forward to the first of the
//! following month rather than clipping: `2020-01-31 + 1 month` is
//! `2020-03-01`, and `2020-02-29 + 1 year` is `2021-03-01`. The SQL backends
//! emit correction expressions to reproduce exactly this.

use chrono::{Datelike, Days, NaiveDate};

pub fn date_add_days(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    if days >= 0 {
        date.checked_add_days(Days::new(days as u64))
    } else {
        date.checked_sub_days(Days::new(days.unsigned_abs()))
    }
}

pub fn date_add_months(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    let zero_based = i64::from(date.year()) * 12 + i64::from(date.month0());
    let total = zero_based.checked_add(months)?;
    let year = i32::try_from(total.div_euclid(12)).ok()?;
    let month = (total.rem_euclid(12) + 1) as u32;
    match NaiveDate::from_ymd_opt(year, month, date.day()) {
        Some(d) => Some(d),
        None => first_of_next_month(year, month),
    }
}

pub fn date_add_years(date: NaiveDate, years: i64) -> Option<NaiveDate> {
    let year = i32::try_from(i64::from(date.year()).checked_add(years)?).ok()?;
    match NaiveDate::from_ymd_opt(year, date.month(), date.day()) {
        Some(d) => Some(d),
        // Only 29 Feb can overflow here.
        None => first_of_next_month(year, date.month()),
    }
}

fn first_of_next_month(year: i32, month: u32) -> Option<NaiveDate> {
    if month == 12 {
        NaiveDate::from_ymd_opt(year.checked_add(1)?, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
}

pub fn date_difference_in_days(start: NaiveDate, end: NaiveDate) -> i64 {
    (end - start).num_days()
}

/// Signed count of whole calendar months from `start` to `end`.
pub fn date_difference_in_months(start: NaiveDate, end: NaiveDate) -> i64 {
    let months = (i64::from(end.year()) * 12 + i64::from(end.month0()))
        - (i64::from(start.year()) * 12 + i64::from(start.month0()));
    if end.day() < start.day() { months - 1 } else { months }
}

/// Signed count of whole calendar years from `start` to `end`.
pub fn date_difference_in_years(start: NaiveDate, end: NaiveDate) -> i64 {
    let years = i64::from(end.year()) - i64::from(start.year());
    if (end.month(), end.day()) < (start.month(), start.day()) {
        years - 1
    } else {
        years
    }
}

pub fn to_first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

pub fn to_first_of_year(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[rstest]
    #[case(ymd(2020, 1, 15), 1, ymd(2020, 2, 15))]
    #[case(ymd(2020, 1, 31), 1, ymd(2020, 3, 1))] // no 31 Feb: roll forward
    #[case(ymd(2020, 1, 31), 3, ymd(2020, 5, 1))] // no 31 Apr either
    #[case(ymd(2020, 3, 31), -1, ymd(2020, 3, 1))]
    #[case(ymd(2020, 11, 30), 2, ymd(2021, 1, 30))]
    #[case(ymd(2020, 6, 15), -18, ymd(2018, 12, 15))]
    fn month_addition_rolls_overflow_forward(
        #[case] start: NaiveDate,
        #[case] months: i64,
        #[case] expected: NaiveDate,
    ) {
        assert_eq!(date_add_months(start, months), Some(expected));
    }

    #[rstest]
    #[case(ymd(2020, 2, 29), 1, ymd(2021, 3, 1))]
    #[case(ymd(2020, 2, 29), 4, ymd(2024, 2, 29))]
    #[case(ymd(2020, 2, 29), -1, ymd(2019, 3, 1))]
    #[case(ymd(2021, 6, 1), 10, ymd(2031, 6, 1))]
    fn year_addition_handles_leap_days(
        #[case] start: NaiveDate,
        #[case] years: i64,
        #[case] expected: NaiveDate,
    ) {
        assert_eq!(date_add_years(start, years), Some(expected));
    }

    #[test]
    fn day_addition_is_signed() {
        assert_eq!(date_add_days(ymd(2020, 1, 1), 31), Some(ymd(2020, 2, 1)));
        assert_eq!(date_add_days(ymd(2020, 3, 1), -1), Some(ymd(2020, 2, 29)));
    }

    #[rstest]
    #[case(ymd(2020, 1, 31), ymd(2020, 2, 1), 1)]
    #[case(ymd(2020, 2, 1), ymd(2020, 1, 31), -1)]
    #[case(ymd(2020, 1, 1), ymd(2021, 1, 1), 366)]
    fn day_differences(#[case] start: NaiveDate, #[case] end: NaiveDate, #[case] expected: i64) {
        assert_eq!(date_difference_in_days(start, end), expected);
    }

    #[rstest]
    #[case(ymd(2020, 1, 15), ymd(2020, 2, 15), 1)]
    #[case(ymd(2020, 1, 15), ymd(2020, 2, 14), 0)]
    #[case(ymd(2020, 1, 31), ymd(2020, 2, 29), 0)]
    #[case(ymd(2019, 12, 1), ymd(2020, 2, 1), 2)]
    fn month_differences_count_whole_months(
        #[case] start: NaiveDate,
        #[case] end: NaiveDate,
        #[case] expected: i64,
    ) {
        assert_eq!(date_difference_in_months(start, end), expected);
    }

    #[rstest]
    #[case(ymd(2000, 6, 15), ymd(2020, 6, 15), 20)]
    #[case(ymd(2000, 6, 15), ymd(2020, 6, 14), 19)]
    #[case(ymd(2020, 6, 15), ymd(2000, 6, 15), -20)]
    fn year_differences_count_whole_years(
        #[case] start: NaiveDate,
        #[case] end: NaiveDate,
        #[case] expected: i64,
    ) {
        assert_eq!(date_difference_in_years(start, end), expected);
    }

    #[test]
    fn truncation_to_period_starts() {
        assert_eq!(to_first_of_month(ymd(2020, 6, 15)), ymd(2020, 6, 1));
        assert_eq!(to_first_of_year(ymd(2020, 6, 15)), ymd(2020, 1, 1));
    }
}
