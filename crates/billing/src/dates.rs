//! Billing-interval date arithmetic
//!
//! Month addition clamps to the last valid day of the target month
//! (Jan 31 + 1 month = Feb 28/29, never Mar 3). Naive day-preserving
//! addition would silently overflow into the following month.

use time::{Date, Month, OffsetDateTime};

use crate::subscription::BillingInterval;

const MONTHS: [Month; 12] = [
    Month::January,
    Month::February,
    Month::March,
    Month::April,
    Month::May,
    Month::June,
    Month::July,
    Month::August,
    Month::September,
    Month::October,
    Month::November,
    Month::December,
];

/// Advance a billing moment by one interval, preserving the time of day.
pub fn add_interval(moment: OffsetDateTime, interval: BillingInterval) -> OffsetDateTime {
    moment.replace_date(add_months(moment.date(), interval.months()))
}

fn add_months(date: Date, months: i32) -> Date {
    let zero_based = i32::from(u8::from(date.month())) - 1 + months;
    let year = date.year() + zero_based.div_euclid(12);
    let month = MONTHS[zero_based.rem_euclid(12) as usize];
    let day = date.day().min(time::util::days_in_year_month(year, month));
    // Cannot fail: the day is clamped to the target month's length.
    Date::from_calendar_date(year, month, day).unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn monthly_clamps_to_leap_february() {
        let jan31 = datetime!(2024-01-31 09:00 UTC);
        assert_eq!(
            add_interval(jan31, BillingInterval::Monthly),
            datetime!(2024-02-29 09:00 UTC)
        );
    }

    #[test]
    fn monthly_clamps_to_common_february() {
        let jan31 = datetime!(2023-01-31 09:00 UTC);
        assert_eq!(
            add_interval(jan31, BillingInterval::Monthly),
            datetime!(2023-02-28 09:00 UTC)
        );
    }

    #[test]
    fn yearly_preserves_day() {
        let jan31 = datetime!(2024-01-31 00:00 UTC);
        assert_eq!(
            add_interval(jan31, BillingInterval::Yearly),
            datetime!(2025-01-31 00:00 UTC)
        );
    }

    #[test]
    fn half_year_crosses_year_boundary() {
        let aug31 = datetime!(2024-08-31 12:30 UTC);
        assert_eq!(
            add_interval(aug31, BillingInterval::HalfYear),
            datetime!(2025-02-28 12:30 UTC)
        );
    }

    #[test]
    fn mid_month_days_are_untouched() {
        let mar15 = datetime!(2024-03-15 00:00 UTC);
        assert_eq!(
            add_interval(mar15, BillingInterval::Monthly),
            datetime!(2024-04-15 00:00 UTC)
        );
    }
}
