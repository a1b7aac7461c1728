use crate::calendar;
use crate::model::*;

use super::EngineError;

/// Hourly rate for a slot starting at `time_key` (`HH:MM:SS`) on `day_type`.
///
/// First row in `rules` order with `start_hour <= time_key < end_hour` wins.
/// The comparison is lexical on fixed-width `HH:MM:SS` strings; rows are
/// normalised on insert so this matches clock order. No match yields `0.0`.
pub fn price_for_slot(day_type: DayType, time_key: &str, rules: &[PricingRule]) -> f64 {
    rules
        .iter()
        .find(|p| {
            p.day_type == day_type
                && p.start_hour.as_str() <= time_key
                && time_key < p.end_hour.as_str()
        })
        .map_or(0.0, |p| p.price_per_hour)
}

/// Total cost of `span`: the start instant's rate times fractional hours.
///
/// Day type comes from the start date only and the rate is not re-applied
/// when the span crosses into another pricing interval or day.
pub fn total_price(span: &Span, rules: &[PricingRule]) -> Result<f64, EngineError> {
    let day_type = calendar::day_type_at(span.start)?;
    let key = calendar::time_key_at(span.start)?;
    Ok(price_for_slot(day_type, &key, rules) * span.hours())
}
