use crate::types::TimelinePoint;

/// Percent of intraday samples priced at or above the running average.
///
/// The running average is the provider's `avg_price` where present; a missing
/// or non-positive one falls back to the mean of all prices seen so far.
/// An empty timeline scores 0.
pub fn above_average_ratio(points: &[TimelinePoint]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }

    let mut price_sum = 0.0;
    let mut above = 0usize;
    for (i, point) in points.iter().enumerate() {
        price_sum += point.price;
        let running_avg = match point.avg_price {
            Some(avg) if avg > 0.0 => avg,
            _ => price_sum / (i + 1) as f64,
        };
        if point.price >= running_avg {
            above += 1;
        }
    }

    above as f64 / points.len() as f64 * 100.0
}
