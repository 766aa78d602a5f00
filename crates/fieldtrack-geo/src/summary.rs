use fieldtrack_proto::{DailySummary, Position};
use time::{Date, UtcOffset};

use crate::geo::path_length_m;
use crate::history::History;

/// Summary over the samples of `date` (midnight to midnight at `offset`).
///
/// Distance only chains samples of that day, in history order.
pub fn daily_summary(history: &History, date: Date, offset: UtcOffset) -> DailySummary {
    let day: Vec<&Position> = history.on_date(date, offset).collect();
    let (Some(first), Some(last)) = (day.first(), day.last()) else {
        return DailySummary::empty(date);
    };

    let accuracies: Vec<f64> = day.iter().filter_map(|p| p.accuracy).collect();
    let average_accuracy_m = if accuracies.is_empty() {
        0.0
    } else {
        accuracies.iter().sum::<f64>() / accuracies.len() as f64
    };

    DailySummary {
        date,
        sample_count: day.len(),
        first_sample: Some((*first).clone()),
        last_sample: Some((*last).clone()),
        total_distance_m: path_length_m(day.iter().copied()),
        average_accuracy_m,
    }
}

/// Offset of the host's local time zone, UTC when it cannot be determined.
pub fn local_offset() -> UtcOffset {
    UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC)
}
