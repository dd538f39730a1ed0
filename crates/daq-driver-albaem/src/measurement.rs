//! Parsing of bulk measurement replies.
//!
//! `ACQU:MEAS?` answers with a literal list of `(channel name, samples)` pairs:
//!
//! ```text
//! [['CHAN01', [1.0, 2.0]], ['CHAN02', [3.0, 4.0]]]
//! ```
//!
//! Tuples and the mapping form `{'CHAN01': [1.0, 2.0]}` are accepted as well.
//! Pairs are extracted with a regex rather than a full literal parser; only
//! flat numeric sample lists are supported.

use daq_core::error::{AppResult, DaqError};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Raw samples per channel name, before calibration.
pub type RawMeasurement = BTreeMap<String, Vec<f64>>;

/// `'NAME'` followed by `,` or `:` and a bracketed sample list.
static PAIR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"['"](\w+)['"]\s*[,:]\s*[\[(]([^\[\]()]*)[\])]"#)
        .expect("Invalid measurement pair regex")
});

/// Parse a measurement reply into per-channel sample vectors.
///
/// # Errors
/// [`DaqError::Parse`] if the reply is not a list/mapping of channel pairs, a
/// sample is not numeric, or a channel appears twice.
pub fn parse_measurement(reply: &str) -> AppResult<RawMeasurement> {
    let trimmed = reply.trim();
    if !trimmed.starts_with(['[', '(', '{']) {
        return Err(DaqError::Parse(format!(
            "measurement reply is not a list: {trimmed:?}"
        )));
    }

    let mut channels = RawMeasurement::new();
    for caps in PAIR_REGEX.captures_iter(trimmed) {
        let name = caps[1].to_string();
        let samples = caps[2]
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<f64>().map_err(|_| {
                    DaqError::Parse(format!("channel {name}: sample {s:?} is not a number"))
                })
            })
            .collect::<AppResult<Vec<f64>>>()?;

        if channels.insert(name.clone(), samples).is_some() {
            return Err(DaqError::Parse(format!(
                "channel {name} appears twice in measurement reply"
            )));
        }
    }

    if channels.is_empty() && !is_empty_literal(trimmed) {
        return Err(DaqError::Parse(format!(
            "no channel data in measurement reply: {trimmed:?}"
        )));
    }

    Ok(channels)
}

fn is_empty_literal(text: &str) -> bool {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    matches!(compact.as_str(), "[]" | "()" | "{}")
}

/// Channel number encoded in a name like `CHAN03`.
pub fn channel_number(name: &str) -> Option<usize> {
    name.strip_prefix("CHAN")?.parse().ok()
}
