//! ISO-8601 duration parsing for provider `contentDetails.duration` values.

const SECONDS_PER_MINUTE: u64 = 60;
const SECONDS_PER_HOUR: u64 = 60 * SECONDS_PER_MINUTE;
const SECONDS_PER_DAY: u64 = 24 * SECONDS_PER_HOUR;
const SECONDS_PER_WEEK: u64 = 7 * SECONDS_PER_DAY;

/// Parse `P[nW][nD][T[nH][nM][n[.f]S]]` into whole seconds.
///
/// Year and month designators are rejected because their length is not
/// fixed. Fractional seconds are truncated. Returns `None` for anything
/// malformed, including a bare `P` or `PT`.
pub fn parse_iso8601_duration(input: &str) -> Option<u64> {
    let rest = input.trim().strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) => {
            if time.is_empty() {
                return None;
            }
            (date, Some(time))
        }
        None => (rest, None),
    };

    if date_part.is_empty() && time_part.is_none() {
        return None;
    }

    let mut total = 0_u64;
    for (value, unit) in components(date_part)? {
        let scale = match unit {
            'W' => SECONDS_PER_WEEK,
            'D' => SECONDS_PER_DAY,
            _ => return None,
        };
        total = total.checked_add(whole(value)?.checked_mul(scale)?)?;
    }

    if let Some(time_part) = time_part {
        for (value, unit) in components(time_part)? {
            let seconds = match unit {
                'H' => whole(value)?.checked_mul(SECONDS_PER_HOUR)?,
                'M' => whole(value)?.checked_mul(SECONDS_PER_MINUTE)?,
                'S' => seconds(value)?,
                _ => return None,
            };
            total = total.checked_add(seconds)?;
        }
    }

    Some(total)
}

/// Split `1H2M3S` into `[("1", 'H'), ("2", 'M'), ("3", 'S')]`, enforcing that
/// designators appear at most once and in the canonical order.
fn components(part: &str) -> Option<Vec<(&str, char)>> {
    const ORDER: &str = "WDHMS";

    let mut components = Vec::new();
    let mut start = 0;
    let mut last_rank = None;
    for (index, ch) in part.char_indices() {
        if ch.is_ascii_digit() || ch == '.' || ch == ',' {
            continue;
        }
        let rank = ORDER.find(ch)?;
        if last_rank.is_some_and(|last| rank <= last) {
            return None;
        }
        let value = &part[start..index];
        if value.is_empty() {
            return None;
        }
        components.push((value, ch));
        last_rank = Some(rank);
        start = index + ch.len_utf8();
    }

    if start != part.len() {
        return None;
    }
    Some(components)
}

fn whole(value: &str) -> Option<u64> {
    value.parse().ok()
}

fn seconds(value: &str) -> Option<u64> {
    let value = value.replace(',', ".");
    match value.split_once('.') {
        Some((integer, fraction)) => {
            if integer.is_empty() || fraction.is_empty() {
                return None;
            }
            if !fraction.chars().all(|ch| ch.is_ascii_digit()) {
                return None;
            }
            whole(integer)
        }
        None => whole(&value),
    }
}
