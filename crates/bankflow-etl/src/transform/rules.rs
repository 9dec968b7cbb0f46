//! Cleaning primitives and derived-field rules.

use chrono::{Datelike, NaiveDate};

/// Placeholder written for missing text values.
pub const NA: &str = "NA";

const NULL_TEXT: &[&str] = &["", "none", "nan", "null", "n/a"];

/// Four-digit-year layouts, tried in order.
const DATE_FORMATS: &[&str] = &[
    "%d-%m-%Y", "%m-%d-%Y", "%Y-%m-%d",
    "%d/%m/%Y", "%m/%d/%Y", "%Y/%m/%d",
    "%d.%m.%Y", "%m.%d.%Y", "%Y.%m.%d",
];

/// Years accepted around the reference date.
const MAX_YEARS_BACK: i32 = 120;
const MAX_YEARS_AHEAD: i32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Case {
    Keep,
    Title,
    Upper,
    Lower,
}

pub fn is_null_text(raw: Option<&str>) -> bool {
    match raw {
        None => true,
        Some(s) => NULL_TEXT.contains(&s.trim().to_ascii_lowercase().as_str()),
    }
}

/// Capitalise the first letter of every alphabetic run and lower-case the rest.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for ch in s.chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}

pub fn apply_case(s: &str, case: Case) -> String {
    match case {
        Case::Keep => s.to_string(),
        Case::Title => title_case(s),
        Case::Upper => s.to_uppercase(),
        Case::Lower => s.to_lowercase(),
    }
}

/// Parse a currency-formatted amount such as `₹1,25,000` or `$ 40.5`.
pub fn parse_amount(raw: Option<&str>) -> Option<f64> {
    let cleaned: String = raw?
        .chars()
        .filter(|c| !matches!(c, '₹' | '$' | ',') && !c.is_whitespace())
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_flag(raw: Option<&str>) -> bool {
    raw.map(|s| s.trim().to_ascii_lowercase())
        .is_some_and(|s| matches!(s.as_str(), "true" | "1" | "yes" | "y"))
}

fn year_in_range(date: NaiveDate, as_of: NaiveDate) -> bool {
    let year = date.year();
    year >= as_of.year() - MAX_YEARS_BACK && year <= as_of.year() + MAX_YEARS_AHEAD
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    u32::try_from((next - first).num_days()).ok()
}

/// Century for a two-digit year: `yy <= last_2000s` is 20xx, otherwise 19xx.
fn expand_year(yy: u32, last_2000s: u32) -> Option<i32> {
    let century = if yy <= last_2000s { 2000 } else { 1900 };
    Some(century + i32::try_from(yy).ok()?)
}

/// Candidate readings of a two-digit-year date with `-` or `/` separators,
/// most preferred first.
///
/// `dd-mm-yy` comes first: years 00-49 are 20xx and the day is clamped to
/// the month length. Then the strict layouts `d-m-yy`, `m-d-yy` and
/// `yy-m-d`, where 00-68 are 20xx and no clamping happens.
fn two_digit_year_candidates(s: &str) -> Vec<NaiveDate> {
    let mut candidates = Vec::new();
    let Some(sep) = s.chars().find(|c| matches!(c, '-' | '/')) else {
        return candidates;
    };
    let parts: Vec<&str> = s.split(sep).collect();
    let [a, b, c] = parts.as_slice() else {
        return candidates;
    };
    let short = |p: &str| !p.is_empty() && p.len() <= 2 && p.bytes().all(|b| b.is_ascii_digit());
    if !short(a) || !short(b) || !short(c) {
        return candidates;
    }
    let (Ok(x), Ok(y), Ok(z)) = (a.parse::<u32>(), b.parse::<u32>(), c.parse::<u32>()) else {
        return candidates;
    };

    if c.len() == 2 && (1..=31).contains(&x) && (1..=12).contains(&y) {
        let clamped = expand_year(z, 49).and_then(|year| {
            let day = x.min(days_in_month(year, y)?);
            NaiveDate::from_ymd_opt(year, y, day)
        });
        candidates.extend(clamped);
    }

    let strict = |yy: u32, month: u32, day: u32| {
        expand_year(yy, 68).and_then(|year| NaiveDate::from_ymd_opt(year, month, day))
    };
    candidates.extend(strict(z, y, x));
    candidates.extend(strict(z, x, y));
    candidates.extend(strict(x, y, z));
    candidates
}

/// Parse a date in any of the accepted layouts. A trailing time part is
/// ignored. Dates whose year is implausible relative to `as_of` are rejected.
pub fn parse_date(raw: Option<&str>, as_of: NaiveDate) -> Option<NaiveDate> {
    if is_null_text(raw) {
        return None;
    }
    let s = raw?.trim();
    let s = s.split(['T', ' ']).next().unwrap_or(s);

    DATE_FORMATS
        .iter()
        .filter_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .find(|d| year_in_range(*d, as_of))
        .or_else(|| {
            two_digit_year_candidates(s)
                .into_iter()
                .find(|d| year_in_range(*d, as_of))
        })
}

/// Region from the branch's state, by substring.
pub fn region_for_state(state: &str) -> &'static str {
    const REGIONS: &[(&str, &[&str])] = &[
        ("North", &["delhi", "punjab", "haryana", "up", "uttar"]),
        ("West", &["maharashtra", "gujarat", "goa"]),
        ("South", &["karnataka", "tamil", "kerala", "andhra", "telangana"]),
        (
            "East",
            &["bengal", "bihar", "odisha", "assam", "meghalaya", "chhattisgarh", "arunachal", "manipur"],
        ),
    ];

    let state = state.to_lowercase();
    REGIONS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| state.contains(n)))
        .map_or(NA, |(region, _)| region)
}

/// Whole years between `dob` and `as_of`; 0 when outside 0..=120.
pub fn age_on(dob: NaiveDate, as_of: NaiveDate) -> i64 {
    if dob > as_of {
        return 0;
    }
    let mut years = as_of.year() - dob.year();
    if (as_of.month(), as_of.day()) < (dob.month(), dob.day()) {
        years -= 1;
    }
    if (0..=120).contains(&years) {
        i64::from(years)
    } else {
        0
    }
}

/// Days since the account was opened, never negative.
pub fn tenure_days(opened: NaiveDate, as_of: NaiveDate) -> i64 {
    (as_of - opened).num_days().max(0)
}

pub fn customer_segment(tenure_days: i64) -> &'static str {
    match tenure_days {
        d if d >= 730 => "VIP",
        d if d >= 180 => "Regular",
        d if d > 0 => "New",
        _ => NA,
    }
}

pub fn normalize_gender(raw: Option<&str>) -> &'static str {
    match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("m" | "male") => "Male",
        Some("f" | "female") => "Female",
        _ => NA,
    }
}

/// Calendar months from start to end; `None` when end precedes start.
pub fn duration_months(start: NaiveDate, end: NaiveDate) -> Option<i64> {
    if end < start {
        return None;
    }
    let months = (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32;
    Some(i64::from(months))
}

pub fn risk_category(loan_amount: f64) -> &'static str {
    if loan_amount > 500_000.0 {
        "High"
    } else if loan_amount > 100_000.0 {
        "Medium"
    } else {
        "Low"
    }
}

pub fn transaction_category(amount: f64) -> &'static str {
    if amount > 10_000.0 {
        "Large"
    } else if amount > 1_000.0 {
        "Medium"
    } else {
        "Small"
    }
}

/// Linear-interpolated quantile of sorted values.
fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = (sorted.len() - 1) as f64 * q;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64))
}

/// Fewer values than this never produce fences.
const MIN_OUTLIER_SAMPLE: usize = 4;

/// Tukey fences `(Q1 - 1.5 IQR, Q3 + 1.5 IQR)`. `None` for samples under
/// four values or with no spread between the quartiles.
pub fn iqr_fences(values: &[f64]) -> Option<(f64, f64)> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.len() < MIN_OUTLIER_SAMPLE {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let q1 = quantile(&sorted, 0.25)?;
    let q3 = quantile(&sorted, 0.75)?;
    let iqr = q3 - q1;
    if iqr == 0.0 {
        return None;
    }
    Some((q1 - 1.5 * iqr, q3 + 1.5 * iqr))
}
