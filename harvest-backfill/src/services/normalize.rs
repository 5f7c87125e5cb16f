//! Raw listing row normalization
//!
//! Listing rows arrive in several shapes: a bare id, a full report URL with
//! id and key in the query, or a relative link. Dates come from the listing's
//! date header (`date_context_text`) or are embedded in the link text.

use chrono::NaiveDate;
use reqwest::Url;
use thiserror::Error;

use super::portal_client::RawDescriptor;
use crate::models::{dates_disagree, DateSource, DescriptorUpsert};

const ID_PARAMS: [&str; 4] = ["report_id", "reportId", "report", "id"];
const KEY_PARAMS: [&str; 4] = ["key", "access_key", "accessKey", "code"];

/// Formats tried on a single token
const SINGLE_TOKEN_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%d.%m.%Y"];

/// Formats tried on three consecutive tokens joined by spaces
const THREE_TOKEN_FORMATS: [&str; 4] = ["%B %d %Y", "%b %d %Y", "%d %B %Y", "%d %b %Y"];

const LINK_BASE: &str = "https://portal.invalid/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("row has no report id")]
    MissingReportId,

    #[error("report {0} has no access key")]
    MissingAccessKey(String),
}

/// Turn a raw listing row into an upsert
pub fn normalize(raw: &RawDescriptor) -> Result<DescriptorUpsert, NormalizeError> {
    let (report_id, link_key) = parse_id_and_key(&raw.raw_id_or_url);
    let report_id = report_id.ok_or(NormalizeError::MissingReportId)?;

    let access_key = raw
        .access_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .or(link_key)
        .ok_or_else(|| NormalizeError::MissingAccessKey(report_id.clone()))?;

    let display_name = raw
        .display_text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let header_date = raw.date_context_text.as_deref().and_then(parse_date_text);
    let link_date = display_name.as_deref().and_then(parse_date_text);

    let (session_date, date_source, date_flagged) = match (header_date, link_date) {
        (Some(header), Some(link)) => (Some(header), DateSource::Listing, dates_disagree(header, link)),
        (Some(date), None) | (None, Some(date)) => (Some(date), DateSource::Listing, false),
        (None, None) => (None, DateSource::None, false),
    };

    let tags = raw
        .tags
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    Ok(DescriptorUpsert {
        report_id,
        access_key,
        display_name,
        session_date,
        date_source,
        date_flagged,
        tags,
    })
}

/// Extract `(report_id, access_key)` from a bare id or a wrapped link
pub fn parse_id_and_key(raw: &str) -> (Option<String>, Option<String>) {
    let raw = raw.trim();
    if raw.is_empty() {
        return (None, None);
    }

    if !raw.contains(&['/', '?', '#', '='][..]) {
        return (Some(raw.to_string()), None);
    }

    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(_) => match Url::parse(LINK_BASE).and_then(|base| base.join(raw)) {
            Ok(url) => url,
            Err(_) => return (None, None),
        },
    };

    let query_value = |names: &[&str]| {
        names.iter().find_map(|name| {
            url.query_pairs()
                .find(|(k, v)| &**k == *name && !v.trim().is_empty())
                .map(|(_, v)| v.trim().to_string())
        })
    };

    let report_id = query_value(&ID_PARAMS).or_else(|| {
        url.path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string)
    });
    let access_key = query_value(&KEY_PARAMS);

    (report_id, access_key)
}

/// First date found in free text
pub fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let tokens: Vec<String> = text
        .split_whitespace()
        .map(clean_token)
        .filter(|t| !t.is_empty())
        .collect();

    for start in 0..tokens.len() {
        if start + 3 <= tokens.len() {
            let window = tokens[start..start + 3].join(" ");
            for format in THREE_TOKEN_FORMATS {
                if let Ok(date) = NaiveDate::parse_from_str(&window, format) {
                    return Some(date);
                }
            }
        }

        if let Some(date) = parse_single_token(&tokens[start]) {
            return Some(date);
        }
    }
    None
}

fn parse_single_token(token: &str) -> Option<NaiveDate> {
    for format in SINGLE_TOKEN_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(token, format) {
            return Some(date);
        }
    }

    // ISO timestamps: take the date part
    let prefix = token.get(..10)?;
    if token.len() > 10 {
        return NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok();
    }
    None
}

/// Strip surrounding punctuation and ordinal suffixes ("2nd," -> "2")
fn clean_token(token: &str) -> String {
    let token = token
        .trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '(' | ')' | '[' | ']' | '"' | '\''))
        .trim_end_matches('.');

    let lower = token.to_ascii_lowercase();
    for suffix in ["st", "nd", "rd", "th"] {
        if let Some(digits) = lower.strip_suffix(suffix) {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return digits.to_string();
            }
        }
    }
    token.to_string()
}
