//! Field normalizers shared by both collection schemas.
//!
//! Every function here is pure and total: absent, null, or mistyped inputs
//! degrade to the field's zero value instead of erroring, because the two
//! backend endpoints return inconsistently typed fields (`Estado` arrives as
//! a boolean, a 0/1 number, or "Activo"/"Inactivo" text depending on the
//! route).

use serde_json::Value;

/// Trim, collapse internal whitespace, and capitalize each token: first
/// letter upper-cased, the remainder lower-cased.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .map(|token| {
            let mut chars = token.chars();
            match chars.next() {
                Some(first) => {
                    let rest: String = chars.flat_map(char::to_lowercase).collect();
                    first.to_uppercase().chain(rest.chars()).collect::<String>()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip every non-digit character, preserving digit order and count.
pub fn normalize_document_id(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Trim and lower-case an email address.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Parse a status value in any of the wire representations.
///
/// Recognized forms: booleans, 0/1 numbers, and the exact strings
/// "Activo" / "Inactivo" / "true" / "false" / "1" / "0". String matching is
/// case-sensitive on purpose; "activo" is unrecognized and falls to the
/// schema default.
pub fn parse_status(raw: &Value) -> Option<bool> {
    if let Some(flag) = raw.as_bool() {
        return Some(flag);
    }
    if let Some(n) = raw.as_i64() {
        return match n {
            1 => Some(true),
            0 => Some(false),
            _ => None,
        };
    }
    if let Some(f) = raw.as_f64() {
        if f == 1.0 {
            return Some(true);
        }
        if f == 0.0 {
            return Some(false);
        }
        return None;
    }
    match raw.as_str() {
        Some("Activo") | Some("true") | Some("1") => Some(true),
        Some("Inactivo") | Some("false") | Some("0") => Some(false),
        _ => None,
    }
}

/// Customer-schema status coercion: unrecognized input degrades to inactive.
pub fn customer_status_or_default(raw: &Value) -> bool {
    parse_status(raw).unwrap_or(false)
}

/// User-schema status coercion: unrecognized input degrades to ACTIVE.
///
/// This default is the opposite of [`customer_status_or_default`] and is
/// inherited from the legacy admin backend; the two are kept distinct on
/// purpose rather than unified.
pub fn user_status_or_default(raw: &Value) -> bool {
    parse_status(raw).unwrap_or(true)
}

/// Render a status flag in the Customer schema's numeric form.
pub fn status_as_number(active: bool) -> i64 {
    if active {
        1
    } else {
        0
    }
}

/// Render a status flag in the Customer schema's textual form.
pub fn status_as_text(active: bool) -> &'static str {
    if active {
        "Activo"
    } else {
        "Inactivo"
    }
}

// ===========================================================================
// Tests
// ===========================================================================
