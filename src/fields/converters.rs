//! Standard validators and converters shared by the cache field templates.

use chrono::NaiveDate;

use crate::core::{Result, SyncError, Value};
use crate::fields::field::{Field, FieldValue};

/// Cleans a user-entered e-mail address: comments in parentheses, whitespace and quotes
/// are removed and the domain is lower-cased. Fails when no usable address remains.
pub fn correct_email(email: &str) -> Result<String> {
    let mut cleaned = String::with_capacity(email.len());
    let mut depth = 0usize;
    for ch in email.chars() {
        match ch {
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth > 0 => {}
            c if c.is_whitespace() || c == '"' || c == '<' || c == '>' => {}
            c => cleaned.push(c),
        }
    }

    let (local, domain) = cleaned
        .rsplit_once('@')
        .ok_or_else(|| SyncError::Validation(format!("e-mail '{}' has no '@'", email)))?;
    let domain = domain.trim_matches('.').to_lowercase();
    let local = local.trim_matches('.');
    if local.is_empty() || local.contains('@') || !domain.contains('.') {
        return Err(SyncError::Validation(format!("invalid e-mail address '{}'", email)));
    }
    Ok(format!("{}@{}", local, domain))
}

/// Keeps digits and the first hyphen between digits; a leading `+` becomes `00`.
pub fn correct_phone(phone: &str) -> Result<String> {
    let trimmed = phone.trim();
    let mut out = String::with_capacity(trimmed.len() + 1);
    if trimmed.starts_with('+') {
        out.push_str("00");
    }
    let mut hyphen_used = false;
    for ch in trimmed.chars() {
        if ch.is_ascii_digit() {
            out.push(ch);
        } else if ch == '-' && !hyphen_used && out.chars().last().is_some_and(|c| c.is_ascii_digit()) {
            out.push(ch);
            hyphen_used = true;
        }
    }
    let out = out.trim_end_matches('-').to_string();
    if out.chars().filter(char::is_ascii_digit).count() < 3 {
        return Err(SyncError::Validation(format!("invalid phone number '{}'", phone)));
    }
    Ok(out)
}

/// Expands a 15 character CRM id to its case-safe 18 character form.
pub fn ensure_long_id(sf_id: &str) -> Result<String> {
    match sf_id.len() {
        18 => return Ok(sf_id.to_string()),
        15 => {}
        _ => return Err(SyncError::Validation(format!("CRM id '{}' must have 15 or 18 characters", sf_id))),
    }
    const CHAR_MAP: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ012345";
    let bytes = sf_id.as_bytes();
    let mut long_id = sf_id.to_string();
    for chunk in 0..3 {
        let mut bits = 0usize;
        for pos in 0..5 {
            if bytes[chunk * 5 + pos].is_ascii_uppercase() {
                bits |= 1 << pos;
            }
        }
        long_id.push(CHAR_MAP[bits] as char);
    }
    Ok(long_id)
}

fn map_text<F>(value: FieldValue, f: F) -> Result<FieldValue>
where
    F: Fn(&str) -> Result<Value>,
{
    match value {
        FieldValue::Scalar(Value::Text(s)) => f(&s).map(FieldValue::Scalar),
        other => Ok(other),
    }
}

pub fn email_converter(_: &Field, value: FieldValue) -> Result<FieldValue> {
    map_text(value, |s| correct_email(s).map(Value::Text))
}

pub fn phone_converter(_: &Field, value: FieldValue) -> Result<FieldValue> {
    map_text(value, |s| correct_phone(s).map(Value::Text))
}

pub fn long_id_converter(_: &Field, value: FieldValue) -> Result<FieldValue> {
    map_text(value, |s| ensure_long_id(s).map(Value::Text))
}

/// Parses text dates in `format` into date values.
pub fn date_from_text(format: &'static str) -> impl Fn(&Field, FieldValue) -> Result<FieldValue> + Send + Sync {
    move |field, value| {
        map_text(value, |s| {
            NaiveDate::parse_from_str(s.trim(), format).map(Value::Date).map_err(|e| {
                SyncError::Validation(format!("{}: bad date '{}': {}", field.name(), s, e))
            })
        })
    }
}

/// Renders date values as text in `format`.
pub fn date_to_text(format: &'static str) -> impl Fn(&Field, FieldValue) -> Result<FieldValue> + Send + Sync {
    move |_, value| match value {
        FieldValue::Scalar(v) => match v.as_date() {
            Some(d) => Ok(FieldValue::Scalar(Value::Text(d.format(format).to_string()))),
            None => Ok(FieldValue::Scalar(v)),
        },
        other => Ok(other),
    }
}

/// Parses integer text (e.g. sequence numbers of the hotel XML).
pub fn integer_from_text(field: &Field, value: FieldValue) -> Result<FieldValue> {
    map_text(value, |s| {
        s.trim()
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|e| SyncError::Validation(format!("{}: bad integer '{}': {}", field.name(), s, e)))
    })
}

pub fn non_empty(field: &Field, value: &FieldValue) -> Result<()> {
    if value.is_empty() {
        return Err(SyncError::Validation(format!("{} must not be empty", field.name())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::aspect::{SyncContext, System};

    #[test]
    fn test_correct_email() {
        assert_eq!(correct_email(" John.Doe(work)@Example.COM ").unwrap(), "John.Doe@example.com");
        assert_eq!(correct_email("\"a b\"@x.org").unwrap(), "ab@x.org");
        assert!(correct_email("no-at-sign").is_err());
        assert!(correct_email("a@localhost").is_err());
    }

    #[test]
    fn test_correct_phone() {
        assert_eq!(correct_phone("+44 (20) 7946-0958").unwrap(), "0044207946-0958");
        assert_eq!(correct_phone("555-12-34").unwrap(), "555-1234");
        assert!(correct_phone("n/a").is_err());
    }

    #[test]
    fn test_ensure_long_id() {
        assert_eq!(ensure_long_id("001W000000aBcDe").unwrap().len(), 18);
        assert_eq!(ensure_long_id("0010000000AAAAA").unwrap(), "0010000000AAAAAAA5");
        assert!(ensure_long_id("short").is_err());
    }

    #[test]
    fn test_date_converters_round_trip_through_field() {
        let mut field = Field::new("Arrival")
            .with_converter(SyncContext::from(System::Sh), date_from_text("%Y-%m-%d"))
            .with_converter(SyncContext::onto(System::Sh), date_to_text("%Y-%m-%d"));
        field.set("2024-07-01", SyncContext::system(System::Sh));
        let pulled = field.pull(System::Sh).unwrap();
        assert_eq!(pulled.as_value().and_then(Value::as_date), NaiveDate::from_ymd_opt(2024, 7, 1));
        assert_eq!(field.push(System::Sh), Some(FieldValue::from("2024-07-01")));
    }
}
