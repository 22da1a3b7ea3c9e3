//! Charset rules for everything that travels inside a frame.
//!
//! Queue names and message types are identifiers made of ASCII letters,
//! digits, `_` and `-`, non-empty and not starting with `-`. Payload data is
//! printable ASCII (`0x20..=0x7E`), possibly empty. Newline is the frame
//! delimiter, so it can never appear in any field.

use crate::error::BusError;

fn is_identifier_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'-'
}

fn is_valid_identifier(value: &str) -> bool {
    let bytes = value.as_bytes();
    match bytes.first() {
        None | Some(b'-') => false,
        Some(_) => bytes.iter().all(|&c| is_identifier_char(c)),
    }
}

/// Returns true if `data` may be carried in the data field of a frame.
pub fn is_valid_data(data: &str) -> bool {
    data.bytes().all(|c| (0x20..=0x7e).contains(&c))
}

/// Checks that `queue` is a usable queue name.
///
/// # Example
///
/// ```
/// use event_bus::validation::validate_queue_name;
///
/// assert!(validate_queue_name("buildplate_launch").is_ok());
/// assert!(validate_queue_name("two words").is_err());
/// ```
pub fn validate_queue_name(queue: &str) -> Result<(), BusError> {
    if is_valid_identifier(queue) {
        Ok(())
    } else {
        Err(BusError::Validation(format!("invalid queue name {queue:?}")))
    }
}

/// Checks that `message_type` is a usable message type. Same rules as queue
/// names.
pub fn validate_message_type(message_type: &str) -> Result<(), BusError> {
    if is_valid_identifier(message_type) {
        Ok(())
    } else {
        Err(BusError::Validation(format!(
            "invalid message type {message_type:?}"
        )))
    }
}

/// Checks that `data` fits in a frame's data field.
pub fn validate_data(data: &str) -> Result<(), BusError> {
    if is_valid_data(data) {
        Ok(())
    } else {
        Err(BusError::Validation(
            "data must be printable ASCII without control characters".to_string(),
        ))
    }
}

/// Validates a full `(queue, type, data)` triple.
pub fn validate_message(queue: &str, message_type: &str, data: &str) -> Result<(), BusError> {
    validate_queue_name(queue)?;
    validate_message_type(message_type)?;
    validate_data(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers() {
        assert!(validate_queue_name("tappables").is_ok());
        assert!(validate_queue_name("buildplate_launch-2").is_ok());
        assert!(validate_queue_name("_private").is_ok());
        assert!(validate_queue_name("9lives").is_ok());

        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("-leading").is_err());
        assert!(validate_queue_name("has space").is_err());
        assert!(validate_queue_name("colon:inside").is_err());
        assert!(validate_queue_name("new\nline").is_err());
        assert!(validate_message_type("caf\u{e9}").is_err());
    }

    #[test]
    fn test_data_charset() {
        assert!(validate_data("").is_ok());
        assert!(validate_data("{\"x\": 1, \"y\": \"a:b\"}").is_ok());
        assert!(validate_data("~ everything printable !").is_ok());

        assert!(validate_data("line\nbreak").is_err());
        assert!(validate_data("tab\there").is_err());
        assert!(validate_data("\u{7f}").is_err());
        assert!(validate_data("snow \u{2603}").is_err());
    }

    #[test]
    fn test_validate_message_reports_first_bad_field() {
        let err = validate_message("q", "bad type", "d").unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("message type"));
    }
}
