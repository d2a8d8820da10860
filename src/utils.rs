use serde::Deserialize;

#[derive(Deserialize)]
struct ErrorRecord {
    #[serde(rename = "Error")]
    error: Option<String>,
}

/// Returns the `Error` field of a `-json` response, if it has one.
///
/// ExifTool reports files it cannot read (unknown type, unreadable header)
/// as a regular record with an `Error` tag instead of failing the command.
/// Anything that is not a JSON array of records is left alone.
pub(crate) fn json_record_error(payload: &[u8]) -> Option<String> {
    let first = payload.iter().find(|b| !b.is_ascii_whitespace())?;
    if *first != b'[' {
        return None;
    }
    let records: Vec<ErrorRecord> = serde_json::from_slice(payload).ok()?;
    records.into_iter().find_map(|record| record.error)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_record_error_found() {
        let payload = br#"[{"SourceFile": "a.txt", "Error": "Unknown file type"}]"#;
        assert_eq!(
            json_record_error(payload),
            Some("Unknown file type".to_string())
        );
    }

    #[test]
    fn test_json_record_error_absent() {
        assert_eq!(json_record_error(br#"[{"SourceFile": "a.jpg"}]"#), None);
        assert_eq!(json_record_error(b"FocalLength: 4.7 mm"), None);
        assert_eq!(json_record_error(b""), None);
        assert_eq!(json_record_error(b"[not json"), None);
    }
}
