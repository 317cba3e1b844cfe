//! Classification of the helper's stdout status lines.
//!
//! Each line is a self-contained JSON document. Only
//! `{"status": "running", "test_id"?, "log_file_path"?}` means anything to
//! the host; every other well-formed document is `Unrecognized`.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine {
    Running {
        test_id: Option<String>,
        log_file_path: Option<String>,
    },
    Unrecognized,
}

impl StatusLine {
    /// Parse one line. Errors only when the line is not JSON at all.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        Ok(Self::classify(&value))
    }

    fn classify(value: &Value) -> Self {
        match value.get("status").and_then(Value::as_str) {
            Some("running") => StatusLine::Running {
                test_id: non_empty_str(value.get("test_id")),
                log_file_path: non_empty_str(value.get("log_file_path")),
            },
            _ => StatusLine::Unrecognized,
        }
    }
}

// An empty id means "none given", same as a missing field.
fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_with_fields() {
        let line = r#"{"status":"running","test_id":"t1","log_file_path":"/data/t1.log"}"#;
        assert_eq!(
            StatusLine::parse(line).unwrap(),
            StatusLine::Running {
                test_id: Some("t1".into()),
                log_file_path: Some("/data/t1.log".into()),
            }
        );
    }

    #[test]
    fn test_running_without_id() {
        assert_eq!(
            StatusLine::parse(r#"{"status":"running","test_id":""}"#).unwrap(),
            StatusLine::Running {
                test_id: None,
                log_file_path: None,
            }
        );
    }

    #[test]
    fn test_other_shapes_are_unrecognized() {
        for line in [
            r#"{"status":"completed","test_id":"t1"}"#,
            r#"{"progress":0.5}"#,
            r#"{"status":1}"#,
            r#"["running"]"#,
            r#""running""#,
            "42",
        ] {
            assert_eq!(StatusLine::parse(line).unwrap(), StatusLine::Unrecognized, "{}", line);
        }
    }

    #[test]
    fn test_non_json_is_an_error() {
        assert!(StatusLine::parse("Connecting...").is_err());
        assert!(StatusLine::parse(r#"{"status":"running""#).is_err());
    }

    #[test]
    fn test_non_string_id_is_ignored() {
        assert_eq!(
            StatusLine::parse(r#"{"status":"running","test_id":7}"#).unwrap(),
            StatusLine::Running {
                test_id: None,
                log_file_path: None,
            }
        );
    }
}
