use tokio::time::Duration;

/// Parses a duration string in the format "250ms", "1.5s", "10m", "5h", "3d".
///
/// Supported units:
/// - `ms` for milliseconds
/// - `s` for seconds
/// - `m` for minutes
/// - `h` for hours
/// - `d` for days
///
/// Fractional values are accepted so think times like `0.1s` can be written
/// the way they are usually specified.
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration string cannot be empty".to_string());
    }

    let (value_str, multiplier) = if let Some(v) = s.strip_suffix("ms") {
        (v, 0.001)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1.0)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60.0)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 60.0 * 60.0)
    } else if let Some(v) = s.strip_suffix('d') {
        (v, 24.0 * 60.0 * 60.0)
    } else {
        let unit = s.chars().last().unwrap_or_default();
        return Err(format!(
            "Unknown duration unit: '{}'. Use 'ms', 's', 'm', 'h', or 'd'.",
            unit
        ));
    };

    let value: f64 = match value_str.parse() {
        Ok(v) if value_str.chars().all(|c| c.is_ascii_digit() || c == '.') => v,
        _ => {
            return Err(format!(
                "Invalid numeric value in duration: '{}'",
                value_str
            ))
        }
    };

    Duration::try_from_secs_f64(value * multiplier)
        .map_err(|e| format!("Duration '{}' is out of range: {}", s, e))
}

/// Parses a comma-separated header string with support for escaped commas.
///
/// Use `\,` to include a literal comma in a header value.
/// Example: "Connection:keep-alive,Keep-Alive:timeout=5\,max=200"
pub fn parse_headers_with_escapes(headers_str: &str) -> Vec<String> {
    let mut headers = Vec::new();
    let mut current_header = String::new();
    let mut chars = headers_str.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                // Check if the next character is a comma
                if chars.peek() == Some(&',') {
                    current_header.push(',');
                    chars.next();
                } else {
                    current_header.push('\\');
                }
            }
            ',' => {
                if !current_header.trim().is_empty() {
                    headers.push(current_header.clone());
                }
                current_header.clear();
            }
            _ => {
                current_header.push(ch);
            }
        }
    }

    if !current_header.trim().is_empty() {
        headers.push(current_header);
    }

    headers
}

/// Parses a comma-separated list, trimming entries and dropping empty ones.
///
/// Used for tag filters such as `TAGS=read,user-service`.
pub fn parse_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses `key=value` pairs separated by commas.
///
/// Example: "UserServiceUser=http://localhost:8700,OrderServiceUser=http://localhost:8300"
pub fn parse_key_value_list(input: &str) -> Result<Vec<(String, String)>, String> {
    parse_list(input)
        .into_iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("Expected 'key=value', got '{}'", pair))?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                return Err(format!("Key and value must be non-empty in '{}'", pair));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        for (input, expected) in [
            ("250ms", Duration::from_millis(250)),
            ("0.1s", Duration::from_millis(100)),
            ("30s", Duration::from_secs(30)),
            ("  10m ", Duration::from_secs(600)),
            ("5h", Duration::from_secs(18_000)),
            ("3d", Duration::from_secs(259_200)),
            ("0m", Duration::ZERO),
        ] {
            assert_eq!(parse_duration_string(input).unwrap(), expected, "{}", input);
        }
    }

    #[test]
    fn test_parse_duration_errors() {
        for (input, fragment) in [
            ("   ", "empty"),
            ("10x", "Unknown duration unit"),
            ("10", "Unknown duration unit"),
            ("m", "Invalid numeric"),
            ("-5m", "Invalid numeric"),
        ] {
            let err = parse_duration_string(input).unwrap_err();
            assert!(err.contains(fragment), "{}: {}", input, err);
        }
    }

    #[test]
    fn test_parse_headers_with_escaped_comma() {
        let headers_str = "Connection:keep-alive,Keep-Alive:timeout=5\\,max=200";
        let result = parse_headers_with_escapes(headers_str);

        assert_eq!(result.len(), 2);
        assert_eq!(result[0], "Connection:keep-alive");
        assert_eq!(result[1], "Keep-Alive:timeout=5,max=200");
    }

    #[test]
    fn test_parse_headers_trailing_comma() {
        let result = parse_headers_with_escapes("Header1:value1,Header2:value2,");
        assert_eq!(result, vec!["Header1:value1", "Header2:value2"]);
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list(" read, write ,,"), vec!["read", "write"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_parse_key_value_list() {
        let pairs =
            parse_key_value_list("Users=http://localhost:8700, Orders=http://localhost:8300")
                .unwrap();
        assert_eq!(
            pairs,
            vec![
                ("Users".to_string(), "http://localhost:8700".to_string()),
                ("Orders".to_string(), "http://localhost:8300".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_key_value_list_rejects_missing_value() {
        assert!(parse_key_value_list("Users=").is_err());
        assert!(parse_key_value_list("Users").is_err());
    }
}
