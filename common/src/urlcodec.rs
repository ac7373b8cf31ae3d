//! Small URL helpers shared by the host and esp32 HTTP frontends.
//!
//! The decoding rules intentionally mirror the lenient in-place decoder the
//! previous firmware generation used: `+` becomes a space, `%xx` accepts
//! upper or lower case hex, and a malformed or truncated escape degrades to
//! whatever nibbles could be read instead of failing the whole string.

/// Percent-decode a query string fragment.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                i += 1;
                let mut value: u8 = 0;
                if let Some(hi) = bytes.get(i).copied().and_then(hex_nibble) {
                    value = hi;
                    i += 1;
                }
                value <<= 4;
                if let Some(lo) = bytes.get(i).copied().and_then(hex_nibble) {
                    value |= lo;
                    i += 1;
                }
                out.push(value);
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(10 + byte - b'A'),
        b'a'..=b'f' => Some(10 + byte - b'a'),
        _ => None,
    }
}

/// Split a query string into name/value pairs.
///
/// A parameter without `=` yields an empty value. Decoding applies to both
/// names and values when requested.
pub fn parse_query(query: &str, decode: bool) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = match pair.split_once('=') {
                Some((name, value)) => (name, value),
                None => (pair, ""),
            };
            if decode {
                (percent_decode(name), percent_decode(value))
            } else {
                (name.to_string(), value.to_string())
            }
        })
        .collect()
}

/// Value of the named parameter, falling back to the first pair when the
/// name is absent. Extra unrelated parameters never shadow the named one.
pub fn arg_or_first<'a>(args: &'a [(String, String)], name: &str) -> Option<&'a str> {
    args.iter()
        .find(|(n, _)| n == name)
        .or_else(|| args.first())
        .map(|(_, value)| value.as_str())
}

/// Content type for a served file, by extension.
pub fn content_type_for(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".htm") || lower.ends_with(".html") {
        "text/html"
    } else if lower.ends_with(".css") {
        "text/css"
    } else if lower.ends_with(".js") {
        "application/javascript"
    } else if lower.ends_with(".json") {
        "application/json"
    } else if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".jpg") {
        "image/jpeg"
    } else if lower.ends_with(".ico") {
        "image/x-icon"
    } else if lower.ends_with(".xml") {
        "text/xml"
    } else if lower.ends_with(".pdf") {
        "application/x-pdf"
    } else if lower.ends_with(".zip") {
        "application/x-zip"
    } else if lower.ends_with(".gz") {
        "application/x-gzip"
    } else {
        "text/plain"
    }
}

/// Human readable size, B through GB.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes}B")
    } else if bytes < 1024 * 1024 {
        format!("{:.2}KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.2}MB", bytes as f64 / 1024.0 / 1024.0)
    } else {
        format!("{:.2}GB", bytes as f64 / 1024.0 / 1024.0 / 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_plus_and_percent_escapes() {
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("caf%C3%A9"), "café");
        assert_eq!(percent_decode("%2Fpath%2fmore"), "/path/more");
    }

    #[test]
    fn malformed_escapes_degrade_instead_of_failing() {
        // Truncated escape at end of input.
        assert_eq!(percent_decode("abc%4"), "abc@");
        // Non-hex after percent reads as zero nibbles.
        assert_eq!(percent_decode("%zz"), "\0zz");
    }

    #[test]
    fn splits_query_pairs() {
        let pairs = parse_query("ssid=My+Net&pass=p%26q&flag", true);
        assert_eq!(
            pairs,
            vec![
                ("ssid".to_string(), "My Net".to_string()),
                ("pass".to_string(), "p&q".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn named_arg_wins_over_earlier_pairs() {
        let args = parse_query("a=1&b=2&path=/file.txt", true);
        assert_eq!(arg_or_first(&args, "path"), Some("/file.txt"));

        // Legacy clients send the path under an arbitrary name.
        let args = parse_query("file=/other.txt", true);
        assert_eq!(arg_or_first(&args, "path"), Some("/other.txt"));
        assert_eq!(arg_or_first(&[], "path"), None);
    }

    #[test]
    fn maps_extensions_to_content_types() {
        assert_eq!(content_type_for("/index.htm"), "text/html");
        assert_eq!(content_type_for("/app.js"), "application/javascript");
        assert_eq!(content_type_for("/favicon.ico"), "image/x-icon");
        assert_eq!(content_type_for("/data.bin"), "text/plain");
    }

    #[test]
    fn formats_byte_sizes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00MB");
    }
}
