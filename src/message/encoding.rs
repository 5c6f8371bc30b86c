use base64ct::{Base64, Encoding};

/// RFC 2045 maximum encoded line length.
const MAX_LINE: usize = 76;

/// Quoted-printable encode a body, normalizing line endings to CRLF and
/// inserting soft breaks so no encoded line exceeds 76 characters.
pub fn quoted_printable(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + input.len() / 8);

    for (i, line) in input.replace("\r\n", "\n").split('\n').enumerate() {
        if i > 0 {
            out.push_str("\r\n");
        }
        encode_qp_line(line.as_bytes(), &mut out);
    }

    out
}

fn encode_qp_line(line: &[u8], out: &mut String) {
    let mut column = 0;

    let mut push = |encoded: &str, out: &mut String, column: &mut usize| {
        // keep room for a trailing soft break
        if *column + encoded.len() > MAX_LINE - 1 {
            out.push_str("=\r\n");
            *column = 0;
        }
        out.push_str(encoded);
        *column += encoded.len();
    };

    for (i, &byte) in line.iter().enumerate() {
        let last = i + 1 == line.len();
        let literal = matches!(byte, b'\t' | b' ' | 33..=126) && byte != b'=';

        if literal && !(last && matches!(byte, b' ' | b'\t')) {
            push(&(byte as char).to_string(), out, &mut column);
        } else {
            push(&format!("={byte:02X}"), out, &mut column);
        }
    }
}

/// Base64 encode with CRLF line wrapping at 76 characters, as required for
/// attachment bodies.
pub fn base64_wrapped(input: &[u8]) -> String {
    let encoded = Base64::encode_string(input);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / MAX_LINE * 2 + 2);

    for chunk in encoded.as_bytes().chunks(MAX_LINE) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 output is ascii"));
        out.push_str("\r\n");
    }

    out
}

/// RFC 2047 encoded-word for header values that carry non-ASCII text.
/// ASCII values pass through untouched.
pub fn encode_header_value(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii() && c != '\r' && c != '\n') {
        return value.to_string();
    }

    format!("=?utf-8?B?{}?=", Base64::encode_string(value.as_bytes()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn qp_leaves_plain_ascii_alone() {
        assert_eq!(quoted_printable("Hello, world"), "Hello, world");
    }

    #[test]
    fn qp_escapes_equals_and_non_ascii() {
        assert_eq!(quoted_printable("a=b"), "a=3Db");
        assert_eq!(quoted_printable("héllo"), "h=C3=A9llo");
    }

    #[test]
    fn qp_encodes_trailing_whitespace() {
        assert_eq!(quoted_printable("word "), "word=20");
        assert_eq!(quoted_printable("word\t"), "word=09");
        // interior whitespace stays literal
        assert_eq!(quoted_printable("two words"), "two words");
    }

    #[test]
    fn qp_normalizes_line_endings() {
        assert_eq!(quoted_printable("a\nb\r\nc"), "a\r\nb\r\nc");
    }

    #[test]
    fn qp_lines_stay_within_limit() {
        let long = "x".repeat(300);
        for line in quoted_printable(&long).split("\r\n") {
            assert!(line.len() <= 76, "line too long: {}", line.len());
        }
    }

    #[test]
    fn base64_wraps_at_76() {
        let wrapped = base64_wrapped(&[0u8; 120]);
        for line in wrapped.trim_end().split("\r\n") {
            assert!(line.len() <= 76);
        }
        assert!(wrapped.ends_with("\r\n"));
    }

    #[test]
    fn header_values_only_encode_when_needed() {
        assert_eq!(encode_header_value("Plain subject"), "Plain subject");
        assert_eq!(
            encode_header_value("Héllo"),
            format!("=?utf-8?B?{}?=", Base64::encode_string("Héllo".as_bytes()))
        );
    }
}
