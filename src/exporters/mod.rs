//! Exports: structured TEI-style XML, alignment CSV/TSV dumps, and run
//! reports (JSONL or HTML).
//!
//! All outputs are UTF-8 and written to caller-supplied local paths
//! (parent directories are created). Escaping is complete: XML exports
//! filter XML-1.0-invalid codepoints, HTML reports escape every dynamic
//! value.

pub mod align_csv;
pub mod run_report;
pub mod tei;

/// Escape a string for XML text or attribute content.
pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Drop codepoints that are not valid in XML 1.0 documents (control bytes
/// other than TAB/LF/CR, and the non-characters U+FFFE / U+FFFF).
pub fn xml_filter_invalid(text: &str) -> String {
    text.chars()
        .filter(|&c| {
            let v = c as u32;
            matches!(v, 0x09 | 0x0A | 0x0D)
                || (0x20..=0xD7FF).contains(&v)
                || (0xE000..=0xFFFD).contains(&v)
                || v >= 0x10000
        })
        .collect()
}

/// Escape a string for HTML text content.
pub fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

/// Quote one CSV/TSV field: fields containing the delimiter, a quote, or a
/// newline are wrapped in double quotes with embedded quotes doubled.
pub fn csv_field(value: &str, delimiter: char) -> String {
    if value.contains(delimiter) || value.contains('"') || value.contains('\n') || value.contains('\r')
    {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_escaping_complete() {
        assert_eq!(xml_escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
    }

    #[test]
    fn xml_invalid_codepoints_filtered() {
        assert_eq!(xml_filter_invalid("a\u{0000}b\u{0007}c\td"), "abc\td");
        assert_eq!(xml_filter_invalid("ok\u{FFFD}"), "ok\u{FFFD}");
    }

    #[test]
    fn html_escaping_blocks_injection() {
        assert_eq!(
            html_escape("<script>alert('x')</script>"),
            "&lt;script&gt;alert(&#x27;x&#x27;)&lt;/script&gt;"
        );
    }

    #[test]
    fn csv_fields_quoted_when_needed() {
        assert_eq!(csv_field("plain", ','), "plain");
        assert_eq!(csv_field("a,b", ','), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\"", ','), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("a\tb", '\t'), "\"a\tb\"");
        assert_eq!(csv_field("a,b", '\t'), "a,b");
    }
}
