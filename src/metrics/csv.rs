//! Minimal CSV field handling for the metrics log.
//!
//! Rows are always single-line: line breaks inside fields are replaced with
//! spaces on write, so the log can be read back line by line.

/// Quote a field if it contains a delimiter or quote.
pub fn escape_field(raw: &str) -> String {
    let flat: String = raw
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    if flat.contains([',', '"']) {
        format!("\"{}\"", flat.replace('"', "\"\""))
    } else {
        flat
    }
}

/// Join fields into one CSV row (no trailing newline).
pub fn join_row<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    fields
        .into_iter()
        .map(|f| escape_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Split one CSV row into fields. Returns `None` on an unterminated quote.
pub fn split_row(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            ('"', false) if current.is_empty() => in_quotes = true,
            (',', false) => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }

    if in_quotes {
        return None;
    }
    fields.push(current);
    Some(fields)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_fields_untouched() {
        assert_eq!(join_row(["a", "b", "c"]), "a,b,c");
        assert_eq!(split_row("a,b,c").unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_quoting_commas_and_quotes() {
        let row = join_row(["lead, qualify", "say \"hi\"", "x"]);
        assert_eq!(row, "\"lead, qualify\",\"say \"\"hi\"\"\",x");
        assert_eq!(
            split_row(&row).unwrap(),
            vec!["lead, qualify", "say \"hi\"", "x"]
        );
    }

    #[test]
    fn test_newlines_are_flattened() {
        assert_eq!(escape_field("two\nlines\r"), "two lines ");
    }

    #[test]
    fn test_empty_fields() {
        assert_eq!(split_row(",,").unwrap(), vec!["", "", ""]);
        assert_eq!(split_row("").unwrap(), vec![""]);
    }

    #[test]
    fn test_unterminated_quote() {
        assert!(split_row("\"open,field").is_none());
    }
}
