//! Minimal CSV parsing for bulk ISBN import. No dependency in this
//! workspace wraps CSV parsing, so records are split by hand, in the
//! spirit of a hand-rolled CSV writer rather than a full RFC 4180 parser.

/// Parses `text` as a CSV document with a header row, returning one JSON
/// object per data row keyed by header. Every row must have the same
/// number of fields as the header; blank lines are skipped.
pub fn parse_rows(text: &str) -> Result<Vec<serde_json::Value>, String> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header_line = lines
        .next()
        .ok_or_else(|| "csv input has no header row".to_string())?;
    let header = split_record(header_line);
    if header.is_empty() {
        return Err("csv header row is empty".to_string());
    }

    let mut rows = Vec::new();
    for (i, line) in lines.enumerate() {
        let fields = split_record(line);
        if fields.len() != header.len() {
            return Err(format!(
                "row {} has {} fields, expected {}",
                i + 2,
                fields.len(),
                header.len()
            ));
        }
        let mut object = serde_json::Map::with_capacity(header.len());
        for (key, value) in header.iter().zip(fields.into_iter()) {
            object.insert(key.clone(), serde_json::Value::String(value));
        }
        rows.push(serde_json::Value::Object(object));
    }
    Ok(rows)
}

/// Splits one CSV record into fields. Honors double-quoted fields that may
/// contain commas and `""`-escaped quotes; does not handle embedded
/// newlines inside a quoted field.
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_rows() {
        let rows = parse_rows("isbn,title\n123,Hobbit\n456,Dune").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["isbn"], "123");
        assert_eq!(rows[1]["title"], "Dune");
    }

    #[test]
    fn handles_quoted_commas() {
        let rows = parse_rows("isbn,title\n123,\"Hobbit, There and Back\"").unwrap();
        assert_eq!(rows[0]["title"], "Hobbit, There and Back");
    }

    #[test]
    fn handles_escaped_quotes() {
        let rows = parse_rows("isbn,title\n123,\"She said \"\"hi\"\"\"").unwrap();
        assert_eq!(rows[0]["title"], "She said \"hi\"");
    }

    #[test]
    fn rejects_ragged_rows() {
        let err = parse_rows("isbn,title\n123").unwrap_err();
        assert!(err.contains("row 2"));
    }

    #[test]
    fn rejects_missing_header() {
        let err = parse_rows("").unwrap_err();
        assert!(err.contains("header"));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let rows = parse_rows("isbn,title\n123,A\n\n456,B\n").unwrap();
        assert_eq!(rows.len(), 2);
    }
}
