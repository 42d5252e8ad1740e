//! Tabular row normalizer for CoinSnap CSV exports.
//!
//! The export is comma-separated with quoted fields that may contain the
//! separator and `""` escapes. Column names vary between app versions, so
//! lookup is case-insensitive substring containment against the header line
//! rather than a strict schema binding.

use crate::query::catalog_number_digits;

#[derive(Debug, Clone, PartialEq)]
pub struct CoinRow {
    pub issuer: String,
    pub year: String,
    pub denomination: String,
    pub catalog_number: Option<i64>,
    pub mintmark: Option<String>,
    pub subject: Option<String>,
    pub composition: Option<String>,
    pub weight: Option<f64>,
    pub diameter: Option<f64>,
    pub thickness: Option<f64>,
}

/// Split one delimited line into trimmed fields, honoring quoted spans.
/// Inside a quoted span, `""` denotes one literal quote. Unbalanced quoting
/// degrades to treating the rest of the line as one field.
pub fn parse_delimited_line(line: &str, separator: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '"' {
            if in_quotes && chars.peek() == Some(&'"') {
                current.push('"');
                chars.next();
            } else {
                in_quotes = !in_quotes;
            }
        } else if ch == separator && !in_quotes {
            fields.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(ch);
        }
    }

    fields.push(current.trim().to_string());
    fields
}

/// Ordered, case-insensitive substring lookup over the header line. The
/// first header containing the key wins; ambiguity resolves silently in
/// header order. Swapping in stricter matching only touches this type.
#[derive(Debug, Clone)]
pub struct HeaderIndex {
    columns: Vec<String>,
}

impl HeaderIndex {
    pub fn new(header_fields: &[String]) -> Self {
        Self {
            columns: header_fields
                .iter()
                .map(|name| name.trim().to_lowercase())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn position(&self, key: &str) -> Option<usize> {
        let key = key.to_lowercase();
        self.columns.iter().position(|column| column.contains(&key))
    }
}

/// Parse a whole export: first line is the header, blank lines are skipped,
/// short rows are right-padded with empty fields.
pub fn parse_batch(content: &str) -> Vec<CoinRow> {
    let mut lines = content.lines();
    let header_line = match lines.next() {
        Some(line) => line,
        None => return Vec::new(),
    };

    let header = HeaderIndex::new(&parse_delimited_line(header_line, ','));

    let issuer_col = header.position("issuer");
    let year_col = header.position("year");
    let denomination_col = header.position("denomination");
    let catalog_col = header.position("krause");
    let mintmark_col = header.position("mintmark");
    let subject_col = header.position("subject");
    let composition_col = header.position("composition");
    let weight_col = header.position("weight");
    let diameter_col = header.position("diameter");
    let thickness_col = header.position("thickness");

    let mut rows = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }

        let mut fields = parse_delimited_line(line, ',');
        while fields.len() < header.len() {
            fields.push(String::new());
        }

        rows.push(CoinRow {
            issuer: field(&fields, issuer_col).to_string(),
            year: field(&fields, year_col).to_string(),
            denomination: field(&fields, denomination_col).to_string(),
            catalog_number: catalog_number_digits(field(&fields, catalog_col))
                .and_then(|digits| digits.parse::<i64>().ok()),
            mintmark: non_empty(field(&fields, mintmark_col)),
            subject: non_empty(field(&fields, subject_col)),
            composition: non_empty(field(&fields, composition_col)),
            weight: parse_metric(field(&fields, weight_col)),
            diameter: parse_metric(field(&fields, diameter_col)),
            thickness: parse_metric(field(&fields, thickness_col)),
        });
    }

    rows
}

fn field<'a>(fields: &'a [String], column: Option<usize>) -> &'a str {
    column
        .and_then(|index| fields.get(index))
        .map_or("", |value| value.as_str())
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Leading numeric prefix of a measurement field, e.g. "23.3 g" -> 23.3.
fn parse_metric(raw: &str) -> Option<f64> {
    let numeric: String = raw
        .trim()
        .chars()
        .take_while(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect();

    numeric.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_field_with_separator_and_escaped_quote() {
        let fields = parse_delimited_line(r#"a,"5, 10"" coin",b"#, ',');
        assert_eq!(fields, vec!["a", r#"5, 10" coin"#, "b"]);
    }

    #[test]
    fn unbalanced_quote_degrades_to_single_trailing_field() {
        let fields = parse_delimited_line(r#"a,"unterminated, span"#, ',');
        assert_eq!(fields, vec!["a", "unterminated, span"]);
    }

    #[test]
    fn fields_are_trimmed() {
        let fields = parse_delimited_line("  a , b ,  c  ", ',');
        assert_eq!(fields, vec!["a", "b", "c"]);
    }

    #[test]
    fn header_lookup_is_substring_and_case_insensitive() {
        let header = HeaderIndex::new(&[
            "Issuer".to_string(),
            "Value, USD (CoinSnap)".to_string(),
            "Krause number".to_string(),
        ]);
        assert_eq!(header.position("value"), Some(1));
        assert_eq!(header.position("krause"), Some(2));
        assert_eq!(header.position("mintmark"), None);
    }

    #[test]
    fn first_header_match_wins() {
        let header = HeaderIndex::new(&["Year of issue".to_string(), "Year".to_string()]);
        assert_eq!(header.position("year"), Some(0));
    }

    #[test]
    fn batch_skips_blank_lines_and_pads_short_rows() {
        let content = "Issuer,Year,Denomination,Krause number,Mintmark,Subject\n\
                       Russia,1900,1 kopek,KM# 9,\u{20}\n\
                       \n\
                       Italy,1927,2 lire\n";
        let rows = parse_batch(content);
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].issuer, "Russia");
        assert_eq!(rows[0].catalog_number, Some(9));
        assert_eq!(rows[0].mintmark, None);

        assert_eq!(rows[1].issuer, "Italy");
        assert_eq!(rows[1].denomination, "2 lire");
        assert_eq!(rows[1].catalog_number, None);
        assert_eq!(rows[1].subject, None);
    }

    #[test]
    fn measurements_parse_leading_numeric_prefix() {
        let content = "Issuer,Year,Denomination,Weight,Diameter,Thickness\n\
                       Russia,1900,1 kopek,3.28 g,21.6 mm,not measured\n";
        let rows = parse_batch(content);
        assert_eq!(rows[0].weight, Some(3.28));
        assert_eq!(rows[0].diameter, Some(21.6));
        assert_eq!(rows[0].thickness, None);
    }
}
