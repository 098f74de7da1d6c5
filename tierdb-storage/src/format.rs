//! Key and value format strings: a sequence of optional counts and type
//! characters, e.g. `S`, `10sQ`, `r`.

use tierdb_core::error::{Error, Result};

const FORMAT_TYPES: &str = "xbBhHiIlLqQrsStu";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatField {
    pub count: Option<u32>,
    pub kind: char,
}

impl FormatField {
    fn render(&self, out: &mut String) {
        if let Some(n) = self.count {
            out.push_str(&n.to_string());
        }
        out.push(self.kind);
    }
}

/// Split a format into fields, rejecting unknown type characters.
pub fn parse_format(format: &str) -> Result<Vec<FormatField>> {
    let mut fields = Vec::new();
    let mut count: Option<u32> = None;
    for c in format.chars() {
        if let Some(d) = c.to_digit(10) {
            let n = count.unwrap_or(0).checked_mul(10).and_then(|n| n.checked_add(d));
            count = Some(n.ok_or_else(|| Error::invalid(format!("format count overflow in '{}'", format)))?);
            continue;
        }
        if !FORMAT_TYPES.contains(c) {
            return Err(Error::invalid(format!("invalid type '{}' found in format '{}'", c, format)));
        }
        fields.push(FormatField { count, kind: c });
        count = None;
    }
    if count.is_some() {
        return Err(Error::invalid(format!("format '{}' ends with a count", format)));
    }
    Ok(fields)
}

/// Validate a format string.
pub fn check_format(format: &str) -> Result<()> {
    parse_format(format).map(|_| ())
}

/// Number of columns a format describes; `x` padding is not a column.
pub fn column_count(format: &str) -> Result<usize> {
    Ok(parse_format(format)?.iter().filter(|f| f.kind != 'x').count())
}

/// One format field per column, in column order.
pub fn column_fields(format: &str) -> Result<Vec<String>> {
    Ok(parse_format(format)?
        .into_iter()
        .filter(|f| f.kind != 'x')
        .map(|f| {
            let mut s = String::new();
            f.render(&mut s);
            s
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counts_and_types() {
        let fields = parse_format("10sQr").unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0], FormatField { count: Some(10), kind: 's' });
        assert_eq!(column_fields("10sQ").unwrap(), vec!["10s", "Q"]);
        assert_eq!(column_count("SxS").unwrap(), 2);
        assert!(parse_format("").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_formats() {
        assert!(check_format("Z").is_err());
        assert!(check_format("S5").is_err());
    }
}
