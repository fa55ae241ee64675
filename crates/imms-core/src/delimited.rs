//! Pipe-delimited line codec.
//!
//! Bulk files and acknowledgment artifacts share one format: one record per line,
//! fields separated by `|`, values optionally wrapped in double quotes. A quoted
//! value may contain the delimiter; `""` inside quotes is a literal quote.

/// Field delimiter for bulk files and acknowledgments.
pub const DELIMITER: char = '|';

/// Splits one line into fields, honouring quotes.
///
/// Surrounding whitespace is trimmed from unquoted values only.
#[must_use]
pub fn split_line(line: &str) -> Vec<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut was_quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if current.trim().is_empty() => {
                current.clear();
                in_quotes = true;
                was_quoted = true;
            }
            c if c == DELIMITER && !in_quotes => {
                fields.push(finish_field(&mut current, was_quoted));
                was_quoted = false;
            }
            c => current.push(c),
        }
    }
    fields.push(finish_field(&mut current, was_quoted));
    fields
}

fn finish_field(current: &mut String, was_quoted: bool) -> String {
    let value = std::mem::take(current);
    if was_quoted {
        value
    } else {
        value.trim().to_string()
    }
}

/// Joins fields into one line, quoting values that need it.
#[must_use]
pub fn join_line<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = String::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            line.push(DELIMITER);
        }
        let value = field.as_ref();
        if value.contains(DELIMITER) || value.contains('"') || value.contains('\n') {
            line.push('"');
            line.push_str(&value.replace('"', "\"\""));
            line.push('"');
        } else {
            line.push_str(value);
        }
    }
    line
}
