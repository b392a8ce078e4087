//! CSV codec for the persisted table.
//!
//! Header `timestamp,temp,rh`, one row per record, in series order.  Fields
//! containing a comma, double-quote, CR or LF are wrapped in double-quotes
//! with embedded quotes doubled (RFC 4180).  Floats use Rust's shortest
//! round-trip formatting, so encoding the same series twice yields the same
//! bytes.  NaN is written as an empty field, which is also how older tables
//! mark missing samples.

use fm_protocol::{COLUMNS, Record};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const HEADER: &str = "timestamp,temp,rh";

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("{action} '{}': {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("table is empty; expected header 'timestamp,temp,rh'")]
    MissingHeader,
    #[error("unexpected header '{0}'; expected 'timestamp,temp,rh'")]
    BadHeader(String),
    #[error("line {line}: {reason}")]
    Row { line: usize, reason: String },
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

pub fn encode(records: &[Record]) -> String {
    let mut out = String::with_capacity(HEADER.len() + 1 + records.len() * 32);
    out.push_str(HEADER);
    out.push('\n');
    for r in records {
        push_field(&mut out, &r.timestamp);
        out.push(',');
        push_number(&mut out, r.temp);
        out.push(',');
        push_number(&mut out, r.rh);
        out.push('\n');
    }
    out
}

fn push_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\r', '\n']) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}

fn push_number(out: &mut String, value: f64) {
    if !value.is_nan() {
        out.push_str(&value.to_string());
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

pub fn decode(text: &str) -> Result<Vec<Record>, TableError> {
    let mut rows = split_rows(text)?.into_iter();

    let (_, header) = rows.next().ok_or(TableError::MissingHeader)?;
    if header.len() != COLUMNS.len() || header.iter().zip(COLUMNS).any(|(h, c)| h.trim() != c) {
        return Err(TableError::BadHeader(header.join(",")));
    }

    let mut records = Vec::new();
    for (line, fields) in rows {
        if fields.len() != COLUMNS.len() {
            return Err(TableError::Row {
                line,
                reason: format!("expected {} fields, found {}", COLUMNS.len(), fields.len()),
            });
        }
        let mut fields = fields.into_iter();
        let timestamp = fields.next().unwrap_or_default();
        let temp = parse_number(fields.next().as_deref(), line, "temp")?;
        let rh = parse_number(fields.next().as_deref(), line, "rh")?;
        records.push(Record { timestamp, temp, rh });
    }
    Ok(records)
}

fn parse_number(field: Option<&str>, line: usize, column: &str) -> Result<f64, TableError> {
    let field = field.unwrap_or_default().trim();
    if field.is_empty() {
        return Ok(f64::NAN);
    }
    field.parse::<f64>().map_err(|e| TableError::Row {
        line,
        reason: format!("{column} value '{field}': {e}"),
    })
}

/// Split CSV text into rows of unquoted fields, tagged with the 1-based line
/// each row starts on.  Blank lines are skipped.
fn split_rows(text: &str) -> Result<Vec<(usize, Vec<String>)>, TableError> {
    let mut rows = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut row_start = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => fields.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                fields.push(std::mem::take(&mut field));
                if !(fields.len() == 1 && fields[0].is_empty()) {
                    rows.push((row_start, std::mem::take(&mut fields)));
                }
                fields.clear();
                line += 1;
                row_start = line;
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(TableError::Row {
            line: row_start,
            reason: "unterminated quoted field".to_owned(),
        });
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        rows.push((row_start, fields));
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// File I/O (callers hold the interprocess lock)
// ---------------------------------------------------------------------------

/// Read the table at `path`; `Ok(None)` if it does not exist yet.
pub fn read(path: &Path) -> Result<Option<Vec<Record>>, TableError> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(TableError::Io {
                action: "reading table",
                path: path.to_owned(),
                source,
            });
        }
    };
    decode(&text).map(Some)
}

/// Rewrite the whole table: write a sibling temp file, fsync, rename over.
pub fn write(path: &Path, records: &[Record]) -> Result<(), TableError> {
    let io_err = |action: &'static str, path: &Path| {
        let path = path.to_owned();
        move |source| TableError::Io {
            action,
            path,
            source,
        }
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err("creating table directory", parent))?;
    }

    let tmp = temp_path(path);
    let mut file = std::fs::File::create(&tmp).map_err(io_err("creating", &tmp))?;
    let result = file
        .write_all(encode(records).as_bytes())
        .map_err(io_err("writing", &tmp))
        .and_then(|()| file.sync_all().map_err(io_err("syncing", &tmp)));
    drop(file);
    let result = result.and_then(|()| std::fs::rename(&tmp, path).map_err(io_err("replacing", path)));
    if result.is_err() {
        // Best effort; the original error is the one worth reporting.
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_writes_header_and_rows() {
        let text = encode(&[Record::new("t1", -18.0, 40.0), Record::new("t2", -17.5, 41.25)]);
        assert_eq!(text, "timestamp,temp,rh\nt1,-18,40\nt2,-17.5,41.25\n");
    }

    #[test]
    fn empty_series_is_just_the_header() {
        assert_eq!(encode(&[]), "timestamp,temp,rh\n");
        assert!(decode("timestamp,temp,rh\n").unwrap().is_empty());
    }

    #[test]
    fn awkward_timestamps_are_quoted_and_restored() {
        let records = vec![
            Record::new("2026-01-01, noon", 1.0, 2.0),
            Record::new("say \"hi\"", 3.0, 4.0),
            Record::new("two\nlines", 5.0, 6.0),
        ];
        let text = encode(&records);
        assert!(text.contains("\"2026-01-01, noon\""));
        assert!(text.contains("\"say \"\"hi\"\"\""));
        assert_eq!(decode(&text).unwrap(), records);
    }

    #[test]
    fn decode_accepts_crlf_and_decimal_floats() {
        let text = "timestamp,temp,rh\r\n2026-01-01 00:00:00,-18.0,40.0\r\n";
        assert_eq!(
            decode(text).unwrap(),
            vec![Record::new("2026-01-01 00:00:00", -18.0, 40.0)]
        );
    }

    #[test]
    fn decode_accepts_missing_trailing_newline() {
        let text = "timestamp,temp,rh\nt1,1,2";
        assert_eq!(decode(text).unwrap(), vec![Record::new("t1", 1.0, 2.0)]);
    }

    #[test]
    fn empty_numeric_field_is_nan() {
        let records = decode("timestamp,temp,rh\nt1,,2\n").unwrap();
        assert!(records[0].temp.is_nan());
        assert_eq!(encode(&records), "timestamp,temp,rh\nt1,,2\n");
    }

    #[test]
    fn bad_header_is_rejected() {
        assert!(matches!(decode(""), Err(TableError::MissingHeader)));
        assert!(matches!(
            decode("time,temp,rh\n"),
            Err(TableError::BadHeader(h)) if h == "time,temp,rh"
        ));
    }

    #[test]
    fn bad_rows_report_their_line() {
        match decode("timestamp,temp,rh\nt1,1,2\nt2,warm,3\n") {
            Err(TableError::Row { line, reason }) => {
                assert_eq!(line, 3);
                assert!(reason.contains("temp"), "reason: {reason}");
            }
            other => panic!("expected row error, got {:?}", other),
        }
        assert!(matches!(
            decode("timestamp,temp,rh\nt1,1\n"),
            Err(TableError::Row { line: 2, .. })
        ));
        assert!(matches!(
            decode("timestamp,temp,rh\n\"open,1,2\n"),
            Err(TableError::Row { line: 2, .. })
        ));
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("freezer.csv");
        let records = vec![Record::new("t1", -18.0, 40.0), Record::new("t1", -18.0, 40.0)];
        write(&path, &records).unwrap();
        assert_eq!(read(&path).unwrap(), Some(records));
        assert!(!temp_path(&path).exists(), "temp file must be renamed away");
    }

    #[test]
    fn read_of_missing_table_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read(&dir.path().join("absent.csv")).unwrap(), None);
    }

    #[test]
    fn failed_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory where the table belongs makes the rename fail.
        let path = dir.path().join("freezer.csv");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();

        let err = write(&path, &[Record::new("t1", 1.0, 2.0)]).unwrap_err();
        assert!(matches!(err, TableError::Io { action: "replacing", .. }));
        assert!(!temp_path(&path).exists(), "temp file must be cleaned up");
    }
}
