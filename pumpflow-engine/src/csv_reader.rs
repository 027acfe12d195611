use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use miette::Diagnostic;
use pumpflow_support::config::CsvSettings;
use pumpflow_support::types::{CsvRow, RejectRow, ValidRow};
use thiserror::Error;

const REQUIRED_COLS: [&str; 3] = ["tagname", "datatime", "datavalue"];

#[derive(Debug, Error, Diagnostic)]
pub enum OpenError {
    #[error("failed to open CSV file")]
    Io(#[source] std::io::Error),

    #[error(transparent)]
    Header(#[from] HeaderError),
}

/// Missing header columns fail reader construction outright — this is
/// never represented as a `RejectRow`, since there's no row to reject yet.
#[derive(Debug, Error, Diagnostic)]
#[error("CSV header missing required column(s): {missing:?}")]
pub struct HeaderError {
    pub missing: Vec<String>,
}

fn normalize(name: &str) -> String {
    name.trim_start_matches('\u{feff}').trim().to_lowercase()
}

/// Mirrors the merge executor's `to_timestamp(rtrim(replace(split_part(...,
/// '.', 1), 'T', ' '), 'Z'), 'YYYY-MM-DD HH24:MI:SS')` transform, so a row
/// that can't survive this here would only fail later as a whole-segment
/// SQL error instead of a per-row reject.
fn parseable_data_time(raw: &str) -> bool {
    let head = raw.split('.').next().unwrap_or(raw);
    let spaced = head.replace('T', " ");
    let trimmed = spaced.trim_end_matches('Z');
    chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S").is_ok()
}

fn parseable_data_value(raw: &str) -> bool {
    raw.parse::<f64>().is_ok()
}

/// Validates that the normalized header set contains `tagname`/`datatime`/
/// `datavalue`, tolerant of case, a leading BOM, and surrounding whitespace.
pub fn validate_header(header: &csv::StringRecord) -> Result<(usize, usize, usize), HeaderError> {
    let normalized: Vec<String> = header.iter().map(normalize).collect();

    let find = |want: &str| normalized.iter().position(|h| h == want);
    let tag_idx = find("tagname");
    let time_idx = find("datatime");
    let value_idx = find("datavalue");

    let missing: Vec<String> = REQUIRED_COLS
        .iter()
        .zip([tag_idx, time_idx, value_idx])
        .filter(|(_, idx)| idx.is_none())
        .map(|(name, _)| name.to_string())
        .collect();

    if !missing.is_empty() {
        return Err(HeaderError { missing });
    }

    Ok((tag_idx.unwrap(), time_idx.unwrap(), value_idx.unwrap()))
}

/// Strips a leading UTF-8 BOM from the underlying byte stream, matching
/// Python's `utf-8-sig` decoding when `allow_bom` is set.
struct BomStripped<R> {
    inner: R,
    checked: bool,
}

impl<R: Read> Read for BomStripped<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.checked {
            self.checked = true;
            let mut probe = [0u8; 3];
            let mut filled = 0;
            while filled < 3 {
                match self.inner.read(&mut probe[filled..])? {
                    0 => break,
                    n => filled += n,
                }
            }
            if filled == 3 && probe == [0xEF, 0xBB, 0xBF] {
                return self.inner.read(buf);
            }
            let take = filled.min(buf.len());
            buf[..take].copy_from_slice(&probe[..take]);
            if take < filled {
                // buf was smaller than the probe; extremely unlikely for any
                // real caller, but handled rather than silently dropping bytes.
                return Ok(take);
            }
            let extra = self.inner.read(&mut buf[take..])?;
            return Ok(take + extra);
        }
        self.inner.read(buf)
    }
}

/// Lazily reads CSV rows into `ValidRow`/`RejectRow`, per [`CsvRow`].
/// `station_name`/`device_name`/`metric_key` are NOT filled here — the
/// caller (the COPY loader) supplies them, since one file maps to exactly
/// one `(station, device, metric)` triple known only from the mapping file.
pub struct CsvReader {
    inner: csv::Reader<Box<dyn Read>>,
    tag_idx: usize,
    time_idx: usize,
    value_idx: usize,
    source_hint: String,
}

impl CsvReader {
    pub fn open(path: &Path, source_hint: String, settings: &CsvSettings) -> Result<Self, OpenError> {
        let file = File::open(path).map_err(OpenError::Io)?;
        let buffered = BufReader::new(file);
        let boxed: Box<dyn Read> = if settings.allow_bom {
            Box::new(BomStripped { inner: buffered, checked: false })
        } else {
            Box::new(buffered)
        };

        let mut inner = csv::ReaderBuilder::new()
            .delimiter(settings.delimiter as u8)
            .quote(settings.quote_char as u8)
            .has_headers(true)
            .flexible(true)
            .from_reader(boxed);

        let header = inner.headers().map_err(|e| OpenError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?.clone();
        let (tag_idx, time_idx, value_idx) = validate_header(&header)?;

        Ok(Self { inner, tag_idx, time_idx, value_idx, source_hint })
    }

    pub fn rows(&mut self) -> impl Iterator<Item = CsvRow> + '_ {
        let source_hint = self.source_hint.clone();
        let tag_idx = self.tag_idx;
        let time_idx = self.time_idx;
        let value_idx = self.value_idx;

        self.inner.records().map(move |record| match record {
            Ok(record) => {
                let tag_name = record.get(tag_idx).unwrap_or_default().trim().to_string();
                let data_time = record.get(time_idx).unwrap_or_default().trim().to_string();
                let data_value = record.get(value_idx).unwrap_or_default().trim().to_string();

                if !parseable_data_time(&data_time) {
                    return CsvRow::Reject(RejectRow {
                        station_name: None,
                        device_name: None,
                        metric_key: None,
                        raw_tag_name: Some(tag_name),
                        raw_data_time: Some(data_time.clone()),
                        raw_data_value: Some(data_value),
                        reason: format!("unparseable data_time: {data_time:?}"),
                        source_hint: source_hint.clone(),
                    });
                }
                if !parseable_data_value(&data_value) {
                    return CsvRow::Reject(RejectRow {
                        station_name: None,
                        device_name: None,
                        metric_key: None,
                        raw_tag_name: Some(tag_name),
                        raw_data_time: Some(data_time),
                        raw_data_value: Some(data_value.clone()),
                        reason: format!("unparseable data_value: {data_value:?}"),
                        source_hint: source_hint.clone(),
                    });
                }

                CsvRow::Valid(ValidRow { tag_name, data_time, data_value, source_hint: source_hint.clone() })
            }
            Err(err) => CsvRow::Reject(RejectRow {
                station_name: None,
                device_name: None,
                metric_key: None,
                raw_tag_name: None,
                raw_data_time: None,
                raw_data_value: None,
                reason: err.to_string(),
                source_hint: source_hint.clone(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn settings() -> CsvSettings {
        CsvSettings::default()
    }

    #[test]
    fn reads_valid_rows_with_exact_header_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m1.csv");
        std::fs::write(&path, "TagName,DataTime,DataValue\nT,2025-02-28T10:00:00,1.0\n").unwrap();

        let mut reader = CsvReader::open(&path, "hint".into(), &settings()).unwrap();
        let rows: Vec<CsvRow> = reader.rows().collect();
        assert_eq!(rows.len(), 1);
        match &rows[0] {
            CsvRow::Valid(v) => {
                assert_eq!(v.tag_name, "T");
                assert_eq!(v.data_time, "2025-02-28T10:00:00");
                assert_eq!(v.data_value, "1.0");
            }
            CsvRow::Reject(_) => panic!("expected a valid row"),
        }
    }

    #[test]
    fn header_matching_is_case_bom_and_whitespace_tolerant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m2.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&[0xEF, 0xBB, 0xBF]).unwrap();
        file.write_all(b" tagname , DataTime,datavalue \nT,2025-02-28 10:00:00,2.0\n").unwrap();
        drop(file);

        let mut reader = CsvReader::open(&path, "hint".into(), &settings()).unwrap();
        let rows: Vec<CsvRow> = reader.rows().collect();
        assert_eq!(rows.len(), 1);
        assert!(matches!(rows[0], CsvRow::Valid(_)));
    }

    #[test]
    fn rejects_rows_with_unparseable_data_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m4.csv");
        std::fs::write(&path, "TagName,DataTime,DataValue\nT,not-a-time,1.0\n").unwrap();

        let mut reader = CsvReader::open(&path, "hint".into(), &settings()).unwrap();
        let rows: Vec<CsvRow> = reader.rows().collect();
        assert_eq!(rows.len(), 1);
        match &rows[0] {
            CsvRow::Reject(r) => {
                assert_eq!(r.raw_tag_name.as_deref(), Some("T"));
                assert_eq!(r.raw_data_time.as_deref(), Some("not-a-time"));
                assert!(r.reason.contains("data_time"));
            }
            CsvRow::Valid(_) => panic!("expected a reject"),
        }
    }

    #[test]
    fn rejects_rows_with_unparseable_data_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m5.csv");
        std::fs::write(&path, "TagName,DataTime,DataValue\nT,2025-02-28T10:00:00,not-a-number\n").unwrap();

        let mut reader = CsvReader::open(&path, "hint".into(), &settings()).unwrap();
        let rows: Vec<CsvRow> = reader.rows().collect();
        assert_eq!(rows.len(), 1);
        match &rows[0] {
            CsvRow::Reject(r) => assert!(r.reason.contains("data_value")),
            CsvRow::Valid(_) => panic!("expected a reject"),
        }
    }

    #[test]
    fn missing_required_column_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m3.csv");
        std::fs::write(&path, "TagName,DataValue\nT,1.0\n").unwrap();

        let err = CsvReader::open(&path, "hint".into(), &settings()).unwrap_err();
        match err {
            OpenError::Header(h) => assert_eq!(h.missing, vec!["datatime".to_string()]),
            OpenError::Io(_) => panic!("expected a header error"),
        }
    }
}
