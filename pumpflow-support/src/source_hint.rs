use std::path::Path;

use chrono::Utc;

/// Builds the provenance token stamped on every ingested row.
///
/// When `enhanced` is true the token is `data/<rel>|batch=<run_id>|ver=2`,
/// where `<rel>` is `csv_path` relativized against `base_dir` with POSIX
/// separators; if relativization fails the bare file name is used instead.
/// When `enhanced` is false the token degrades to the bare file name.
pub fn make_source_hint(
    enhanced: bool,
    base_dir: &Path,
    csv_path: &Path,
    run_id: Option<&str>,
) -> String {
    let Some(file_name) = csv_path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return String::new();
    };

    if !enhanced {
        return file_name;
    }

    let rel = match csv_path.strip_prefix(base_dir) {
        Ok(rel) => posix_string(rel),
        Err(_) => file_name,
    };

    let run_id = run_id
        .map(|s| s.to_owned())
        .unwrap_or_else(|| Utc::now().format("%Y%m%dT%H%M%SZ").to_string());

    format!("data/{rel}|batch={run_id}|ver=2")
}

fn posix_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Parses `batch=` and the originating relative path back out of a v2
/// source_hint token, used by the data-quality reporter's `batch`/`source`
/// groupings.
pub fn parse_source_hint(hint: &str) -> (Option<&str>, Option<&str>) {
    let source = hint.strip_prefix("data/").and_then(|rest| rest.split('|').next());
    let batch = hint
        .split('|')
        .find_map(|part| part.strip_prefix("batch="));
    (source, batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn enhanced_relativizes_with_posix_separators() {
        let base = PathBuf::from("/data/root");
        let csv = PathBuf::from("/data/root/station1/2024-01.csv");
        let hint = make_source_hint(true, &base, &csv, Some("run123"));
        assert_eq!(hint, "data/station1/2024-01.csv|batch=run123|ver=2");
    }

    #[test]
    fn falls_back_to_file_name_when_not_relative() {
        let base = PathBuf::from("/data/root");
        let csv = PathBuf::from("/other/tree/file.csv");
        let hint = make_source_hint(true, &base, &csv, Some("run123"));
        assert_eq!(hint, "data/file.csv|batch=run123|ver=2");
    }

    #[test]
    fn disabled_enhancement_returns_bare_file_name() {
        let base = PathBuf::from("/data/root");
        let csv = PathBuf::from("/data/root/a.csv");
        let hint = make_source_hint(false, &base, &csv, Some("run123"));
        assert_eq!(hint, "a.csv");
    }

    #[test]
    fn parse_round_trips_batch_and_source() {
        let hint = "data/station1/2024-01.csv|batch=run123|ver=2";
        let (source, batch) = parse_source_hint(hint);
        assert_eq!(source, Some("station1/2024-01.csv"));
        assert_eq!(batch, Some("run123"));
    }
}
