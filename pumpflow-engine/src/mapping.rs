use std::collections::BTreeMap;
use std::path::Path;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MappingMetric {
    pub key: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MappingDevice {
    pub name: String,
    #[serde(rename = "type", default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub pump_type: Option<String>,
    pub metrics: Vec<MappingMetric>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MappingStation {
    pub name: String,
    pub devices: Vec<MappingDevice>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MappingFile {
    pub stations: Vec<MappingStation>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum MappingError {
    #[error("failed to read mapping file at {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse mapping file at {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn load_mapping(path: &Path) -> Result<MappingFile, MappingError> {
    let contents = std::fs::read_to_string(path).map_err(|source| MappingError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| MappingError::Parse { path: path.display().to_string(), source })
}

/// One `(station, device, metric_key, file)` leaf of the mapping tree, the
/// unit of work the COPY loader iterates over.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    pub station: String,
    pub device: String,
    pub device_type: Option<String>,
    pub pump_type: Option<String>,
    pub metric_key: String,
    pub file: String,
}

pub fn flatten(mapping: &MappingFile) -> Vec<MappingEntry> {
    let mut out = Vec::new();
    for station in &mapping.stations {
        for device in &station.devices {
            for metric in &device.metrics {
                for file in &metric.files {
                    out.push(MappingEntry {
                        station: station.name.clone(),
                        device: device.name.clone(),
                        device_type: device.device_type.clone(),
                        pump_type: device.pump_type.clone(),
                        metric_key: metric.key.clone(),
                        file: file.clone(),
                    });
                }
            }
        }
    }
    out
}

#[derive(Debug, Default)]
struct PathStats {
    paths: u64,
    missing_files: u64,
    with_data_prefix: u64,
}

impl PathStats {
    fn as_value(&self) -> Value {
        serde_json::json!({
            "paths": self.paths,
            "missing_files": self.missing_files,
            "with_data_prefix": self.with_data_prefix,
        })
    }
}

/// Read-only consistency check (`check-mapping`): schema validity plus
/// per-station/device/metric counts of missing files and `data/`-prefixed
/// paths, never mutating anything on disk. Grounded on the original's
/// strict-path rule: a file is resolved as `base_dir / path` (no implicit
/// `data/` stripping), and an erroneous `data/` prefix is flagged with a
/// suggested fix rather than silently corrected.
pub fn check_mapping_paths(base_dir: &Path, mapping: &MappingFile) -> Value {
    let schema_errors = validate_schema(mapping);

    let mut items = Vec::new();
    let mut by_station: BTreeMap<String, PathStats> = BTreeMap::new();
    let mut by_device: BTreeMap<(String, String), PathStats> = BTreeMap::new();
    let mut by_metric: BTreeMap<(String, String, String), PathStats> = BTreeMap::new();

    for entry in flatten(mapping) {
        let normalized = entry.file.replace('\\', "/");
        if normalized.trim().is_empty() {
            continue;
        }
        let has_data_prefix = normalized.starts_with("data/");
        let strict_path = base_dir.join(&entry.file);
        let exists = strict_path.exists();
        let suggestion = has_data_prefix.then(|| {
            let rel = &normalized["data/".len()..];
            format!("change the mapped path from '{}' to '{}' (relative to base_dir)", entry.file, rel)
        });
        let expected_path = has_data_prefix.then(|| base_dir.join(&normalized["data/".len()..]).display().to_string());

        items.push(serde_json::json!({
            "station": entry.station,
            "device": entry.device,
            "metric_key": entry.metric_key,
            "path": entry.file,
            "has_data_prefix": has_data_prefix,
            "strict_full_path": strict_path.display().to_string(),
            "exists_under_strict_rule": exists,
            "expected_full_path": expected_path,
            "suggestion": suggestion,
        }));

        bump(by_station.entry(entry.station.clone()).or_default(), exists, has_data_prefix);
        bump(by_device.entry((entry.station.clone(), entry.device.clone())).or_default(), exists, has_data_prefix);
        bump(
            by_metric.entry((entry.station.clone(), entry.device.clone(), entry.metric_key.clone())).or_default(),
            exists,
            has_data_prefix,
        );
    }

    let total_paths = items.len() as u64;
    let with_data_prefix = items.iter().filter(|i| i["has_data_prefix"] == Value::Bool(true)).count() as u64;
    let exists_count = items.iter().filter(|i| i["exists_under_strict_rule"] == Value::Bool(true)).count() as u64;

    let group_by_station = flatten_group(by_station.into_iter().map(|(station, s)| {
        let mut m = Map::new();
        m.insert("station".into(), station.into());
        merge_stats(&mut m, &s);
        Value::Object(m)
    }));
    let group_by_device = flatten_group(by_device.into_iter().map(|((station, device), s)| {
        let mut m = Map::new();
        m.insert("station".into(), station.into());
        m.insert("device".into(), device.into());
        merge_stats(&mut m, &s);
        Value::Object(m)
    }));
    let group_by_metric = flatten_group(by_metric.into_iter().map(|((station, device, metric_key), s)| {
        let mut m = Map::new();
        m.insert("station".into(), station.into());
        m.insert("device".into(), device.into());
        m.insert("metric_key".into(), metric_key.into());
        merge_stats(&mut m, &s);
        Value::Object(m)
    }));

    serde_json::json!({
        "base_dir": base_dir.display().to_string(),
        "total_paths": total_paths,
        "with_data_prefix": with_data_prefix,
        "exists_under_strict_rule": exists_count,
        "schema": { "errors": schema_errors, "warnings": Vec::<String>::new() },
        "items": items,
        "group_by_station": group_by_station,
        "group_by_device": group_by_device,
        "group_by_metric": group_by_metric,
    })
}

fn bump(stats: &mut PathStats, exists: bool, has_data_prefix: bool) {
    stats.paths += 1;
    if !exists {
        stats.missing_files += 1;
    }
    if has_data_prefix {
        stats.with_data_prefix += 1;
    }
}

fn merge_stats(m: &mut Map<String, Value>, stats: &PathStats) {
    if let Value::Object(fields) = stats.as_value() {
        m.extend(fields);
    }
}

/// Rows sorted by missing-file count desc, then data-prefix count desc,
/// matching the original's `sorted(..., key=lambda x: (-missing, -prefix))`.
fn flatten_group(rows: impl Iterator<Item = Value>) -> Vec<Value> {
    let mut rows: Vec<Value> = rows.collect();
    rows.sort_by(|a, b| {
        let missing_a = a["missing_files"].as_u64().unwrap_or(0);
        let missing_b = b["missing_files"].as_u64().unwrap_or(0);
        let prefix_a = a["with_data_prefix"].as_u64().unwrap_or(0);
        let prefix_b = b["with_data_prefix"].as_u64().unwrap_or(0);
        missing_b.cmp(&missing_a).then(prefix_b.cmp(&prefix_a))
    });
    rows
}

fn validate_schema(mapping: &MappingFile) -> Vec<String> {
    let mut errors = Vec::new();
    if mapping.stations.is_empty() {
        errors.push("missing or empty stations list".to_string());
        return errors;
    }
    for (si, station) in mapping.stations.iter().enumerate() {
        if station.name.trim().is_empty() {
            errors.push(format!("stations[{si}] missing name"));
        }
        if station.devices.is_empty() {
            errors.push(format!("stations[{si}] missing devices list"));
            continue;
        }
        for (di, device) in station.devices.iter().enumerate() {
            if device.name.trim().is_empty() {
                errors.push(format!("stations[{si}].devices[{di}] missing name"));
            }
            if device.metrics.is_empty() {
                errors.push(format!("stations[{si}].devices[{di}] missing metrics list"));
                continue;
            }
            for (mi, metric) in device.metrics.iter().enumerate() {
                if metric.key.trim().is_empty() {
                    errors.push(format!("stations[{si}].devices[{di}].metrics[{mi}] missing key"));
                }
                if metric.files.is_empty() {
                    errors.push(format!("stations[{si}].devices[{di}].metrics[{mi}] missing files list"));
                } else {
                    for (fi, file) in metric.files.iter().enumerate() {
                        if file.trim().is_empty() {
                            errors.push(format!(
                                "stations[{si}].devices[{di}].metrics[{mi}].files[{fi}] is not a valid string path"
                            ));
                        }
                    }
                }
            }
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mapping() -> MappingFile {
        serde_json::from_str(
            r#"{
                "stations": [
                    { "name": "St1", "devices": [
                        { "name": "D1", "type": "pump", "metrics": [
                            { "key": "flow_rate", "files": ["data/m1.csv", "m2.csv"] }
                        ]}
                    ]}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn flags_data_prefixed_paths_with_a_suggestion() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("m2.csv"), "x").unwrap();
        let report = check_mapping_paths(dir.path(), &sample_mapping());
        let items = report["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        let prefixed = items.iter().find(|i| i["path"] == "data/m1.csv").unwrap();
        assert_eq!(prefixed["has_data_prefix"], Value::Bool(true));
        assert!(prefixed["suggestion"].is_string());
        let clean = items.iter().find(|i| i["path"] == "m2.csv").unwrap();
        assert_eq!(clean["exists_under_strict_rule"], Value::Bool(true));
    }

    #[test]
    fn schema_validation_flags_missing_required_fields() {
        let mapping: MappingFile = serde_json::from_str(r#"{"stations": [{"name": "", "devices": []}]}"#).unwrap();
        let errors = validate_schema(&mapping);
        assert!(errors.iter().any(|e| e.contains("missing name")));
        assert!(errors.iter().any(|e| e.contains("missing devices list")));
    }
}
