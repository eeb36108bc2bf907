use std::collections::HashMap;
use std::fs;

use crate::error::{Result, TreebenchError};

/// One manifest row: an experimental trial pointing at a tree pair.
#[derive(Debug, Clone)]
pub struct Trial {
    pub condition: String,
    pub k: u32,
    pub method: String,
    pub stree_path: String,
    pub input_path: String,
    /// 1-based line number in the manifest, for error reporting.
    pub line: usize,
    /// Cells in file order, echoed verbatim into the scored output.
    pub raw: Vec<String>,
}

/// Parsed manifest: header as read plus one trial per data row.
#[derive(Debug)]
pub struct Manifest {
    pub header: Vec<String>,
    pub trials: Vec<Trial>,
}

fn split_row(line: &str) -> Vec<String> {
    line.split(',').map(|f| f.trim().to_string()).collect()
}

fn column_index(path: &str, header: &[String], name: &str) -> Result<usize> {
    header
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| TreebenchError::Csv {
            path: path.to_string(),
            line: 1,
            message: format!("missing required column: {name}"),
        })
}

fn read_lines(path: &str) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).map_err(|source| TreebenchError::Read {
        path: path.to_string(),
        source,
    })?;
    Ok(text.lines().map(|l| l.to_string()).collect())
}

fn parse_k(path: &str, line: usize, value: &str) -> Result<u32> {
    value.parse::<u32>().map_err(|_| TreebenchError::Csv {
        path: path.to_string(),
        line,
        message: format!("column k: invalid integer '{value}'"),
    })
}

fn check_width(path: &str, line: usize, expected: usize, found: usize) -> Result<()> {
    if found != expected {
        return Err(TreebenchError::Csv {
            path: path.to_string(),
            line,
            message: format!("expected {expected} fields, found {found}"),
        });
    }
    Ok(())
}

impl Manifest {
    pub fn load(path: &str) -> Result<Manifest> {
        let lines = read_lines(path)?;
        let header = match lines.first() {
            Some(l) if !l.trim().is_empty() => split_row(l),
            _ => {
                return Err(TreebenchError::Csv {
                    path: path.to_string(),
                    line: 1,
                    message: "missing header".to_string(),
                })
            }
        };
        let ci = column_index(path, &header, "condition")?;
        let ki = column_index(path, &header, "k")?;
        let mi = column_index(path, &header, "method")?;
        let si = column_index(path, &header, "streepath")?;
        let ii = column_index(path, &header, "inputpath")?;

        let mut trials = Vec::new();
        for (offset, raw_line) in lines.iter().enumerate().skip(1) {
            if raw_line.trim().is_empty() {
                continue;
            }
            let line = offset + 1;
            let fields = split_row(raw_line);
            check_width(path, line, header.len(), fields.len())?;
            trials.push(Trial {
                condition: fields[ci].clone(),
                k: parse_k(path, line, &fields[ki])?,
                method: fields[mi].clone(),
                stree_path: fields[si].clone(),
                input_path: fields[ii].clone(),
                line,
                raw: fields,
            });
        }
        Ok(Manifest { header, trials })
    }
}

/// One row of a scored CSV: key columns typed, the rest kept as text.
#[derive(Debug, Clone)]
pub struct ScoredRow {
    pub condition: String,
    pub k: u32,
    pub method: String,
    pub fields: Vec<String>,
    pub line: usize,
}

/// A scored CSV loaded whole; metric columns are looked up by header name.
#[derive(Debug)]
pub struct ScoredTable {
    pub path: String,
    pub header: Vec<String>,
    pub rows: Vec<ScoredRow>,
}

impl ScoredTable {
    pub fn load(path: &str) -> Result<ScoredTable> {
        let lines = read_lines(path)?;
        let header = match lines.first() {
            Some(l) if !l.trim().is_empty() => split_row(l),
            _ => {
                return Err(TreebenchError::Csv {
                    path: path.to_string(),
                    line: 1,
                    message: "missing header".to_string(),
                })
            }
        };
        let ci = column_index(path, &header, "condition")?;
        let ki = column_index(path, &header, "k")?;
        let mi = column_index(path, &header, "method")?;

        let mut rows = Vec::new();
        for (offset, raw_line) in lines.iter().enumerate().skip(1) {
            if raw_line.trim().is_empty() {
                continue;
            }
            let line = offset + 1;
            let fields = split_row(raw_line);
            check_width(path, line, header.len(), fields.len())?;
            rows.push(ScoredRow {
                condition: fields[ci].clone(),
                k: parse_k(path, line, &fields[ki])?,
                method: fields[mi].clone(),
                fields,
                line,
            });
        }
        Ok(ScoredTable { path: path.to_string(), header, rows })
    }

    /// Index of a metric column by header name.
    pub fn metric_column(&self, name: &str) -> Result<usize> {
        self.header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| TreebenchError::UnknownMetric(name.to_string()))
    }

    /// Numeric cell value; the literal `NaN` is a valid (missing) value.
    pub fn value(&self, row: &ScoredRow, column: usize) -> Result<f64> {
        let cell = &row.fields[column];
        parse_f64_allow_nan(cell).ok_or_else(|| TreebenchError::Csv {
            path: self.path.clone(),
            line: row.line,
            message: format!("column {}: invalid number '{cell}'", self.header[column]),
        })
    }
}

pub fn parse_f64_allow_nan(value: &str) -> Option<f64> {
    if value.eq_ignore_ascii_case("nan") {
        Some(f64::NAN)
    } else {
        value.parse::<f64>().ok()
    }
}

/// Runtime/memory figures from a `<tree>.meta` sidecar (GNU time `%e;%M`).
#[derive(Debug, Clone, Copy)]
pub struct RunMeta {
    pub runtime_s: f64,
    pub mem_mb: f64,
}

/// Read the sidecar next to an inferred tree. A missing sidecar is normal;
/// an unparsable one is a fault.
pub fn load_sidecar(input_path: &str) -> Result<Option<RunMeta>> {
    let path = format!("{input_path}.meta");
    let text = match fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(TreebenchError::Read { path, source }),
    };
    let line = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| TreebenchError::Sidecar {
            path: path.clone(),
            message: "no data line".to_string(),
        })?;
    let parts: Vec<&str> = line.trim().split(';').collect();
    if parts.len() != 2 {
        return Err(TreebenchError::Sidecar {
            path,
            message: format!("expected 'runtime;memory', found '{}'", line.trim()),
        });
    }
    let runtime_s: f64 = parts[0].trim().parse().map_err(|_| TreebenchError::Sidecar {
        path: path.clone(),
        message: format!("invalid runtime '{}'", parts[0].trim()),
    })?;
    let max_rss_kb: f64 = parts[1].trim().parse().map_err(|_| TreebenchError::Sidecar {
        path: path.clone(),
        message: format!("invalid memory '{}'", parts[1].trim()),
    })?;
    Ok(Some(RunMeta {
        runtime_s,
        mem_mb: max_rss_kb / 1024.0,
    }))
}

/// Optional condition-to-display-label map.
pub fn load_localization(path: &str) -> Result<HashMap<String, String>> {
    let text = fs::read_to_string(path).map_err(|source| TreebenchError::Read {
        path: path.to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|e| TreebenchError::Localization {
        path: path.to_string(),
        message: e.to_string(),
    })
}
