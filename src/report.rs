use std::collections::BTreeMap;
use std::error::Error;
use std::fs::File;
use std::io::Write;
use std::time::Instant;

use crate::error::TreebenchError;
use crate::records::ScoredTable;

/// One aggregated (condition, k, method) group.
#[derive(Debug, Clone)]
pub struct GroupSummary {
    pub condition: String,
    pub k: u32,
    pub method: String,
    pub n: usize,
    /// Per-metric means, parallel to the requested metric list.
    pub means: Vec<f64>,
}

/// Group scored rows by (condition, k, method) and average each requested
/// metric, skipping missing values. A group whose values are all missing
/// gets a NaN mean.
pub fn aggregate(table: &ScoredTable, metrics: &[String]) -> Result<Vec<GroupSummary>, TreebenchError> {
    let columns: Vec<usize> = metrics
        .iter()
        .map(|m| table.metric_column(m))
        .collect::<Result<_, _>>()?;

    let mut groups: BTreeMap<(String, u32, String), Vec<usize>> = BTreeMap::new();
    for (i, row) in table.rows.iter().enumerate() {
        groups
            .entry((row.condition.clone(), row.k, row.method.clone()))
            .or_default()
            .push(i);
    }

    let mut out = Vec::new();
    for ((condition, k, method), row_ids) in groups {
        let mut means = Vec::with_capacity(columns.len());
        for &col in &columns {
            let mut sum = 0.0;
            let mut count = 0usize;
            for &i in &row_ids {
                let v = table.value(&table.rows[i], col)?;
                if !v.is_nan() {
                    sum += v;
                    count += 1;
                }
            }
            means.push(if count == 0 { f64::NAN } else { sum / count as f64 });
        }
        out.push(GroupSummary {
            condition,
            k,
            method,
            n: row_ids.len(),
            means,
        });
    }
    Ok(out)
}

fn format_mean(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else {
        format!("{:.3}", v)
    }
}

/// LaTeX rendering of the aggregate. Cell text passes through unescaped so
/// condition labels may carry LaTeX markup.
pub fn latex_table(groups: &[GroupSummary], metrics: &[String]) -> String {
    let mut latex = String::new();
    let col_spec = format!("lrl{}", "r".repeat(metrics.len() + 1));
    latex.push_str(&format!("\\begin{{tabular}}{{{}}}\n", col_spec));
    latex.push_str("\\hline\n");

    let mut header = vec![
        "condition".to_string(),
        "k".to_string(),
        "method".to_string(),
        "n".to_string(),
    ];
    header.extend(metrics.iter().cloned());
    latex.push_str(&header.join(" & "));
    latex.push_str(" \\\\\n\\hline\n");

    for g in groups {
        let mut cells = vec![g.condition.clone(), g.k.to_string(), g.method.clone(), g.n.to_string()];
        cells.extend(g.means.iter().map(|&m| format_mean(m)));
        latex.push_str(&cells.join(" & "));
        latex.push_str(" \\\\\n");
    }

    latex.push_str("\\hline\n\\end{tabular}\n");
    latex
}

fn print_console_table(groups: &[GroupSummary], metrics: &[String]) {
    let mut headers = vec![
        "condition".to_string(),
        "k".to_string(),
        "method".to_string(),
        "n".to_string(),
    ];
    headers.extend(metrics.iter().cloned());

    let mut rows: Vec<Vec<String>> = Vec::with_capacity(groups.len());
    for g in groups {
        let mut cells = vec![g.condition.clone(), g.k.to_string(), g.method.clone(), g.n.to_string()];
        cells.extend(g.means.iter().map(|&m| format_mean(m)));
        rows.push(cells);
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }
    let render = |cells: &[String]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, &w)| format!("{:<width$}", c, width = w))
            .collect::<Vec<_>>()
            .join("  ")
    };

    println!("    {}", render(&headers).trim_end());
    for row in &rows {
        println!("    {}", render(row).trim_end());
    }
}

pub fn report_metrics(
    input_file: &str,
    output_file: Option<&str>,
    metrics: &[String],
    logger: &mut crate::Logger,
) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();

    logger.log("=== Treebench Metric Report ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!(
        "Runtime: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    ))?;
    logger.log(&format!("Input File: {}", input_file))?;
    if let Some(path) = output_file {
        logger.log(&format!("Output File: {}", path))?;
    }
    logger.log(&format!("Metrics: {}", metrics.join(", ")))?;

    println!("[Loading data]");
    println!("    Input: {}", input_file);
    println!();

    println!("[Params]");
    println!("    Metrics: {}.", metrics.join(", "));
    println!();

    let table = ScoredTable::load(input_file)?;
    if table.rows.is_empty() {
        return Err(format!("Error: {} contains no data rows", input_file).into());
    }
    let groups = aggregate(&table, metrics)?;

    println!("[Data info]");
    println!("    rows: {}. groups: {}.", table.rows.len(), groups.len());
    println!();

    println!("[Summary]");
    print_console_table(&groups, metrics);
    println!();

    println!("[LaTeX]");
    print!("{}", latex_table(&groups, metrics));
    println!();

    if let Some(path) = output_file {
        let mut output = File::create(path)?;
        let mut header = vec!["condition".to_string(), "k".to_string(), "method".to_string(), "n".to_string()];
        header.extend(metrics.iter().cloned());
        writeln!(output, "{}", header.join(","))?;
        for g in &groups {
            let mut cells = vec![g.condition.clone(), g.k.to_string(), g.method.clone(), g.n.to_string()];
            cells.extend(g.means.iter().map(|&m| format_mean(m)));
            writeln!(output, "{}", cells.join(","))?;
        }
        println!("[Output]");
        println!("    Aggregate: {}", path);
    }

    let elapsed = start_time.elapsed();
    println!("{}", crate::progress::format_time_used(elapsed));

    logger.log("Metric report completed")?;
    logger.log(&format!("Groups: {}", groups.len()))?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ScoredRow;

    fn table(header: &[&str], rows: &[&[&str]]) -> ScoredTable {
        let header: Vec<String> = header.iter().map(|s| s.to_string()).collect();
        let ci = header.iter().position(|h| h == "condition").unwrap();
        let ki = header.iter().position(|h| h == "k").unwrap();
        let mi = header.iter().position(|h| h == "method").unwrap();
        let rows = rows
            .iter()
            .enumerate()
            .map(|(i, cells)| {
                let fields: Vec<String> = cells.iter().map(|s| s.to_string()).collect();
                ScoredRow {
                    condition: fields[ci].clone(),
                    k: fields[ki].parse().unwrap(),
                    method: fields[mi].clone(),
                    fields,
                    line: i + 2,
                }
            })
            .collect();
        ScoredTable {
            path: "mem".to_string(),
            header,
            rows,
        }
    }

    #[test]
    fn aggregate_skips_missing_values() {
        let t = table(
            &["condition", "k", "method", "rf", "qscore"],
            &[
                &["model1", "50", "astral", "0.1", "NaN"],
                &["model1", "50", "astral", "0.3", "0.8"],
                &["model1", "50", "wastral", "NaN", "NaN"],
            ],
        );
        let groups = aggregate(&t, &["rf".to_string(), "qscore".to_string()]).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].method, "astral");
        assert_eq!(groups[0].n, 2);
        assert!((groups[0].means[0] - 0.2).abs() < 1e-12);
        assert_eq!(groups[0].means[1], 0.8);
        assert_eq!(groups[1].n, 1);
        assert!(groups[1].means[0].is_nan());
    }

    #[test]
    fn aggregate_orders_by_condition_k_method() {
        let t = table(
            &["condition", "k", "method", "rf"],
            &[
                &["model2", "50", "astral", "0.1"],
                &["model1", "200", "astral", "0.2"],
                &["model1", "50", "wastral", "0.3"],
                &["model1", "50", "astral", "0.4"],
            ],
        );
        let groups = aggregate(&t, &["rf".to_string()]).unwrap();
        let keys: Vec<(String, u32, String)> = groups
            .iter()
            .map(|g| (g.condition.clone(), g.k, g.method.clone()))
            .collect();
        assert_eq!(keys[0], ("model1".to_string(), 50, "astral".to_string()));
        assert_eq!(keys[1], ("model1".to_string(), 50, "wastral".to_string()));
        assert_eq!(keys[2], ("model1".to_string(), 200, "astral".to_string()));
        assert_eq!(keys[3], ("model2".to_string(), 50, "astral".to_string()));
    }

    #[test]
    fn aggregate_rejects_unknown_metric() {
        let t = table(&["condition", "k", "method", "rf"], &[&["m", "1", "a", "0.5"]]);
        assert!(matches!(
            aggregate(&t, &["nrf".to_string()]),
            Err(TreebenchError::UnknownMetric(_))
        ));
    }

    #[test]
    fn latex_table_matches_expected_output() {
        let groups = vec![
            GroupSummary {
                condition: "model1".to_string(),
                k: 50,
                method: "astral".to_string(),
                n: 2,
                means: vec![0.125],
            },
            GroupSummary {
                condition: "model1".to_string(),
                k: 50,
                method: "wastral".to_string(),
                n: 2,
                means: vec![0.25],
            },
        ];
        let latex = latex_table(&groups, &["rf".to_string()]);
        let expected = "\\begin{tabular}{lrlrr}\n\
                        \\hline\n\
                        condition & k & method & n & rf \\\\\n\
                        \\hline\n\
                        model1 & 50 & astral & 2 & 0.125 \\\\\n\
                        model1 & 50 & wastral & 2 & 0.250 \\\\\n\
                        \\hline\n\
                        \\end{tabular}\n";
        assert_eq!(latex, expected);
    }

    #[test]
    fn latex_table_leaves_markup_unescaped() {
        let groups = vec![GroupSummary {
            condition: "M1 ($\\theta = 2$)".to_string(),
            k: 100,
            method: "astral".to_string(),
            n: 1,
            means: vec![f64::NAN],
        }];
        let latex = latex_table(&groups, &["rf".to_string()]);
        assert!(latex.contains("M1 ($\\theta = 2$) & 100 & astral & 1 & NaN \\\\"), "{latex}");
    }
}
