use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::error::Error;
use std::time::Instant;

use plotters::prelude::*;

use crate::progress::SimpleProgress;
use crate::records::{load_localization, ScoredTable};
use crate::report;

const PALETTE: [RGBColor; 6] = [RED, BLUE, GREEN, MAGENTA, CYAN, BLACK];

/// Grouped bar chart for one condition and one metric: one bar group per k,
/// one bar per method, y = group mean over the replicates.
fn render_bar_chart(
    caption: &str,
    metric: &str,
    ks: &[u32],
    series: &BTreeMap<&str, BTreeMap<u32, f64>>,
    filename: &str,
) -> Result<(), Box<dyn Error>> {
    let root = BitMapBackend::new(filename, (1200, 800)).into_drawing_area();
    root.fill(&WHITE)?;

    let root = root.margin(10, 10, 10, 10);

    let finite: Vec<f64> = series
        .values()
        .flat_map(|by_k| by_k.values())
        .copied()
        .filter(|v| v.is_finite())
        .collect();
    let max_mean = finite.iter().copied().fold(f64::MIN, f64::max);
    let min_mean = finite.iter().copied().fold(f64::MAX, f64::min);

    let y_min = if min_mean < 0.0 { min_mean * 1.1 } else { 0.0 };
    let mut y_max = if max_mean > 0.0 { max_mean * 1.1 } else { 0.0 };
    if y_max <= y_min {
        y_max = y_min + 1.0;
    }

    let x_max = ks.len() as f64 - 0.5;
    let mut chart = ChartBuilder::on(&root)
        .caption(format!("{} - {}", caption, metric), ("sans-serif", 30))
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(-0.5f64..x_max, y_min..y_max)?;

    chart
        .configure_mesh()
        .x_desc("k")
        .y_desc(metric)
        .x_labels(ks.len())
        .x_label_formatter(&|x| {
            let i = x.round();
            if (x - i).abs() < 1e-6 && i >= 0.0 && (i as usize) < ks.len() {
                ks[i as usize].to_string()
            } else {
                String::new()
            }
        })
        .draw()?;

    // Bar groups are centered on the k index; each method gets one slot.
    let slot = 0.8 / series.len() as f64;
    for (j, (method, by_k)) in series.iter().enumerate() {
        let color = PALETTE[j % PALETTE.len()];
        let mut bars = Vec::new();
        for (i, k) in ks.iter().enumerate() {
            if let Some(&mean) = by_k.get(k) {
                if mean.is_finite() {
                    let left = i as f64 - 0.4 + j as f64 * slot;
                    bars.push(Rectangle::new(
                        [(left, 0.0), (left + slot, mean)],
                        color.mix(0.85).filled(),
                    ));
                }
            }
        }
        chart
            .draw_series(bars)?
            .label(*method)
            .legend(move |(x, y)| Rectangle::new([(x, y - 4), (x + 16, y + 4)], color.filled()));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()?;

    Ok(())
}

pub fn plot_metrics(
    input_file: &str,
    output_dir: &str,
    metrics: &[String],
    localization_file: Option<&str>,
    logger: &mut crate::Logger,
) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();

    logger.log("=== Treebench Chart Rendering ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!(
        "Runtime: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    ))?;
    logger.log(&format!("Input File: {}", input_file))?;
    logger.log(&format!("Output Directory: {}", output_dir))?;
    logger.log(&format!("Metrics: {}", metrics.join(", ")))?;
    if let Some(path) = localization_file {
        logger.log(&format!("Localization File: {}", path))?;
    }

    println!("[Loading data]");
    println!("    Input: {}", input_file);
    if let Some(path) = localization_file {
        println!("    Localization: {}", path);
    }
    println!();

    println!("[Params]");
    println!("    Metrics: {}. Output directory: {}.", metrics.join(", "), output_dir);
    println!();

    let table = ScoredTable::load(input_file)?;
    if table.rows.is_empty() {
        return Err(format!("Error: {} contains no data rows", input_file).into());
    }
    let localization = match localization_file {
        Some(path) => load_localization(path)?,
        None => HashMap::new(),
    };
    let groups = report::aggregate(&table, metrics)?;

    let conditions: BTreeSet<&str> = groups.iter().map(|g| g.condition.as_str()).collect();
    let planned = conditions.len() * metrics.len();
    println!("[Data info]");
    println!(
        "    rows: {}. groups: {}. conditions: {}. planned charts: {}.",
        table.rows.len(),
        groups.len(),
        conditions.len(),
        planned
    );
    println!();

    let mut progress = SimpleProgress::new(planned);
    let mut done = 0;
    let mut written = Vec::new();
    let mut skipped_notes = Vec::new();

    for condition in &conditions {
        let ks: Vec<u32> = groups
            .iter()
            .filter(|g| g.condition == *condition)
            .map(|g| g.k)
            .collect::<BTreeSet<u32>>()
            .into_iter()
            .collect();
        let display = localization
            .get(*condition)
            .map(String::as_str)
            .unwrap_or(condition);

        for (mi, metric) in metrics.iter().enumerate() {
            let mut series: BTreeMap<&str, BTreeMap<u32, f64>> = BTreeMap::new();
            for g in groups.iter().filter(|g| g.condition == *condition) {
                series.entry(g.method.as_str()).or_default().insert(g.k, g.means[mi]);
            }

            done += 1;
            let any_finite = series
                .values()
                .flat_map(|by_k| by_k.values())
                .any(|v| v.is_finite());
            if !any_finite {
                skipped_notes.push(format!("{} / {}: no finite values", condition, metric));
                logger.log(&format!("Skipped chart {} / {}: no finite values", condition, metric))?;
                progress.update(done)?;
                continue;
            }

            let filename = format!("{}/{}_{}.png", output_dir, condition.replace('/', "_"), metric);
            render_bar_chart(display, metric, &ks, &series, &filename)?;
            logger.log(&format!("Rendered {}", filename))?;
            written.push(filename);
            progress.update(done)?;
        }
    }
    progress.finish()?;
    println!();

    let elapsed = start_time.elapsed();

    println!("[Output]");
    for file in &written {
        println!("    Chart: {}", file);
    }
    for note in &skipped_notes {
        println!("    Skipped {}.", note);
    }
    println!("{}", crate::progress::format_time_used(elapsed));

    logger.log("Chart rendering completed")?;
    logger.log(&format!("Charts written: {}", written.len()))?;
    logger.log(&format!("Charts skipped: {}", skipped_notes.len()))?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as IoWrite;

    fn fixture(name: &str, content: &str) -> String {
        let path = std::env::temp_dir().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn test_logger(name: &str) -> crate::Logger {
        let path = std::env::temp_dir().join(name);
        crate::Logger::new(std::fs::File::create(path).unwrap())
    }

    #[test]
    fn plot_writes_one_png_per_condition_and_metric() {
        let input = fixture(
            "treebench_plot_in.csv",
            "condition,k,method,rf\n\
             model1,50,astral,0.10\n\
             model1,50,wastral,0.20\n\
             model1,200,astral,0.05\n\
             model1,200,wastral,0.15\n",
        );
        let outdir = std::env::temp_dir().join("treebench_plot_out");
        std::fs::create_dir_all(&outdir).unwrap();
        let outdir = outdir.to_str().unwrap().to_string();

        let mut logger = test_logger("treebench_plot.log");
        plot_metrics(&input, &outdir, &["rf".to_string()], None, &mut logger).unwrap();

        let png = format!("{}/model1_rf.png", outdir);
        let meta = std::fs::metadata(&png).unwrap();
        assert!(meta.len() > 0);
    }

    #[test]
    fn plot_skips_charts_without_finite_values() {
        let input = fixture(
            "treebench_plot_nan.csv",
            "condition,k,method,qscore\n\
             model1,50,astral,NaN\n\
             model1,200,astral,NaN\n",
        );
        let outdir = std::env::temp_dir().join("treebench_plot_nan_out");
        std::fs::create_dir_all(&outdir).unwrap();
        let outdir = outdir.to_str().unwrap().to_string();
        let png = format!("{}/model1_qscore.png", outdir);
        let _ = std::fs::remove_file(&png);

        let mut logger = test_logger("treebench_plot_nan.log");
        plot_metrics(&input, &outdir, &["qscore".to_string()], None, &mut logger).unwrap();

        assert!(!std::path::Path::new(&png).exists());
    }

    #[test]
    fn chart_filenames_flatten_path_separators() {
        let input = fixture(
            "treebench_plot_slash.csv",
            "condition,k,method,rf\nmodel/hard,50,astral,0.5\n",
        );
        let outdir = std::env::temp_dir().join("treebench_plot_slash_out");
        std::fs::create_dir_all(&outdir).unwrap();
        let outdir = outdir.to_str().unwrap().to_string();

        let mut logger = test_logger("treebench_plot_slash.log");
        plot_metrics(&input, &outdir, &["rf".to_string()], None, &mut logger).unwrap();

        let png = format!("{}/model_hard_rf.png", outdir);
        assert!(std::path::Path::new(&png).exists());
    }
}
