use clap::Args;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::distance::{compare_trees, TreeComparison};
use crate::error::TreebenchError;
use crate::records::{load_sidecar, Manifest, RunMeta, Trial};
use crate::tree::Tree;

#[derive(Args, Debug)]
pub struct ScoreArgs {
    /// Manifest CSV file (condition,k,method,streepath,inputpath)
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Output CSV file with per-row tree metrics
    #[arg(short = 'o', long = "output")]
    pub output: String,
    /// Quartet sample budget; 0 disables quartet scoring
    #[arg(short = 'q', long = "quartets", default_value_t = 10000)]
    pub quartets: usize,
    /// Fold underscores in unquoted Newick labels to spaces
    #[arg(long = "underscores")]
    pub underscores: bool,
    /// Number of worker threads (0 = library default)
    #[arg(short = 't', long = "threads", default_value_t = 0)]
    pub threads: usize,
    /// Log file path
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

/// Validate score command arguments
fn validate_score_args(args: &ScoreArgs) -> Result<(), Box<dyn Error>> {
    if args.input.trim().is_empty() {
        return Err("Error: Input file path cannot be empty".into());
    }
    if !Path::new(&args.input).exists() {
        return Err(format!("Error: Input file does not exist: {}", args.input).into());
    }
    if !args.input.ends_with(".csv") {
        return Err(format!("Error: Input file path must end with .csv: {}", args.input).into());
    }

    if args.output.trim().is_empty() {
        return Err("Error: Output file path cannot be empty".into());
    }
    if !args.output.ends_with(".csv") {
        return Err(format!(
            "Error: Output file path must end with .csv: {}",
            args.output
        )
        .into());
    }

    Ok(())
}

struct RowMetrics {
    comparison: TreeComparison,
    meta: Option<RunMeta>,
}

fn score_trial(
    trial: &Trial,
    quartet_budget: usize,
    fold_underscores: bool,
) -> Result<RowMetrics, TreebenchError> {
    let reference = Tree::load(&trial.stree_path, fold_underscores)?;
    let estimate = Tree::load(&trial.input_path, fold_underscores)?;
    let comparison = compare_trees(&reference, &estimate, quartet_budget)?;
    let meta = load_sidecar(&trial.input_path)?;
    Ok(RowMetrics { comparison, meta })
}

pub fn run_score(args: &ScoreArgs, logger: &mut crate::Logger) -> Result<(), Box<dyn Error>> {
    validate_score_args(args)?;

    let start_time = Instant::now();

    logger.log("=== Treebench Tree Scoring ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!(
        "Runtime: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    ))?;
    logger.log(&format!("Input File: {}", args.input))?;
    logger.log(&format!("Output File: {}", args.output))?;
    logger.log(&format!("Quartet Budget: {}", args.quartets))?;
    logger.log(&format!("Underscore Folding: {}", args.underscores))?;
    logger.log(&format!("Threads: {}", args.threads))?;

    if args.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.threads)
            .build_global()
            .ok();
    }

    println!("[Loading data]");
    println!("    Manifest: {}", args.input);
    println!();

    let threads_display = if args.threads == 0 {
        "default".to_string()
    } else {
        args.threads.to_string()
    };
    println!("[Params]");
    println!(
        "    Quartet budget: {}. Underscore folding: {}. Threads: {}.",
        args.quartets, args.underscores, threads_display
    );
    println!();

    let manifest = Manifest::load(&args.input)?;
    if manifest.trials.is_empty() {
        return Err(format!("Error: {} contains no data rows", args.input).into());
    }

    let conditions: BTreeSet<&str> = manifest
        .trials
        .iter()
        .map(|t| t.condition.as_str())
        .collect();
    println!("[Data info]");
    println!(
        "    rows: {}. conditions: {}.",
        manifest.trials.len(),
        conditions.len()
    );
    println!();

    let total = manifest.trials.len();
    let completed = Arc::new(AtomicUsize::new(0));
    print!("\r[Running] Scoring 0/{} rows (0.0%)", total);
    std::io::stdout().flush().ok();

    let results: Vec<Result<RowMetrics, TreebenchError>> = manifest
        .trials
        .par_iter()
        .map(|trial| {
            let row = score_trial(trial, args.quartets, args.underscores);
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            let percentage = (done as f64 * 100.0) / total as f64;
            print!("\r[Running] Scoring {}/{} rows ({:.1}%)", done, total, percentage);
            std::io::stdout().flush().ok();
            row
        })
        .collect();
    println!();
    println!();

    // Errors surface in manifest order, not completion order.
    let mut rows = Vec::with_capacity(total);
    for (trial, result) in manifest.trials.iter().zip(results) {
        match result {
            Ok(metrics) => rows.push((trial, metrics)),
            Err(e) => {
                return Err(format!("Error: manifest row at line {}: {}", trial.line, e).into())
            }
        }
    }

    let out_file = File::create(&args.output)?;
    let mut writer = BufWriter::new(out_file);
    writeln!(
        writer,
        "{},ntaxa,ref_edges,est_edges,fp,fn,sd,rf,qscore,runtime_s,mem_mb",
        manifest.header.join(",")
    )?;
    let mut sidecars_found = 0;
    for (trial, metrics) in &rows {
        let c = &metrics.comparison;
        let (runtime_s, mem_mb) = match &metrics.meta {
            Some(meta) => {
                sidecars_found += 1;
                (meta.runtime_s, meta.mem_mb)
            }
            None => (f64::NAN, f64::NAN),
        };
        writeln!(
            writer,
            "{},{},{},{},{},{},{:.6},{:.6},{:.6},{:.6},{:.6}",
            trial.raw.join(","),
            c.ntaxa,
            c.ref_edges,
            c.est_edges,
            c.false_positives,
            c.false_negatives,
            c.symmetric_difference,
            c.robinson_foulds,
            c.quartet_score,
            runtime_s,
            mem_mb,
        )?;
    }
    writer.flush()?;

    let elapsed = start_time.elapsed();

    println!("[Output]");
    println!("    Scores: {}", args.output);
    println!(
        "    Scored rows: {}. Sidecars found: {}.",
        rows.len(),
        sidecars_found
    );
    println!("{}", crate::progress::format_time_used(elapsed));

    logger.log("Tree scoring completed")?;
    logger.log(&format!("Scored rows: {}", rows.len()))?;
    logger.log(&format!("Sidecars found: {}", sidecars_found))?;
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

    fn args(input: &str, output: &str) -> ScoreArgs {
        ScoreArgs {
            input: input.to_string(),
            output: output.to_string(),
            quartets: 100,
            underscores: false,
            threads: 0,
            log: None,
        }
    }

    #[test]
    fn scores_manifest_end_to_end() {
        let reference = fixture("treebench_score_ref.nwk", "((A,B),(C,D));\n");
        let same = fixture("treebench_score_same.nwk", "((A,B),(C,D));\n");
        let conflict = fixture("treebench_score_conflict.nwk", "((A,C),(B,D));\n");
        fixture("treebench_score_same.nwk.meta", "12.5;1024\n");

        let manifest = fixture(
            "treebench_score_manifest.csv",
            &format!(
                "condition,k,method,streepath,inputpath\n\
                 pine,50,astral,{r},{s}\n\
                 pine,50,wastral,{r},{c}\n",
                r = reference,
                s = same,
                c = conflict
            ),
        );
        let output = std::env::temp_dir()
            .join("treebench_score_out.csv")
            .to_str()
            .unwrap()
            .to_string();

        let mut logger = test_logger("treebench_score.log");
        run_score(&args(&manifest, &output), &mut logger).unwrap();

        let written = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "condition,k,method,streepath,inputpath,ntaxa,ref_edges,est_edges,fp,fn,sd,rf,qscore,runtime_s,mem_mb"
        );
        // Identical trees with a sidecar: zero distance, 1024 KB = 1 MB.
        assert!(lines[1].starts_with("pine,50,astral,"));
        assert!(lines[1].ends_with(",4,1,1,0,0,0.000000,0.000000,1.000000,12.500000,1.000000"));
        // Conflicting trees without a sidecar: maximal distance, NaN runtime columns.
        assert!(lines[2].starts_with("pine,50,wastral,"));
        assert!(lines[2].ends_with(",4,1,1,1,1,1.000000,1.000000,0.000000,NaN,NaN"));
    }

    #[test]
    fn missing_tree_file_stops_the_run() {
        let reference = fixture("treebench_score_ref2.nwk", "((A,B),(C,D));\n");
        let manifest = fixture(
            "treebench_score_missing.csv",
            &format!(
                "condition,k,method,streepath,inputpath\n\
                 pine,50,astral,{},/nonexistent/treebench_est.nwk\n",
                reference
            ),
        );
        let output = std::env::temp_dir()
            .join("treebench_score_missing_out.csv")
            .to_str()
            .unwrap()
            .to_string();

        let mut logger = test_logger("treebench_score_missing.log");
        let err = run_score(&args(&manifest, &output), &mut logger).unwrap_err();
        assert!(err.to_string().contains("manifest row at line 2"));
    }

    #[test]
    fn rejects_non_csv_output() {
        let manifest = fixture(
            "treebench_score_badout.csv",
            "condition,k,method,streepath,inputpath\n",
        );
        let mut logger = test_logger("treebench_score_badout.log");
        let err = run_score(&args(&manifest, "scores.txt"), &mut logger).unwrap_err();
        assert!(err.to_string().contains("must end with .csv"));
    }
}
