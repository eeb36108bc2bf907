// Version information constants
const VERSION: &str = env!("CARGO_PKG_VERSION");

use clap::{Args, Parser, Subcommand};
use std::error::Error;
use std::io::{BufWriter, Write};
use std::path::Path;

mod compare;
mod distance;
mod error;
mod plot;
mod progress;
mod records;
mod report;
mod score;
mod tree;

/// Logger manager for detailed run logs
pub struct Logger {
    writer: BufWriter<std::fs::File>,
}

impl Logger {
    pub fn new(file: std::fs::File) -> Self {
        Self {
            writer: BufWriter::new(file),
        }
    }

    /// Record detailed log information
    pub fn log(&mut self, message: &str) -> std::io::Result<()> {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(self.writer, "[{}] {}", timestamp, message)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score estimated trees against reference trees listed in a manifest
    Score(score::ScoreArgs),
    /// Aggregate scored rows into group means and a LaTeX summary table
    Report(ReportArgs),
    /// Run pairwise statistical tests between inference methods
    Compare(CompareArgs),
    /// Render grouped bar charts per condition and metric
    Plot(PlotArgs),
}

#[derive(Args)]
struct ReportArgs {
    /// Scored CSV file from the score step
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Output CSV path for the aggregated table (optional)
    #[arg(short = 'o', long = "output")]
    pub output: Option<String>,
    /// Metric columns to aggregate (comma-separated)
    #[arg(long = "metrics", default_value = "rf")]
    pub metrics: String,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

#[derive(Args)]
struct CompareArgs {
    /// Scored CSV file from the score step
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Output CSV path for pairwise test results
    #[arg(short = 'o', long = "output")]
    pub output: String,
    /// Metric column to test
    #[arg(short = 'm', long = "metric", default_value = "rf")]
    pub metric: String,
    /// Statistical test: wilcoxon, t-test, mann-whitney
    #[arg(long = "test", default_value = "wilcoxon")]
    pub test: String,
    /// Significance level
    #[arg(long = "alpha", default_value_t = 0.05)]
    pub alpha: f64,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

#[derive(Args)]
struct PlotArgs {
    /// Scored CSV file from the score step
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Output directory for chart images
    #[arg(short = 'o', long = "outdir", default_value = ".")]
    pub outdir: String,
    /// Metric columns to chart (comma-separated)
    #[arg(long = "metrics", default_value = "rf")]
    pub metrics: String,
    /// JSON file mapping condition names to display labels
    #[arg(long = "localization")]
    pub localization: Option<String>,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

/// Validate report command arguments
fn validate_report_args(args: &ReportArgs) -> Result<(), Box<dyn Error>> {
    if args.input.trim().is_empty() {
        return Err("Error: Input file path cannot be empty".into());
    }
    if !Path::new(&args.input).exists() {
        return Err(format!("Error: Input file does not exist: {}", args.input).into());
    }
    if !args.input.ends_with(".csv") {
        return Err(format!("Error: Input file path must end with .csv: {}", args.input).into());
    }

    if let Some(output) = &args.output {
        if !output.ends_with(".csv") {
            return Err(format!("Error: Output file path must end with .csv: {}", output).into());
        }
    }

    if args.metrics.trim().is_empty() {
        return Err("Error: Metrics list cannot be empty".into());
    }

    Ok(())
}

/// Validate compare command arguments
fn validate_compare_args(args: &CompareArgs) -> Result<(), Box<dyn Error>> {
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

    if args.metric.trim().is_empty() {
        return Err("Error: Metric name cannot be empty".into());
    }

    if args.alpha <= 0.0 || args.alpha >= 1.0 {
        return Err(format!(
            "Error: Alpha must be between 0.0 and 1.0, current: {}",
            args.alpha
        )
        .into());
    }

    Ok(())
}

/// Validate plot command arguments
fn validate_plot_args(args: &PlotArgs) -> Result<(), Box<dyn Error>> {
    if args.input.trim().is_empty() {
        return Err("Error: Input file path cannot be empty".into());
    }
    if !Path::new(&args.input).exists() {
        return Err(format!("Error: Input file does not exist: {}", args.input).into());
    }
    if !args.input.ends_with(".csv") {
        return Err(format!("Error: Input file path must end with .csv: {}", args.input).into());
    }

    if args.outdir.trim().is_empty() {
        return Err("Error: Output directory cannot be empty".into());
    }

    if args.metrics.trim().is_empty() {
        return Err("Error: Metrics list cannot be empty".into());
    }

    if let Some(localization) = &args.localization {
        if !Path::new(localization).exists() {
            return Err(format!(
                "Error: Localization file does not exist: {}",
                localization
            )
            .into());
        }
        if !localization.ends_with(".json") {
            return Err(format!(
                "Error: Localization file path must end with .json: {}",
                localization
            )
            .into());
        }
    }

    Ok(())
}

fn parse_test_name(name: &str) -> Result<compare::StatisticalTest, Box<dyn Error>> {
    match name.to_lowercase().as_str() {
        "wilcoxon" => Ok(compare::StatisticalTest::WilcoxonSignedRank),
        "t-test" | "ttest" => Ok(compare::StatisticalTest::TTest),
        "mann-whitney" | "mannwhitney" => Ok(compare::StatisticalTest::MannWhitneyU),
        _ => Err(format!(
            "Error: Unknown statistical test: {}. Supported tests: wilcoxon, t-test, mann-whitney",
            name
        )
        .into()),
    }
}

fn split_metrics(metrics: &str) -> Result<Vec<String>, Box<dyn Error>> {
    let list: Vec<String> = metrics
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if list.is_empty() {
        return Err("Error: Metrics list cannot be empty".into());
    }
    Ok(list)
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Score(args) => {
            // Set up log file
            let log_file = if let Some(log_path) = &args.log {
                std::fs::File::create(log_path)?
            } else {
                std::fs::File::create("score.log")?
            };
            let mut logger = Logger::new(log_file);
            score::run_score(&args, &mut logger)
        }
        Commands::Report(args) => {
            validate_report_args(&args)?;
            let metrics = split_metrics(&args.metrics)?;

            let log_file = if let Some(log_path) = &args.log {
                std::fs::File::create(log_path)?
            } else {
                std::fs::File::create("report.log")?
            };
            let mut logger = Logger::new(log_file);
            report::report_metrics(&args.input, args.output.as_deref(), &metrics, &mut logger)
        }
        Commands::Compare(args) => {
            validate_compare_args(&args)?;
            let test_type = parse_test_name(&args.test)?;

            let log_file = if let Some(log_path) = &args.log {
                std::fs::File::create(log_path)?
            } else {
                std::fs::File::create("compare.log")?
            };
            let mut logger = Logger::new(log_file);
            compare::compare_methods(
                &args.input,
                &args.output,
                &args.metric,
                test_type,
                args.alpha,
                &mut logger,
            )
        }
        Commands::Plot(args) => {
            validate_plot_args(&args)?;
            let metrics = split_metrics(&args.metrics)?;

            // Create output directory
            std::fs::create_dir_all(&args.outdir)?;

            let log_file = if let Some(log_path) = &args.log {
                std::fs::File::create(log_path)?
            } else {
                std::fs::File::create(format!("{}/plot.log", args.outdir))?
            };
            let mut logger = Logger::new(log_file);
            plot::plot_metrics(
                &args.input,
                &args.outdir,
                &metrics,
                args.localization.as_deref(),
                &mut logger,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_map_to_tests() {
        assert_eq!(
            parse_test_name("wilcoxon").unwrap(),
            compare::StatisticalTest::WilcoxonSignedRank
        );
        assert_eq!(
            parse_test_name("T-Test").unwrap(),
            compare::StatisticalTest::TTest
        );
        assert_eq!(
            parse_test_name("mann-whitney").unwrap(),
            compare::StatisticalTest::MannWhitneyU
        );
        assert!(parse_test_name("anova")
            .unwrap_err()
            .to_string()
            .contains("Supported tests"));
    }

    #[test]
    fn metrics_lists_split_and_reject_empty() {
        assert_eq!(split_metrics("rf").unwrap(), vec!["rf"]);
        let list = split_metrics(" rf , sd ,qscore").unwrap();
        assert_eq!(list, vec!["rf", "sd", "qscore"]);
        assert!(split_metrics(",,").is_err());
    }

    #[test]
    fn compare_alpha_must_be_a_probability() {
        let input = std::env::temp_dir().join("treebench_main_alpha.csv");
        std::fs::write(&input, "condition,k,method,rf\n").unwrap();
        let args = CompareArgs {
            input: input.to_str().unwrap().to_string(),
            output: "out.csv".to_string(),
            metric: "rf".to_string(),
            test: "wilcoxon".to_string(),
            alpha: 1.5,
            log: None,
        };
        let err = validate_compare_args(&args).unwrap_err();
        assert!(err.to_string().contains("Alpha must be between"));
    }
}
