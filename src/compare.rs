use std::collections::BTreeMap;
use std::error::Error;
use std::fs::File;
use std::io::Write;
use std::time::Instant;

use crate::error::TreebenchError;
use crate::records::ScoredTable;

/// Statistical test type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticalTest {
    /// Paired Wilcoxon signed-rank test
    WilcoxonSignedRank,
    /// Pooled two-sample t-test
    TTest,
    /// Mann-Whitney U test
    MannWhitneyU,
}

fn test_label(test: StatisticalTest) -> &'static str {
    match test {
        StatisticalTest::WilcoxonSignedRank => "wilcoxon",
        StatisticalTest::TTest => "t-test",
        StatisticalTest::MannWhitneyU => "mann-whitney",
    }
}

/// Statistical result structure
#[derive(Debug, Clone)]
pub struct StatisticalResult {
    pub test_type: StatisticalTest,
    pub statistic: f64,
    pub p_value: f64,
    pub significant: bool,
    pub effect_size: Option<f64>,
}

fn perform_statistical_test(
    group1: &[f64],
    group2: &[f64],
    test_type: StatisticalTest,
    alpha: f64,
) -> StatisticalResult {
    match test_type {
        StatisticalTest::WilcoxonSignedRank => perform_wilcoxon_test(group1, group2, alpha),
        StatisticalTest::TTest => perform_t_test(group1, group2, alpha),
        StatisticalTest::MannWhitneyU => perform_mann_whitney_u_test(group1, group2, alpha),
    }
}

fn perform_t_test(group1: &[f64], group2: &[f64], alpha: f64) -> StatisticalResult {
    if group1.len() < 2 || group2.len() < 2 {
        return StatisticalResult {
            test_type: StatisticalTest::TTest,
            statistic: 0.0,
            p_value: 1.0,
            significant: false,
            effect_size: None,
        };
    }

    let n1 = group1.len() as f64;
    let n2 = group2.len() as f64;

    let mean1 = group1.iter().sum::<f64>() / n1;
    let mean2 = group2.iter().sum::<f64>() / n2;

    let var1 = group1.iter().map(|x| (x - mean1).powi(2)).sum::<f64>() / (n1 - 1.0);
    let var2 = group2.iter().map(|x| (x - mean2).powi(2)).sum::<f64>() / (n2 - 1.0);

    let pooled_var = ((n1 - 1.0) * var1 + (n2 - 1.0) * var2) / (n1 + n2 - 2.0);
    let se = (pooled_var * (1.0 / n1 + 1.0 / n2)).sqrt();

    let t_stat = (mean1 - mean2) / se;

    // Normal approximation of the p-value
    let p_value = 2.0 * (1.0 - normal_cdf(t_stat.abs()));

    let effect_size = (mean1 - mean2) / pooled_var.sqrt();

    StatisticalResult {
        test_type: StatisticalTest::TTest,
        statistic: t_stat,
        p_value,
        significant: p_value < alpha,
        effect_size: Some(effect_size),
    }
}

fn perform_mann_whitney_u_test(group1: &[f64], group2: &[f64], alpha: f64) -> StatisticalResult {
    if group1.is_empty() || group2.is_empty() {
        return StatisticalResult {
            test_type: StatisticalTest::MannWhitneyU,
            statistic: 0.0,
            p_value: 1.0,
            significant: false,
            effect_size: None,
        };
    }

    // Pool both groups and rank them together
    let mut all_data = Vec::new();
    for (i, &val) in group1.iter().enumerate() {
        all_data.push((val, 1, i));
    }
    for (i, &val) in group2.iter().enumerate() {
        all_data.push((val, 2, i));
    }
    all_data.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

    // Tie-averaged ranks
    let mut ranks = vec![0.0; all_data.len()];
    let mut current_rank = 1.0;
    let mut i = 0;

    while i < all_data.len() {
        let mut j = i;
        while j < all_data.len() && all_data[j].0 == all_data[i].0 {
            j += 1;
        }

        // Average of the 1-based ranks current_rank..=j spanned by the tie
        let avg_rank = (current_rank + j as f64) / 2.0;
        for k in i..j {
            ranks[k] = avg_rank;
        }

        current_rank = j as f64 + 1.0;
        i = j;
    }

    let mut u1 = 0.0;
    let mut u2 = 0.0;

    for (i, (_, group, _)) in all_data.iter().enumerate() {
        if *group == 1 {
            u1 += ranks[i];
        } else {
            u2 += ranks[i];
        }
    }

    let n1 = group1.len() as f64;
    let n2 = group2.len() as f64;

    u1 = n1 * n2 + n1 * (n1 + 1.0) / 2.0 - u1;
    u2 = n1 * n2 + n2 * (n2 + 1.0) / 2.0 - u2;

    let u_stat = u1.min(u2);

    let expected_u = n1 * n2 / 2.0;
    let var_u = n1 * n2 * (n1 + n2 + 1.0) / 12.0;
    let se_u = var_u.sqrt();

    let z_stat = (u_stat - expected_u) / se_u;
    let p_value = 2.0 * (1.0 - normal_cdf(z_stat.abs()));

    let effect_size = (u_stat - expected_u) / (n1 * n2);

    StatisticalResult {
        test_type: StatisticalTest::MannWhitneyU,
        statistic: u_stat,
        p_value,
        significant: p_value < alpha,
        effect_size: Some(effect_size),
    }
}

fn perform_wilcoxon_test(group1: &[f64], group2: &[f64], alpha: f64) -> StatisticalResult {
    if group1.len() != group2.len() || group1.is_empty() {
        return StatisticalResult {
            test_type: StatisticalTest::WilcoxonSignedRank,
            statistic: 0.0,
            p_value: 1.0,
            significant: false,
            effect_size: None,
        };
    }

    let mut differences: Vec<f64> = group1.iter().zip(group2.iter()).map(|(a, b)| a - b).collect();

    // Zero differences carry no rank
    differences.retain(|&x| x != 0.0);

    if differences.is_empty() {
        return StatisticalResult {
            test_type: StatisticalTest::WilcoxonSignedRank,
            statistic: 0.0,
            p_value: 1.0,
            significant: false,
            effect_size: None,
        };
    }

    // Tie-averaged ranks of the absolute differences
    let mut abs_diffs: Vec<(f64, usize)> = differences.iter().map(|&x| x.abs()).enumerate().map(|(i, x)| (x, i)).collect();
    abs_diffs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

    let mut ranks = vec![0.0; abs_diffs.len()];
    let mut current_rank = 1.0;
    let mut i = 0;

    while i < abs_diffs.len() {
        let mut j = i;
        while j < abs_diffs.len() && abs_diffs[j].0 == abs_diffs[i].0 {
            j += 1;
        }

        // Average of the 1-based ranks current_rank..=j spanned by the tie
        let avg_rank = (current_rank + j as f64) / 2.0;
        for k in i..j {
            ranks[k] = avg_rank;
        }

        current_rank = j as f64 + 1.0;
        i = j;
    }

    // Ranks are ordered by |difference|; map them back to the sign
    let mut w_plus = 0.0;
    let mut w_minus = 0.0;

    for (rank_pos, &(_, orig)) in abs_diffs.iter().enumerate() {
        if differences[orig] > 0.0 {
            w_plus += ranks[rank_pos];
        } else {
            w_minus += ranks[rank_pos];
        }
    }

    let w_stat = w_plus.min(w_minus);
    let n = differences.len() as f64;

    let expected_w = n * (n + 1.0) / 4.0;
    let var_w = n * (n + 1.0) * (2.0 * n + 1.0) / 24.0;
    let se_w = var_w.sqrt();

    let z_stat = (w_stat - expected_w) / se_w;
    let p_value = 2.0 * (1.0 - normal_cdf(z_stat.abs()));

    let effect_size = (w_stat - expected_w) / (n * (n + 1.0) / 2.0);

    StatisticalResult {
        test_type: StatisticalTest::WilcoxonSignedRank,
        statistic: w_stat,
        p_value,
        significant: p_value < alpha,
        effect_size: Some(effect_size),
    }
}

/// Normal CDF via the Abramowitz-Stegun erf approximation
fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / 2.0_f64.sqrt()))
}

fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}

/// Samples of one method within one condition, ordered by (k, manifest row).
/// The ordering is the pairing contract for every test, not just Wilcoxon.
fn method_samples(
    table: &ScoredTable,
    column: usize,
) -> Result<BTreeMap<String, BTreeMap<String, Vec<f64>>>, TreebenchError> {
    let mut keyed: BTreeMap<String, BTreeMap<String, Vec<(u32, usize, f64)>>> = BTreeMap::new();
    for row in &table.rows {
        let value = table.value(row, column)?;
        keyed
            .entry(row.condition.clone())
            .or_default()
            .entry(row.method.clone())
            .or_default()
            .push((row.k, row.line, value));
    }
    let mut out = BTreeMap::new();
    for (condition, methods) in keyed {
        let mut sorted_methods = BTreeMap::new();
        for (method, mut samples) in methods {
            samples.sort_by_key(|&(k, line, _)| (k, line));
            sorted_methods.insert(method, samples.into_iter().map(|(_, _, v)| v).collect());
        }
        out.insert(condition, sorted_methods);
    }
    Ok(out)
}

pub fn compare_methods(
    input_file: &str,
    output_file: &str,
    metric: &str,
    test_type: StatisticalTest,
    alpha: f64,
    logger: &mut crate::Logger,
) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();

    logger.log("=== Treebench Method Comparison ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!(
        "Runtime: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    ))?;
    logger.log(&format!("Input File: {}", input_file))?;
    logger.log(&format!("Output File: {}", output_file))?;
    logger.log(&format!("Metric: {}", metric))?;
    logger.log(&format!("Statistical Test: {:?}", test_type))?;
    logger.log(&format!("Alpha: {}", alpha))?;

    println!("[Loading data]");
    println!("    Input: {}", input_file);
    println!();

    println!("[Params]");
    println!("    Metric: {}. Statistical test: {:?}. Alpha: {}.", metric, test_type, alpha);
    println!();

    let table = ScoredTable::load(input_file)?;
    if table.rows.is_empty() {
        return Err(format!("Error: {} contains no data rows", input_file).into());
    }
    let column = table.metric_column(metric)?;
    let grouped = method_samples(&table, column)?;

    let n_methods: usize = grouped.values().map(|m| m.len()).sum();
    println!("[Data info]");
    println!("    rows: {}. conditions: {}. method groups: {}.", table.rows.len(), grouped.len(), n_methods);
    println!();

    let mut output = File::create(output_file)?;
    writeln!(output, "condition,metric,method_a,method_b,n,test,statistic,p_value,significant,effect_size")?;

    let mut tested_pairs = 0;
    let mut significant_pairs = 0;
    let mut dropped_pairs = 0;

    for (condition, methods) in &grouped {
        let names: Vec<&String> = methods.keys().collect();
        for ai in 0..names.len() {
            for bi in ai + 1..names.len() {
                let a = &methods[names[ai]];
                let b = &methods[names[bi]];
                if a.len() != b.len() {
                    return Err(Box::new(TreebenchError::SampleCountMismatch {
                        condition: condition.clone(),
                        method_a: names[ai].clone(),
                        n_a: a.len(),
                        method_b: names[bi].clone(),
                        n_b: b.len(),
                    }));
                }
                // Drop pairs with a missing value on either side
                let mut paired_a = Vec::new();
                let mut paired_b = Vec::new();
                for (&x, &y) in a.iter().zip(b.iter()) {
                    if x.is_nan() || y.is_nan() {
                        dropped_pairs += 1;
                    } else {
                        paired_a.push(x);
                        paired_b.push(y);
                    }
                }

                let result = perform_statistical_test(&paired_a, &paired_b, test_type, alpha);
                tested_pairs += 1;
                if result.significant {
                    significant_pairs += 1;
                }

                writeln!(
                    output,
                    "{},{},{},{},{},{},{:.6},{:.6},{},{:.3}",
                    condition,
                    metric,
                    names[ai],
                    names[bi],
                    paired_a.len(),
                    test_label(test_type),
                    result.statistic,
                    result.p_value,
                    if result.significant { "TRUE" } else { "FALSE" },
                    result.effect_size.unwrap_or(0.0)
                )?;
            }
        }
    }

    let elapsed = start_time.elapsed();

    println!("[Output]");
    println!("    Comparison: {}", output_file);
    println!("    Tested method pairs: {}. Significant: {}.", tested_pairs, significant_pairs);
    if dropped_pairs > 0 {
        println!("    Dropped {} sample pairs with missing values.", dropped_pairs);
    }
    println!("{}", crate::progress::format_time_used(elapsed));

    logger.log("Method comparison completed")?;
    logger.log(&format!("Tested pairs: {}", tested_pairs))?;
    logger.log(&format!("Significant pairs: {}", significant_pairs))?;
    logger.log(&format!("Dropped sample pairs: {}", dropped_pairs))?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}
