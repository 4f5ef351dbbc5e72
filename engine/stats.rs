// ========================================================================================
//                          2x2 Significance and Performance
// ========================================================================================

use crate::types::{Interaction, Variate};
use ndarray::ArrayView1;
use ndarray::Zip;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Counts of a predictor against a response. Positions where either is missing are
/// not counted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContingencyTable {
    pub true_pos: u64,
    pub false_pos: u64,
    pub false_neg: u64,
    pub true_neg: u64,
}

impl ContingencyTable {
    pub fn new(true_pos: u64, false_pos: u64, false_neg: u64, true_neg: u64) -> Self {
        Self {
            true_pos,
            false_pos,
            false_neg,
            true_neg,
        }
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.true_pos + self.false_pos + self.false_neg + self.true_neg
    }

    /// Positions where the response is one.
    #[inline]
    pub fn cases(&self) -> u64 {
        self.true_pos + self.false_neg
    }

    /// The table read with the predictor negated.
    pub fn inverted(&self) -> Self {
        Self {
            true_pos: self.false_neg,
            false_pos: self.true_neg,
            false_neg: self.true_pos,
            true_neg: self.false_pos,
        }
    }

    pub fn merge(&mut self, other: &ContingencyTable) {
        self.true_pos += other.true_pos;
        self.false_pos += other.false_pos;
        self.false_neg += other.false_neg;
        self.true_neg += other.true_neg;
    }
}

pub fn contingency_table(
    predictor: ArrayView1<'_, Variate>,
    response: ArrayView1<'_, Variate>,
) -> ContingencyTable {
    let mut table = ContingencyTable::default();
    Zip::from(&predictor)
        .and(&response)
        .for_each(|&p, &r| match (p.as_bool(), r.as_bool()) {
            (Some(true), Some(true)) => table.true_pos += 1,
            (Some(true), Some(false)) => table.false_pos += 1,
            (Some(false), Some(true)) => table.false_neg += 1,
            (Some(false), Some(false)) => table.true_neg += 1,
            _ => {}
        });
    table
}

/// `ln(k!)` for every `k` up to a fixed bound, built once per search.
#[derive(Clone, Debug)]
pub struct LogFactorials {
    table: Vec<f64>,
}

impl LogFactorials {
    pub fn new(max: usize) -> Self {
        let mut table = Vec::with_capacity(max + 1);
        table.push(0.0);
        let mut acc = 0.0;
        for k in 1..=max {
            acc += (k as f64).ln();
            table.push(acc);
        }
        Self { table }
    }

    pub fn max(&self) -> usize {
        self.table.len() - 1
    }

    #[inline]
    fn ln_choose(&self, n: u64, k: u64) -> f64 {
        let (n, k) = (n as usize, k as usize);
        self.table[n] - self.table[k] - self.table[n - k]
    }
}

/// Result of Fisher's exact test on a 2x2 table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FisherTest {
    pub p_value: f64,
    /// Probability of a count of true positives at most the observed one.
    pub left_tail: f64,
    /// Probability of a count of true positives at least the observed one.
    pub right_tail: f64,
}

/// Fisher's exact test with margins fixed. The two-tailed p-value sums every table at
/// most as likely as the observed one.
///
/// A table whose total exceeds the range of `factorials` is tested against a
/// temporary table sized to fit it.
pub fn fisher_exact(table: &ContingencyTable, factorials: &LogFactorials) -> FisherTest {
    let n = table.total();
    let grown;
    let factorials = if n as usize > factorials.max() {
        log::debug!(
            "Table total {n} exceeds the log-factorial table ({}); building a larger one",
            factorials.max()
        );
        grown = LogFactorials::new(n as usize);
        &grown
    } else {
        factorials
    };

    let row = table.true_pos + table.false_pos;
    let col = table.true_pos + table.false_neg;
    let observed = table.true_pos;
    let lo = (row + col).saturating_sub(n);
    let hi = row.min(col);

    let ln_denominator = factorials.ln_choose(n, row);
    let pmf = |x: u64| {
        (factorials.ln_choose(col, x) + factorials.ln_choose(n - col, row - x) - ln_denominator)
            .exp()
    };

    let observed_p = pmf(observed);
    let cutoff = observed_p * (1.0 + 1e-7);
    let mut left_tail = 0.0;
    let mut right_tail = 0.0;
    let mut two_tail = 0.0;
    for x in lo..=hi {
        let p = pmf(x);
        if x <= observed {
            left_tail += p;
        }
        if x >= observed {
            right_tail += p;
        }
        if p <= cutoff {
            two_tail += p;
        }
    }

    FisherTest {
        p_value: f64::min(two_tail, 1.0),
        left_tail: f64::min(left_tail, 1.0),
        right_tail: f64::min(right_tail, 1.0),
    }
}

/// Negative association when the lower tail is the more extreme one.
pub fn interaction(test: &FisherTest) -> Interaction {
    if test.left_tail < test.right_tail {
        Interaction::MutuallyExclusive
    } else {
        Interaction::CoOccurring
    }
}

#[inline]
fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Diagnostic performance of a predictor. For a mutually exclusive predictor every
/// metric is read off the table with the predictor negated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub sensitivity: f64,
    pub specificity: f64,
    pub ppv: f64,
    pub npv: f64,
    pub accuracy: f64,
    pub mcc: f64,
}

impl Performance {
    pub fn new(table: &ContingencyTable, interaction: Interaction) -> Self {
        let t = match interaction {
            Interaction::CoOccurring => *table,
            Interaction::MutuallyExclusive => table.inverted(),
        };
        let (tp, fp, fn_, tn) = (
            t.true_pos as f64,
            t.false_pos as f64,
            t.false_neg as f64,
            t.true_neg as f64,
        );

        let mcc_denominator = ((tp + fp) * (tp + fn_) * (tn + fp) * (tn + fn_)).sqrt();
        Self {
            sensitivity: ratio(tp, tp + fn_),
            specificity: ratio(tn, tn + fp),
            ppv: ratio(tp, tp + fp),
            npv: ratio(tn, tn + fn_),
            accuracy: ratio(tp + tn, tp + fp + fn_ + tn),
            mcc: ratio(tp * tn - fp * fn_, mcc_denominator),
        }
    }

    pub fn balanced_accuracy(&self) -> f64 {
        (self.sensitivity + self.specificity) / 2.0
    }

    pub fn mean_predictive_value(&self) -> f64 {
        (self.ppv + self.npv) / 2.0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectSize {
    pub odds_ratio: f64,
    pub difference_of_proportions: f64,
}

impl EffectSize {
    /// Any zero among the divisors yields an odds ratio of zero, including the
    /// saturated case of a perfect predictor.
    pub fn new(table: &ContingencyTable, interaction: Interaction) -> Self {
        let (a, b, c, d) = (
            table.true_pos as f64,
            table.false_pos as f64,
            table.false_neg as f64,
            table.true_neg as f64,
        );
        let odds_ratio = match interaction {
            Interaction::CoOccurring if b != 0.0 && c != 0.0 && d != 0.0 => (a / b) / (c / d),
            Interaction::MutuallyExclusive if a != 0.0 && b != 0.0 && d != 0.0 => {
                (c / d) / (a / b)
            }
            _ => 0.0,
        };
        let difference_of_proportions = if a + b == 0.0 || c + d == 0.0 {
            0.0
        } else {
            (a / (a + b) - c / (c + d)).abs()
        };
        Self {
            odds_ratio,
            difference_of_proportions,
        }
    }
}

/// Confidence levels with a tabulated normal quantile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConfidenceLevel {
    Ninety,
    #[default]
    NinetyFive,
    NinetyNine,
}

impl ConfidenceLevel {
    pub fn z(self) -> f64 {
        match self {
            Self::Ninety => 1.64,
            Self::NinetyFive => 1.96,
            Self::NinetyNine => 2.58,
        }
    }
}

impl FromStr for ConfidenceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_end_matches('%') {
            "0.90" | "0.9" | "90" => Ok(Self::Ninety),
            "0.95" | "95" => Ok(Self::NinetyFive),
            "0.99" | "99" => Ok(Self::NinetyNine),
            other => Err(format!(
                "unsupported confidence level '{other}'; choose 0.90, 0.95, or 0.99"
            )),
        }
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ninety => "0.90",
            Self::NinetyFive => "0.95",
            Self::NinetyNine => "0.99",
        })
    }
}

impl TryFrom<String> for ConfidenceLevel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConfidenceLevel> for String {
    fn from(value: ConfidenceLevel) -> Self {
        value.to_string()
    }
}

/// Normal-approximation interval around a proportion. With no samples the interval
/// collapses to the point estimate.
pub fn confidence_interval(probability: f64, sample_size: u64, level: ConfidenceLevel) -> (f64, f64) {
    if sample_size == 0 {
        return (probability, probability);
    }
    let standard_error = (probability * (1.0 - probability) / sample_size as f64).sqrt();
    let half_width = level.z() * standard_error;
    (probability - half_width, probability + half_width)
}

/// Everything computed for one predictor against one response.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    pub table: ContingencyTable,
    pub test: FisherTest,
    pub interaction: Interaction,
    pub performance: Performance,
    pub effect_size: EffectSize,
}

impl Evaluation {
    pub fn sample_count(&self) -> u64 {
        self.table.total()
    }

    pub fn case_count(&self) -> u64 {
        self.table.cases()
    }
}

pub fn evaluate(
    predictor: ArrayView1<'_, Variate>,
    response: ArrayView1<'_, Variate>,
    factorials: &LogFactorials,
) -> Evaluation {
    let table = contingency_table(predictor, response);
    let test = fisher_exact(&table, factorials);
    finish(table, test, interaction(&test))
}

/// Like [`evaluate`] but reads performance and effect size in a given direction
/// instead of the direction the test favours.
pub fn evaluate_with_interaction(
    predictor: ArrayView1<'_, Variate>,
    response: ArrayView1<'_, Variate>,
    factorials: &LogFactorials,
    interaction: Interaction,
) -> Evaluation {
    let table = contingency_table(predictor, response);
    let test = fisher_exact(&table, factorials);
    finish(table, test, interaction)
}

fn finish(table: ContingencyTable, test: FisherTest, interaction: Interaction) -> Evaluation {
    Evaluation {
        table,
        test,
        interaction,
        performance: Performance::new(&table, interaction),
        effect_size: EffectSize::new(&table, interaction),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    fn vector(bits: &[i8]) -> Array1<Variate> {
        bits.iter().map(|&b| Variate::try_from(b).unwrap()).collect()
    }

    #[test]
    fn contingency_skips_missing_positions() {
        let predictor = vector(&[1, 1, 0, 0, -1, 1]);
        let response = vector(&[1, 0, 1, 0, 1, -1]);
        let table = contingency_table(predictor.view(), response.view());
        assert_eq!(table, ContingencyTable::new(1, 1, 1, 1));
        assert_eq!(table.total(), 4);
        assert_eq!(table.cases(), 2);
    }

    #[test]
    fn sensitivity_and_specificity_use_canonical_order() {
        // 8 true positives, 2 false positives, 4 false negatives, 6 true negatives.
        let table = ContingencyTable::new(8, 2, 4, 6);
        let perf = Performance::new(&table, Interaction::CoOccurring);
        assert_abs_diff_eq!(perf.sensitivity, 8.0 / 12.0, epsilon = 1e-12);
        assert_abs_diff_eq!(perf.specificity, 6.0 / 8.0, epsilon = 1e-12);
        assert_abs_diff_eq!(perf.ppv, 8.0 / 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(perf.npv, 6.0 / 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(perf.accuracy, 14.0 / 20.0, epsilon = 1e-12);
    }

    #[test]
    fn mutually_exclusive_reads_metrics_in_reverse() {
        let table = ContingencyTable::new(8, 2, 4, 6);
        let forward = Performance::new(&table, Interaction::CoOccurring);
        let reverse = Performance::new(&table, Interaction::MutuallyExclusive);
        assert_abs_diff_eq!(reverse.sensitivity, 1.0 - forward.sensitivity, epsilon = 1e-12);
        assert_abs_diff_eq!(reverse.specificity, 1.0 - forward.specificity, epsilon = 1e-12);
        assert_abs_diff_eq!(reverse.accuracy, 1.0 - forward.accuracy, epsilon = 1e-12);
        assert_abs_diff_eq!(reverse.mcc, -forward.mcc, epsilon = 1e-12);
    }

    #[test]
    fn degenerate_tables_give_zero_metrics() {
        let empty = ContingencyTable::default();
        let perf = Performance::new(&empty, Interaction::CoOccurring);
        assert_eq!(perf, Performance::default());
        let effect = EffectSize::new(&empty, Interaction::CoOccurring);
        assert_eq!(effect, EffectSize::default());

        let test = fisher_exact(&empty, &LogFactorials::new(0));
        assert_abs_diff_eq!(test.p_value, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn fisher_matches_reference_values() {
        let factorials = LogFactorials::new(50);

        // R: fisher.test(matrix(c(3, 1, 1, 3), 2))$p.value = 0.4857143
        let test = fisher_exact(&ContingencyTable::new(3, 1, 1, 3), &factorials);
        assert_abs_diff_eq!(test.p_value, 0.4857142857, epsilon = 1e-9);
        assert_eq!(interaction(&test), Interaction::CoOccurring);

        // R: fisher.test(matrix(c(1, 9, 11, 3), 2))$p.value = 0.002759456
        let test = fisher_exact(&ContingencyTable::new(1, 11, 9, 3), &factorials);
        assert_abs_diff_eq!(test.p_value, 0.002759456, epsilon = 1e-8);
        assert_eq!(interaction(&test), Interaction::MutuallyExclusive);
        assert!(test.left_tail < 0.01);
        assert!(test.right_tail > 0.99);
    }

    #[test]
    fn undersized_factorials_grow_to_fit_the_table() {
        let table = ContingencyTable::new(1, 11, 9, 3);
        let small = fisher_exact(&table, &LogFactorials::new(5));
        let sized = fisher_exact(&table, &LogFactorials::new(24));
        assert_eq!(small, sized);
        assert_abs_diff_eq!(small.p_value, 0.002759456, epsilon = 1e-8);
    }

    #[test]
    fn odds_ratio_direction_follows_interaction() {
        let table = ContingencyTable::new(6, 2, 3, 9);
        let co = EffectSize::new(&table, Interaction::CoOccurring);
        assert_abs_diff_eq!(co.odds_ratio, (6.0 / 2.0) / (3.0 / 9.0), epsilon = 1e-12);
        let me = EffectSize::new(&table, Interaction::MutuallyExclusive);
        assert_abs_diff_eq!(me.odds_ratio, (3.0 / 9.0) / (6.0 / 2.0), epsilon = 1e-12);
        assert_abs_diff_eq!(
            co.difference_of_proportions,
            (6.0 / 8.0 - 3.0 / 12.0_f64).abs(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn perfect_predictor_saturates() {
        let phenotype: Vec<i8> = (0..20).map(|i| i8::from(i < 10)).collect();
        let predictor = vector(&phenotype);
        let response = vector(&phenotype);
        let result = evaluate(predictor.view(), response.view(), &LogFactorials::new(20));

        assert_eq!(result.table, ContingencyTable::new(10, 0, 0, 10));
        assert_eq!(result.interaction, Interaction::CoOccurring);
        assert_abs_diff_eq!(result.performance.sensitivity, 1.0);
        assert_abs_diff_eq!(result.performance.specificity, 1.0);
        assert_abs_diff_eq!(result.performance.mcc, 1.0, epsilon = 1e-12);
        assert!(result.test.p_value < 1e-4);
        assert_eq!(result.effect_size.odds_ratio, 0.0);
        assert_eq!(result.sample_count(), 20);
        assert_eq!(result.case_count(), 10);
    }

    #[test]
    fn confidence_interval_uses_tabulated_quantiles() {
        let (lo, hi) = confidence_interval(0.5, 100, ConfidenceLevel::NinetyFive);
        assert_abs_diff_eq!(lo, 0.5 - 1.96 * 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(hi, 0.5 + 1.96 * 0.05, epsilon = 1e-12);
        assert_eq!(confidence_interval(0.3, 0, ConfidenceLevel::Ninety), (0.3, 0.3));
        assert_eq!("99".parse::<ConfidenceLevel>().unwrap(), ConfidenceLevel::NinetyNine);
        assert!("0.5".parse::<ConfidenceLevel>().is_err());
    }
}
