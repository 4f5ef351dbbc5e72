//! Multiple-testing correction.
//!
//! Each method is the sorted-rank closed form used by R's `p.adjust`, applied to a map
//! from hypothesis identifier to raw p-value. Output is keyed by the same identifiers,
//! so hypotheses that happen to share a p-value stay distinct.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Tuning parameter of the Storey estimate of the null proportion.
const STOREY_LAMBDA: f64 = 0.5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CorrectionMethod {
    /// Benjamini-Hochberg false discovery rate.
    #[default]
    BenjaminiHochberg,
    /// Benjamini-Yekutieli, valid under arbitrary dependence.
    BenjaminiYekutieli,
    Bonferroni,
    Holm,
    Hochberg,
    Hommel,
    /// Storey-Tibshirani q-values with a single-lambda null proportion.
    QValue,
    None,
}

impl FromStr for CorrectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "bh" | "fdr" | "benjaminihochberg" => Ok(Self::BenjaminiHochberg),
            "by" | "benjaminiyekutieli" => Ok(Self::BenjaminiYekutieli),
            "bonferroni" => Ok(Self::Bonferroni),
            "holm" => Ok(Self::Holm),
            "hochberg" => Ok(Self::Hochberg),
            "hommel" => Ok(Self::Hommel),
            "qvalue" | "storey" => Ok(Self::QValue),
            "none" => Ok(Self::None),
            _ => Err(format!(
                "unknown correction method '{s}'; expected one of BH, BY, bonferroni, holm, hochberg, hommel, qvalue, none"
            )),
        }
    }
}

impl fmt::Display for CorrectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BenjaminiHochberg => "BH",
            Self::BenjaminiYekutieli => "BY",
            Self::Bonferroni => "bonferroni",
            Self::Holm => "holm",
            Self::Hochberg => "hochberg",
            Self::Hommel => "hommel",
            Self::QValue => "qvalue",
            Self::None => "none",
        })
    }
}

impl TryFrom<String> for CorrectionMethod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CorrectionMethod> for String {
    fn from(value: CorrectionMethod) -> Self {
        value.to_string()
    }
}

/// Adjusts every p-value in `p_values` with `method`.
pub fn adjust<K: Ord + Clone>(
    p_values: &BTreeMap<K, f64>,
    method: CorrectionMethod,
) -> BTreeMap<K, f64> {
    let mut ordered: Vec<(&K, f64)> = p_values.iter().map(|(k, &p)| (k, p)).collect();
    ordered.sort_by(|a, b| a.1.total_cmp(&b.1));
    let sorted: Vec<f64> = ordered.iter().map(|&(_, p)| p).collect();

    let adjusted = adjust_sorted(&sorted, method);
    ordered
        .into_iter()
        .zip(adjusted)
        .map(|((k, _), q)| (k.clone(), q))
        .collect()
}

/// Adjusts p-values already sorted in ascending order; output is in the same order.
pub fn adjust_sorted(p: &[f64], method: CorrectionMethod) -> Vec<f64> {
    let n = p.len();
    if n <= 1 || method == CorrectionMethod::None {
        return p.to_vec();
    }
    let nf = n as f64;

    match method {
        CorrectionMethod::BenjaminiHochberg => step_up(p, |i| nf / i as f64),
        CorrectionMethod::BenjaminiYekutieli => {
            let harmonic: f64 = (1..=n).map(|i| 1.0 / i as f64).sum();
            step_up(p, |i| harmonic * nf / i as f64)
        }
        CorrectionMethod::Bonferroni => p.iter().map(|&x| (nf * x).min(1.0)).collect(),
        CorrectionMethod::Holm => {
            let mut running = 0.0_f64;
            p.iter()
                .enumerate()
                .map(|(idx, &x)| {
                    running = running.max((n - idx) as f64 * x);
                    running.min(1.0)
                })
                .collect()
        }
        CorrectionMethod::Hochberg => step_up(p, |i| (n - i + 1) as f64),
        CorrectionMethod::Hommel if n == 2 => step_up(p, |i| (n - i + 1) as f64),
        CorrectionMethod::Hommel => hommel(p),
        CorrectionMethod::QValue => {
            let above = p.iter().filter(|&&x| x > STOREY_LAMBDA).count().max(1);
            let pi0 = (above as f64 / (nf * (1.0 - STOREY_LAMBDA))).min(1.0);
            let mut running = f64::INFINITY;
            let mut q = vec![0.0; n];
            for idx in (0..n).rev() {
                running = running.min(pi0 * nf / (idx + 1) as f64 * p[idx]);
                q[idx] = running.min(1.0);
            }
            q
        }
        CorrectionMethod::None => p.to_vec(),
    }
}

/// Walks from the largest p-value down, keeping the running minimum of
/// `factor(rank) * p` where `rank` is the one-based ascending rank.
fn step_up(p: &[f64], factor: impl Fn(usize) -> f64) -> Vec<f64> {
    let mut out = vec![0.0; p.len()];
    let mut running = f64::INFINITY;
    for idx in (0..p.len()).rev() {
        running = running.min(factor(idx + 1) * p[idx]);
        out[idx] = running.min(1.0);
    }
    out
}

fn hommel(p: &[f64]) -> Vec<f64> {
    let n = p.len();
    let initial = p
        .iter()
        .enumerate()
        .map(|(idx, &x)| n as f64 * x / (idx + 1) as f64)
        .fold(f64::INFINITY, f64::min);
    let mut q = vec![initial; n];
    let mut pa = vec![initial; n];

    for m in (2..n).rev() {
        let split = n - m + 1;
        let q1 = (0..m - 1)
            .map(|j| m as f64 * p[split + j] / (j + 2) as f64)
            .fold(f64::INFINITY, f64::min);
        for idx in 0..split {
            q[idx] = (m as f64 * p[idx]).min(q1);
        }
        let carried = q[split - 1];
        for slot in q.iter_mut().skip(split) {
            *slot = carried;
        }
        for (a, &b) in pa.iter_mut().zip(&q) {
            *a = a.max(b);
        }
    }

    pa.iter().zip(p).map(|(&a, &x)| a.max(x)).collect()
}
