//! Descriptive statistics for the report, plus a best-effort distribution
//! fit used only as a diagnostic.

use serde::{Deserialize, Serialize};

/// Power gaps longer than this are counted separately; the sensor samples
/// roughly every millisecond.
pub const LONG_GAP_US: i64 = 1200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub stdev: Option<f64>,
}

impl Summary {
    pub fn of(values: &[f64]) -> Self {
        Self {
            count: values.len(),
            mean: mean(values),
            median: median(values),
            stdev: stdev(values),
        }
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Sample standard deviation (n - 1); needs at least two values.
pub fn stdev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Spacing between consecutive timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalStats {
    pub avg: Option<f64>,
    pub median: Option<f64>,
    pub max: Option<i64>,
    pub min: Option<i64>,
    pub above_long_gap: usize,
}

impl IntervalStats {
    /// The first two gaps (start-up to first sample, first to second) are
    /// left out of avg/median/min/max; they measure initialisation.
    pub fn of(timestamps: &[i64]) -> Self {
        let deltas: Vec<i64> = timestamps.windows(2).map(|w| w[1] - w[0]).collect();
        let steady: Vec<i64> = deltas.iter().copied().skip(2).collect();
        let as_f64: Vec<f64> = steady.iter().map(|d| *d as f64).collect();
        Self {
            avg: mean(&as_f64),
            median: median(&as_f64),
            max: steady.iter().copied().max(),
            min: steady.iter().copied().min(),
            above_long_gap: deltas.iter().filter(|d| **d > LONG_GAP_US).count(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Family {
    Normal,
    Exponential,
    LogNormal,
    Uniform,
    Weibull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionFit {
    pub family: Family,
    pub params: Vec<f64>,
    /// Kolmogorov–Smirnov statistic.
    pub ks_statistic: f64,
    pub p_value: f64,
}

/// Fit every candidate family and keep the one with the highest KS p-value.
/// `None` when the data cannot support any fit (too few points, no spread).
pub fn best_fit(values: &[f64]) -> Option<DistributionFit> {
    if values.len() < 3 || values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    [
        Family::Normal,
        Family::Exponential,
        Family::LogNormal,
        Family::Uniform,
        Family::Weibull,
    ]
    .into_iter()
    .filter_map(|family| {
        let params = fit(family, &sorted)?;
        let d = ks_statistic(&sorted, |x| cdf(family, &params, x));
        Some(DistributionFit {
            family,
            params,
            ks_statistic: d,
            p_value: ks_p_value(d, sorted.len()),
        })
    })
    .max_by(|a, b| a.p_value.total_cmp(&b.p_value))
}

fn fit(family: Family, sorted: &[f64]) -> Option<Vec<f64>> {
    let n = sorted.len() as f64;
    match family {
        Family::Normal => {
            let m = mean(sorted)?;
            let sd = (sorted.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n).sqrt();
            (sd > 0.0).then(|| vec![m, sd])
        }
        Family::Exponential => {
            let loc = sorted[0];
            let scale = mean(sorted)? - loc;
            (scale > 0.0).then(|| vec![loc, scale])
        }
        Family::LogNormal => {
            if sorted[0] <= 0.0 {
                return None;
            }
            let logs: Vec<f64> = sorted.iter().map(|v| v.ln()).collect();
            let mu = mean(&logs)?;
            let sigma = (logs.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / n).sqrt();
            (sigma > 0.0).then(|| vec![mu, sigma])
        }
        Family::Uniform => {
            let (lo, hi) = (sorted[0], sorted[sorted.len() - 1]);
            (hi > lo).then(|| vec![lo, hi - lo])
        }
        Family::Weibull => fit_weibull(sorted),
    }
}

/// Two-parameter Weibull by maximum likelihood (Newton iterations on the
/// shape). Requires strictly positive data.
fn fit_weibull(sorted: &[f64]) -> Option<Vec<f64>> {
    if sorted[0] <= 0.0 {
        return None;
    }
    let n = sorted.len() as f64;
    let logs: Vec<f64> = sorted.iter().map(|v| v.ln()).collect();
    let mean_log = logs.iter().sum::<f64>() / n;

    let mut k = 1.0_f64;
    for _ in 0..100 {
        let (mut s0, mut s1, mut s2) = (0.0, 0.0, 0.0);
        for (x, lx) in sorted.iter().zip(&logs) {
            let xk = x.powf(k);
            s0 += xk;
            s1 += xk * lx;
            s2 += xk * lx * lx;
        }
        let g = s1 / s0 - 1.0 / k - mean_log;
        let dg = (s2 * s0 - s1 * s1) / (s0 * s0) + 1.0 / (k * k);
        if !g.is_finite() || !dg.is_finite() || dg == 0.0 {
            return None;
        }
        let next = (k - g / dg).max(k / 10.0);
        if (next - k).abs() < 1e-9 {
            k = next;
            break;
        }
        k = next;
    }
    let scale = (sorted.iter().map(|x| x.powf(k)).sum::<f64>() / n).powf(1.0 / k);
    (k.is_finite() && scale.is_finite() && scale > 0.0).then(|| vec![k, scale])
}

fn cdf(family: Family, p: &[f64], x: f64) -> f64 {
    match family {
        Family::Normal => 0.5 * (1.0 + erf((x - p[0]) / (p[1] * std::f64::consts::SQRT_2))),
        Family::Exponential => {
            if x < p[0] {
                0.0
            } else {
                1.0 - (-(x - p[0]) / p[1]).exp()
            }
        }
        Family::LogNormal => {
            if x <= 0.0 {
                0.0
            } else {
                0.5 * (1.0 + erf((x.ln() - p[0]) / (p[1] * std::f64::consts::SQRT_2)))
            }
        }
        Family::Uniform => ((x - p[0]) / p[1]).clamp(0.0, 1.0),
        Family::Weibull => {
            if x <= 0.0 {
                0.0
            } else {
                1.0 - (-(x / p[1]).powf(p[0])).exp()
            }
        }
    }
}

fn ks_statistic(sorted: &[f64], cdf: impl Fn(f64) -> f64) -> f64 {
    let n = sorted.len() as f64;
    sorted
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let f = cdf(x);
            let above = (i + 1) as f64 / n - f;
            let below = f - i as f64 / n;
            above.max(below)
        })
        .fold(0.0, f64::max)
}

/// Asymptotic Kolmogorov distribution with the Stephens small-sample
/// correction.
fn ks_p_value(d: f64, n: usize) -> f64 {
    let sqrt_n = (n as f64).sqrt();
    let lambda = (sqrt_n + 0.12 + 0.11 / sqrt_n) * d;
    if lambda < 1e-3 {
        return 1.0;
    }
    let mut sum = 0.0;
    for j in 1..=100 {
        let j = j as f64;
        let term = 2.0 * (-1.0_f64).powf(j - 1.0) * (-2.0 * j * j * lambda * lambda).exp();
        sum += term;
        if term.abs() < 1e-12 {
            break;
        }
    }
    sum.clamp(0.0, 1.0)
}

/// Abramowitz & Stegun 7.1.26; absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let y = 1.0
        - (((((1.061405429 * t - 1.453152027) * t) + 1.421413741) * t - 0.284496736) * t
            + 0.254829592)
            * t
            * (-x * x).exp();
    sign * y
}
