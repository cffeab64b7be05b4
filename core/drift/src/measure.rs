//! Two-sample distance measures.
//!
//! Each measure returns a value in `[0, inf)` where 0 means the two
//! empirical distributions are identical. Inputs are expected to be finite.

use std::fmt;

/// Distance between a reference sample and a current sample
pub trait DistanceMeasure: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn distance(&self, reference: &[f64], current: &[f64]) -> f64;
}

/// Wasserstein-1 distance scaled by the reference spread.
///
/// Divides by the population stddev of the reference, floored at
/// `min_scale` so a constant reference does not blow up.
#[derive(Debug, Clone, Copy)]
pub struct NormalizedWasserstein {
    pub min_scale: f64,
}

impl NormalizedWasserstein {
    pub fn new() -> Self {
        Self { min_scale: 0.001 }
    }
}

impl Default for NormalizedWasserstein {
    fn default() -> Self {
        Self::new()
    }
}

impl DistanceMeasure for NormalizedWasserstein {
    fn name(&self) -> &'static str {
        "normalized_wasserstein"
    }

    fn distance(&self, reference: &[f64], current: &[f64]) -> f64 {
        if reference.is_empty() || current.is_empty() {
            return 0.0;
        }
        let scale = population_stddev(reference).max(self.min_scale);
        wasserstein_1(reference, current) / scale
    }
}

/// Two-sample Kolmogorov-Smirnov statistic, in `[0, 1]`
#[derive(Debug, Clone, Copy, Default)]
pub struct KolmogorovSmirnov;

impl DistanceMeasure for KolmogorovSmirnov {
    fn name(&self) -> &'static str {
        "kolmogorov_smirnov"
    }

    fn distance(&self, reference: &[f64], current: &[f64]) -> f64 {
        if reference.is_empty() || current.is_empty() {
            return 0.0;
        }
        let mut sup = 0.0f64;
        walk_ecdfs(reference, current, |fa, fb, _, _| {
            sup = sup.max((fa - fb).abs());
        });
        sup
    }
}

/// Earth mover's distance between two empirical distributions
pub fn wasserstein_1(a: &[f64], b: &[f64]) -> f64 {
    let mut total = 0.0;
    walk_ecdfs(a, b, |fa, fb, x, next| {
        if let Some(next) = next {
            total += (fa - fb).abs() * (next - x);
        }
    });
    total
}

pub fn population_stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Visit every distinct support point in ascending order with both ECDF
/// values evaluated there and the next support point, if any.
fn walk_ecdfs(a: &[f64], b: &[f64], mut visit: impl FnMut(f64, f64, f64, Option<f64>)) {
    let a = sorted(a);
    let b = sorted(b);
    let (na, nb) = (a.len() as f64, b.len() as f64);

    let mut support: Vec<f64> = a.iter().chain(b.iter()).copied().collect();
    support.sort_by(f64::total_cmp);
    support.dedup();

    let (mut ia, mut ib) = (0usize, 0usize);
    for (i, &x) in support.iter().enumerate() {
        while ia < a.len() && a[ia] <= x {
            ia += 1;
        }
        while ib < b.len() && b[ib] <= x {
            ib += 1;
        }
        visit(ia as f64 / na, ib as f64 / nb, x, support.get(i + 1).copied());
    }
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wasserstein_shift() {
        // shifting every point by 1 moves all mass by 1
        assert!((wasserstein_1(&[0.0, 1.0], &[1.0, 2.0]) - 1.0).abs() < 1e-12);
        assert_eq!(wasserstein_1(&[3.0, 1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn test_wasserstein_unequal_sizes() {
        // {0} vs {0, 2}: half the mass travels 2
        assert!((wasserstein_1(&[0.0], &[0.0, 2.0]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_normalized_by_reference_spread() {
        let d = NormalizedWasserstein::new().distance(&[0.0, 1.0], &[1.0, 2.0]);
        // population stddev of {0, 1} is 0.5
        assert!((d - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_constant_reference_is_floored() {
        let d = NormalizedWasserstein::new().distance(&[5.0, 5.0], &[5.0, 5.001]);
        assert!(d.is_finite());
        assert!((d - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_ks_bounds() {
        let ks = KolmogorovSmirnov;
        assert_eq!(ks.distance(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(ks.distance(&[1.0, 2.0], &[10.0, 11.0]), 1.0);

        let partial = ks.distance(&[1.0, 2.0, 3.0, 4.0], &[3.0, 4.0, 5.0, 6.0]);
        assert!((partial - 0.5).abs() < 1e-12);
    }
}
