//! Small statistics helpers: summary stats for score aggregation and the
//! paired t-test backing the significance matrices.

/// Sentinel returned when a test cannot be computed (fewer than two pairs).
pub const INVALID_P_VALUE: f64 = -1.0;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Two-sided paired t-test over per-query score vectors.
///
/// Inputs must already be paired (same query order). Returns the p-value, or
/// [`INVALID_P_VALUE`] when fewer than two pairs are available. Zero variance
/// in the differences degenerates to p = 1.0 for a zero mean difference and
/// p = 0.0 otherwise.
pub fn paired_t_test(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return INVALID_P_VALUE;
    }
    let diffs: Vec<f64> = a.iter().zip(b.iter()).map(|(x, y)| x - y).collect();
    let mean_diff = mean(&diffs);
    let var = diffs
        .iter()
        .map(|d| (d - mean_diff).powi(2))
        .sum::<f64>()
        / (n as f64 - 1.0);
    if var == 0.0 {
        return if mean_diff == 0.0 { 1.0 } else { 0.0 };
    }
    let t = mean_diff / (var / n as f64).sqrt();
    let df = n as f64 - 1.0;
    student_t_two_sided_p(t, df)
}

/// P(|T| >= |t|) for Student's t with `df` degrees of freedom, via the
/// regularized incomplete beta function.
fn student_t_two_sided_p(t: f64, df: f64) -> f64 {
    let x = df / (df + t * t);
    incomplete_beta(df / 2.0, 0.5, x)
}

/// Regularized incomplete beta I_x(a, b) by continued fraction (Lentz).
fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b)
        + a * x.ln()
        + b * (1.0 - x).ln();
    // the continued fraction converges fastest for x < (a+1)/(a+b+2)
    if x < (a + 1.0) / (a + b + 2.0) {
        (ln_front.exp()) * beta_cf(a, b, x) / a
    } else {
        1.0 - (ln_front.exp()) * beta_cf(b, a, 1.0 - x) / b
    }
}

fn beta_cf(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 200;
    const EPS: f64 = 3.0e-12;
    const FPMIN: f64 = 1.0e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut h = d;
    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        h *= d * c;
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Lanczos approximation of ln(Γ(x)).
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 6] = [
        76.18009172947146,
        -86.50532032941677,
        24.01409824083091,
        -1.231739572450155,
        0.1208650973866179e-2,
        -0.5395239384953e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000000000190015;
    for c in COEFFS {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.5066282746310005 * ser / x).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_median() {
        assert_eq!(mean(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn t_test_too_few_samples() {
        assert_eq!(paired_t_test(&[1.0], &[2.0]), INVALID_P_VALUE);
        assert_eq!(paired_t_test(&[], &[]), INVALID_P_VALUE);
    }

    #[test]
    fn t_test_identical_vectors() {
        let a = [0.5, 0.7, 0.9];
        assert_eq!(paired_t_test(&a, &a), 1.0);
    }

    #[test]
    fn t_test_constant_nonzero_difference() {
        let a = [1.0, 2.0, 3.0];
        let b = [0.5, 1.5, 2.5];
        assert_eq!(paired_t_test(&a, &b), 0.0);
    }

    #[test]
    fn t_test_known_value() {
        // differences [1, 2, 3, 4, 5]: mean 3, sd sqrt(2.5), t = 3/sqrt(0.5) ~ 4.2426, df 4
        // two-sided p ~ 0.0132
        let a = [2.0, 4.0, 6.0, 8.0, 10.0];
        let b = [1.0, 2.0, 3.0, 4.0, 5.0];
        let p = paired_t_test(&a, &b);
        assert!((p - 0.0132).abs() < 0.001, "p was {}", p);
    }

    #[test]
    fn t_test_weak_difference_large_p() {
        let a = [0.50, 0.61, 0.47, 0.55, 0.52, 0.58];
        let b = [0.51, 0.60, 0.48, 0.53, 0.54, 0.57];
        let p = paired_t_test(&a, &b);
        assert!(p > 0.3, "p was {}", p);
        assert!(p <= 1.0);
    }

    #[test]
    fn incomplete_beta_symmetry() {
        // I_x(a,b) = 1 - I_{1-x}(b,a)
        let lhs = incomplete_beta(2.0, 3.0, 0.4);
        let rhs = 1.0 - incomplete_beta(3.0, 2.0, 0.6);
        assert!((lhs - rhs).abs() < 1e-9);
    }
}
