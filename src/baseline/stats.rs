// =============================================================================
// Order statistics — deterministic percentile and dispersion helpers
// =============================================================================
//
// Percentiles use linear interpolation at rank p/100 * (n - 1) over the
// sorted sample, so tied observations need no separate tie-break. Sorting
// uses `f64::total_cmp`, so the result never depends on input order.

/// Sort a copy of `values`, dropping non-finite entries.
pub fn sorted_finite(values: &[f64]) -> Vec<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    v.sort_by(f64::total_cmp);
    v
}

/// Percentile `p` (0–100) of an already sorted sample.
///
/// Returns `None` for an empty sample.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    if n == 1 {
        return Some(sorted[0]);
    }
    let p = p.clamp(0.0, 100.0);
    let rank = p / 100.0 * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// Coefficient of variation `std / |mean|`.
///
/// A zero-mean series is perfectly stable when it has no dispersion and
/// maximally unstable otherwise.
pub fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let s = std_dev(values)?;
    if m.abs() < f64::EPSILON {
        return Some(if s < f64::EPSILON { 0.0 } else { f64::INFINITY });
    }
    Some(s / m.abs())
}

/// Banker's rounding (round half to even) to `dp` fractional digits.
pub fn round_half_even(x: f64, dp: u32) -> f64 {
    if !x.is_finite() {
        return x;
    }
    let factor = 10f64.powi(dp as i32);
    (x * factor).round_ties_even() / factor
}
