//! Pure numeric routines over finite `f64` sequences (spec.md §4.1).
//!
//! Every function here is stateless and allocation is limited to the
//! function's own output. Positions where an indicator is not yet defined
//! are `f64::NAN`, never a panic or a truncated `Vec`.

/// Coerce a user-supplied window/period to a usable `usize`.
fn coerce_period(n: f64) -> usize {
    (n.floor() as i64).max(1) as usize
}

/// Simple moving average. `SMA(values, n)[i]` is NaN for `i < n-1`, else the
/// arithmetic mean of the trailing `n` values, computed via a rolling sum.
pub fn sma(values: &[f64], n: usize) -> Vec<f64> {
    let n = n.max(1);
    let mut out = vec![f64::NAN; values.len()];
    if values.len() < n {
        return out;
    }
    let mut sum: f64 = values[..n].iter().sum();
    out[n - 1] = sum / n as f64;
    for i in n..values.len() {
        sum += values[i] - values[i - n];
        out[i] = sum / n as f64;
    }
    out
}

/// Exponential moving average. Seeded with the SMA of the first `n` values
/// at index `n-1`; `k = 2/(n+1)` thereafter. Non-finite inputs are skipped —
/// the previous EMA carries forward (the output at that index is the carried
/// value, not NaN) only once a finite seed has been established; indices
/// before the seed are NaN.
pub fn ema(values: &[f64], n: usize) -> Vec<f64> {
    let n = n.max(1);
    let mut out = vec![f64::NAN; values.len()];
    if values.len() < n {
        return out;
    }
    let k = 2.0 / (n as f64 + 1.0);

    let seed: f64 = values[..n].iter().sum::<f64>() / n as f64;
    let mut prev = seed;
    out[n - 1] = seed;

    for i in n..values.len() {
        let v = values[i];
        if !v.is_finite() {
            // Non-finite input: carry the previous EMA forward unchanged.
            out[i] = if prev.is_finite() { prev } else { f64::NAN };
            continue;
        }
        if !prev.is_finite() {
            // No finite seed yet to resume from; leave NaN until one appears.
            out[i] = f64::NAN;
            continue;
        }
        let e = (v - prev) * k + prev;
        out[i] = e;
        prev = e;
    }
    out
}

/// Linearly weighted moving average, weights `1..=n` (newest heaviest),
/// denominator `n(n+1)/2`. NaN if the trailing window contains a non-finite
/// value.
pub fn wma(values: &[f64], n: usize) -> Vec<f64> {
    let n = n.max(1);
    let mut out = vec![f64::NAN; values.len()];
    if values.len() < n {
        return out;
    }
    let denom = (n * (n + 1) / 2) as f64;
    for i in (n - 1)..values.len() {
        let window = &values[i + 1 - n..=i];
        if window.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let weighted: f64 = window
            .iter()
            .enumerate()
            .map(|(idx, v)| v * (idx + 1) as f64)
            .sum();
        out[i] = weighted / denom;
    }
    out
}

/// Latest-only RSI with Wilder smoothing. NaN if `len < n+1`.
pub fn rsi(values: &[f64], n: usize) -> f64 {
    let n = n.max(1);
    if values.len() < n + 1 {
        return f64::NAN;
    }
    let deltas: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();

    let (mut avg_gain, mut avg_loss) = deltas[..n].iter().fold((0.0, 0.0), |(g, l), &d| {
        if d > 0.0 {
            (g + d, l)
        } else {
            (g, l - d.min(0.0))
        }
    });
    avg_gain /= n as f64;
    avg_loss /= n as f64;

    for &d in &deltas[n..] {
        let gain = if d > 0.0 { d } else { 0.0 };
        let loss = if d < 0.0 { -d } else { 0.0 };
        avg_gain = (avg_gain * (n as f64 - 1.0) + gain) / n as f64;
        avg_loss = (avg_loss * (n as f64 - 1.0) + loss) / n as f64;
    }

    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Latest-only Wilder-smoothed ATR. NaN if `len < n+1`.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], n: usize) -> f64 {
    let n = n.max(1);
    let len = highs.len().min(lows.len()).min(closes.len());
    if len < n + 1 {
        return f64::NAN;
    }

    let mut trs = Vec::with_capacity(len - 1);
    for i in 1..len {
        let hl = highs[i] - lows[i];
        let hc = (highs[i] - closes[i - 1]).abs();
        let lc = (lows[i] - closes[i - 1]).abs();
        trs.push(hl.max(hc).max(lc));
    }
    if trs.len() < n {
        return f64::NAN;
    }

    let mut a: f64 = trs[..n].iter().sum::<f64>() / n as f64;
    for &tr in &trs[n..] {
        a = (a * (n as f64 - 1.0) + tr) / n as f64;
    }
    a
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// MACD: `macdLine = EMA(values,fast) - EMA(values,slow)`, `signalLine =
/// EMA(macdLine, signal)`. Returns the last-finite value independently for
/// `macd` and `signal` — they may come from different indices if the signal
/// line lags (spec.md §9); this is defined behavior, not a bug.
pub fn macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    let fast = fast.max(1);
    let slow = slow.max(1);
    let signal = signal.max(1);
    if values.len() < fast.max(slow) + signal {
        return Macd {
            macd: f64::NAN,
            signal: f64::NAN,
            histogram: f64::NAN,
        };
    }

    let ema_fast = ema(values, fast);
    let ema_slow = ema(values, slow);
    let macd_line: Vec<f64> = ema_fast
        .iter()
        .zip(ema_slow.iter())
        .map(|(&f, &s)| f - s)
        .collect();
    let signal_line = ema(&macd_line, signal);

    let macd_last = last_finite(&macd_line);
    let signal_last = last_finite(&signal_line);
    Macd {
        macd: macd_last,
        signal: signal_last,
        histogram: macd_last - signal_last,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Bollinger Bands using **population** standard deviation (divisor =
/// `length`, not `length - 1`) over the trailing `length` values.
pub fn bollinger(values: &[f64], length: usize, mult: f64) -> Bollinger {
    let length = length.max(1);
    if values.len() < length {
        return Bollinger {
            upper: f64::NAN,
            middle: f64::NAN,
            lower: f64::NAN,
        };
    }
    let window = &values[values.len() - length..];
    let middle = window.iter().sum::<f64>() / length as f64;
    let variance = window.iter().map(|v| (v - middle).powi(2)).sum::<f64>() / length as f64;
    let std_dev = variance.sqrt();
    Bollinger {
        upper: middle + mult * std_dev,
        middle,
        lower: middle - mult * std_dev,
    }
}

/// Last two indices where both series are finite; true iff `a_prev <= b_prev
/// && a_curr > b_curr`. False when fewer than two such pairs exist.
pub fn cross_up(a: &[f64], b: &[f64]) -> bool {
    cross(a, b, |ap, bp, ac, bc| ap <= bp && ac > bc)
}

/// As `cross_up`, with `a_prev >= b_prev && a_curr < b_curr`.
pub fn cross_down(a: &[f64], b: &[f64]) -> bool {
    cross(a, b, |ap, bp, ac, bc| ap >= bp && ac < bc)
}

fn cross(a: &[f64], b: &[f64], test: impl Fn(f64, f64, f64, f64) -> bool) -> bool {
    let len = a.len().min(b.len());
    let mut finite_idx: Vec<usize> = (0..len)
        .filter(|&i| a[i].is_finite() && b[i].is_finite())
        .collect();
    if finite_idx.len() < 2 {
        return false;
    }
    let curr = finite_idx.pop().unwrap();
    let prev = *finite_idx.last().unwrap();
    test(a[prev], b[prev], a[curr], b[curr])
}

/// Last finite value scanning from the tail, or NaN if none exists.
pub fn last_finite(s: &[f64]) -> f64 {
    s.iter()
        .rev()
        .copied()
        .find(|v| v.is_finite())
        .unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_nan_or_eq(actual: f64, expected: f64) {
        if expected.is_nan() {
            assert!(actual.is_nan(), "expected NaN, got {actual}");
        } else {
            assert!(
                (actual - expected).abs() < 1e-9,
                "expected {expected}, got {actual}"
            );
        }
    }

    #[test]
    fn sma_boundary_scenario() {
        let out = sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        let expected = [f64::NAN, f64::NAN, 2.0, 3.0, 4.0];
        for (a, e) in out.iter().zip(expected.iter()) {
            assert_nan_or_eq(*a, *e);
        }
    }

    #[test]
    fn ema_seed_equals_sma_of_first_n() {
        let out = ema(&[1.0, 1.0, 1.0, 1.0, 1.0], 3);
        let expected = [f64::NAN, f64::NAN, 1.0, 1.0, 1.0];
        for (a, e) in out.iter().zip(expected.iter()) {
            assert_nan_or_eq(*a, *e);
        }
    }

    #[test]
    fn rsi_strictly_increasing_is_100() {
        assert_eq!(rsi(&[1.0, 2.0, 3.0, 4.0, 5.0], 4), 100.0);
    }

    #[test]
    fn rsi_insufficient_history_is_nan() {
        assert!(rsi(&[1.0, 2.0], 4).is_nan());
    }

    #[test]
    fn rsi_always_bounded_when_defined() {
        let closes: Vec<f64> = (0..50).map(|i| 100.0 + (i as f64 * 0.37).sin() * 5.0).collect();
        let v = rsi(&closes, 14);
        assert!(v.is_nan() || (0.0..=100.0).contains(&v));
    }

    #[test]
    fn cross_up_examples() {
        assert!(cross_up(&[1.0, 1.0, 1.0, 2.0], &[1.5, 1.5, 1.5, 1.5]));
        assert!(!cross_up(&[1.0, 1.0, 2.0, 1.0], &[1.5, 1.5, 1.5, 1.5]));
    }

    #[test]
    fn cross_needs_two_finite_pairs() {
        assert!(!cross_up(&[f64::NAN, 2.0], &[1.0, 1.5]));
    }

    #[test]
    fn bollinger_population_stdev() {
        let closes = vec![100.0; 20];
        let bb = bollinger(&closes, 20, 2.0);
        assert!((bb.middle - 100.0).abs() < 1e-9);
        assert!((bb.upper - 100.0).abs() < 1e-9);
        assert!((bb.lower - 100.0).abs() < 1e-9);
    }

    #[test]
    fn bollinger_insufficient_history_is_nan() {
        let bb = bollinger(&[1.0, 2.0, 3.0], 20, 2.0);
        assert!(bb.middle.is_nan() && bb.upper.is_nan() && bb.lower.is_nan());
    }

    #[test]
    fn macd_short_history_is_all_nan() {
        let m = macd(&[1.0, 2.0, 3.0], 12, 26, 9);
        assert!(m.macd.is_nan() && m.signal.is_nan() && m.histogram.is_nan());
    }

    #[test]
    fn last_finite_scans_from_tail() {
        assert_eq!(last_finite(&[1.0, f64::NAN, 3.0, f64::NAN]), 3.0);
        assert!(last_finite(&[f64::NAN, f64::NAN]).is_nan());
    }

    #[test]
    fn wma_nan_on_non_finite_window() {
        let out = wma(&[1.0, f64::NAN, 3.0], 3);
        assert!(out[2].is_nan());
    }

    #[test]
    fn atr_insufficient_history_is_nan() {
        assert!(atr(&[1.0], &[0.5], &[0.8], 14).is_nan());
    }
}
