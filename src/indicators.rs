//! Technical indicators
//!
//! Pure functions over price slices. Series functions return one entry per
//! input bar; `None` marks bars without enough history. ADX is the exception:
//! it reports a neutral `0.0` below its minimum history so callers compare it
//! against thresholds directly.

/// Rolling mean over `period` bars
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 || values.len() < period {
        return vec![None; values.len()];
    }

    let mut out = vec![None; period - 1];
    let mut window_sum: f64 = values[..period].iter().sum();
    out.push(Some(window_sum / period as f64));
    for (entering, leaving) in values[period..].iter().zip(values) {
        window_sum += entering - leaving;
        out.push(Some(window_sum / period as f64));
    }
    out
}

/// EMA seeded with the SMA of the first `period` values
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());
    if period == 0 || values.len() < period {
        result.resize(values.len(), None);
        return result;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;

    result.resize(period - 1, None);
    result.push(Some(seed));

    let mut prev = seed;
    for &value in &values[period..] {
        prev = (value - prev) * multiplier + prev;
        result.push(Some(prev));
    }

    result
}

/// Wilder smoothing (alpha = 1/period), seeded with the mean of the first `period` values
pub fn wilder(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());
    if period == 0 || values.len() < period {
        result.resize(values.len(), None);
        return result;
    }

    let p = period as f64;
    let mut smoothed = values[..period].iter().sum::<f64>() / p;

    result.resize(period - 1, None);
    result.push(Some(smoothed));

    for &value in &values[period..] {
        smoothed = (smoothed * (p - 1.0) + value) / p;
        result.push(Some(smoothed));
    }

    result
}

/// Calculate RSI (Relative Strength Index) with Wilder smoothing
///
/// The first value appears at index `period` (one change per bar after the first).
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = vec![None; values.len()];
    if values.len() < 2 || period == 0 {
        return result;
    }

    let mut gains = Vec::with_capacity(values.len() - 1);
    let mut losses = Vec::with_capacity(values.len() - 1);
    for w in values.windows(2) {
        let change = w[1] - w[0];
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }

    let avg_gains = wilder(&gains, period);
    let avg_losses = wilder(&losses, period);

    for i in 0..gains.len() {
        if let (Some(gain), Some(loss)) = (avg_gains[i], avg_losses[i]) {
            let value = if loss == 0.0 && gain == 0.0 {
                50.0
            } else if loss == 0.0 {
                100.0
            } else {
                100.0 - 100.0 / (1.0 + gain / loss)
            };
            result[i + 1] = Some(value);
        }
    }

    result
}

/// MACD line and signal line
pub fn macd(
    values: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);

    let line: Vec<Option<f64>> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();

    // The signal EMA runs over the defined part of the MACD line only
    let start = line.iter().position(Option::is_some).unwrap_or(line.len());
    let defined: Vec<f64> = line[start..].iter().flatten().copied().collect();
    let mut signal_line = vec![None; start];
    signal_line.extend(ema(&defined, signal));

    (line, signal_line)
}

/// True range per bar; the first bar has no previous close and uses high - low
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let n = high.len().min(low.len()).min(close.len());
    (0..n)
        .map(|i| {
            let range = high[i] - low[i];
            match i.checked_sub(1).map(|p| close[p]) {
                Some(prev) => range
                    .max((high[i] - prev).abs())
                    .max((low[i] - prev).abs()),
                None => range,
            }
        })
        .collect()
}

/// ATR as the plain mean of true range over the lookback
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let tr = true_range(high, low, close);
    sma(&tr, period)
}

/// Latest ATR of a window, or `None` when the window is shorter than `period`
pub fn latest_atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Option<f64> {
    atr(high, low, close, period).last().copied().flatten()
}

/// Average Directional Index for every bar
///
/// +DM, -DM and TR are Wilder-smoothed, DX is derived from the smoothed
/// directional indicators and ADX is the Wilder-smoothed DX. A bar needs
/// `2 * period + 1` bars of history (itself included); earlier bars read 0.
/// Every value equals what [`adx`] would return on the prefix ending there.
pub fn adx_series(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let n = high.len();
    let mut result = vec![0.0; n];
    if period == 0 || n < 2 * period + 1 {
        return result;
    }

    // Movement between bar i and i + 1 is stored at i
    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    let mut tr = Vec::with_capacity(n - 1);
    for i in 0..n - 1 {
        let up = high[i + 1] - high[i];
        let down = low[i] - low[i + 1];
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
        tr.push(
            (high[i + 1] - low[i + 1])
                .max((high[i + 1] - close[i]).abs())
                .max((low[i + 1] - close[i]).abs()),
        );
    }

    let p = period as f64;
    let mut s_tr = tr[..period].iter().sum::<f64>() / p;
    let mut s_plus = plus_dm[..period].iter().sum::<f64>() / p;
    let mut s_minus = minus_dm[..period].iter().sum::<f64>() / p;

    let mut adx: Option<f64> = None;
    let mut dx_seed = Vec::with_capacity(period);

    for i in period..tr.len() {
        s_tr = (s_tr * (p - 1.0) + tr[i]) / p;
        s_plus = (s_plus * (p - 1.0) + plus_dm[i]) / p;
        s_minus = (s_minus * (p - 1.0) + minus_dm[i]) / p;

        let (plus_di, minus_di) = if s_tr > 0.0 {
            (100.0 * s_plus / s_tr, 100.0 * s_minus / s_tr)
        } else {
            (0.0, 0.0)
        };
        let di_sum = plus_di + minus_di;
        let dx = if di_sum > 0.0 {
            100.0 * (plus_di - minus_di).abs() / di_sum
        } else {
            0.0
        };

        adx = match adx {
            Some(prev) => Some((prev * (p - 1.0) + dx) / p),
            None => {
                dx_seed.push(dx);
                if dx_seed.len() == period {
                    Some(dx_seed.iter().sum::<f64>() / p)
                } else {
                    None
                }
            }
        };

        if let Some(value) = adx {
            result[i + 1] = value;
        }
    }

    result
}

/// ADX of the last bar in the window, 0 when history is insufficient
pub fn adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> f64 {
    adx_series(high, low, close, period)
        .last()
        .copied()
        .unwrap_or(0.0)
}
