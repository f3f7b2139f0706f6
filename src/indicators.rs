use crate::models::Candle;

pub const DEFAULT_RSI_PERIOD: usize = 14;

/// Closing prices, oldest first.
pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

/// Mean of the last `period` values. `None` until enough history exists.
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let window = &prices[prices.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// EMA seeded with the value `period` positions from the end and blended forward
/// through the newest value.
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let start = prices.len() - period;
    let mut ema = prices[start];
    for price in &prices[start + 1..] {
        ema = price * multiplier + ema * (1.0 - multiplier);
    }
    Some(ema)
}

/// Simple (non-Wilder) RSI over the trailing `period` price changes.
///
/// Gains and losses are plain sums over the window. A window without losses
/// divides by 1 instead of 0, so a flat series reads 0 and a rising series
/// approaches 100 without reaching it.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    let needed = period.checked_add(1)?;
    if period == 0 || prices.len() < needed {
        return None;
    }
    let window = &prices[prices.len() - needed..];
    let mut gains = 0.0;
    let mut losses = 0.0;
    for pair in window.windows(2) {
        let change = pair[1] - pair[0];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let divisor = if losses == 0.0 { 1.0 } else { losses };
    let rs = gains / divisor;
    Some(100.0 - 100.0 / (1.0 + rs))
}
