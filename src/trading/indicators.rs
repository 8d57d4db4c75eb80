//! Technical indicators over candle series. All math is `f64`.

use crate::api::Candle;

/// Exponential moving average seeded with the first price, `k = 2 / (period + 1)`.
///
/// Falls back to the simple mean when fewer than `period` prices are given.
pub fn ema(prices: &[f64], period: usize) -> f64 {
    if prices.is_empty() {
        return 0.0;
    }
    if prices.len() < period {
        return prices.iter().sum::<f64>() / prices.len() as f64;
    }

    let k = 2.0 / (period as f64 + 1.0);
    prices[1..]
        .iter()
        .fold(prices[0], |ema, price| price * k + ema * (1.0 - k))
}

/// RSI from simple averages of the last `period` gains and losses.
///
/// Returns 50 when there is not enough data and 100 when there were no losses.
pub fn rsi(prices: &[f64], period: usize) -> f64 {
    if period == 0 || prices.len() < period + 1 {
        return 50.0;
    }

    let changes: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();
    let recent = &changes[changes.len() - period..];
    let avg_gain = recent.iter().filter(|c| **c > 0.0).sum::<f64>() / period as f64;
    let avg_loss = recent.iter().filter(|c| **c < 0.0).map(|c| c.abs()).sum::<f64>() / period as f64;

    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Volume-weighted average of the typical price.
pub fn vwap(candles: &[Candle]) -> f64 {
    let (pv, volume) = candles.iter().fold((0.0, 0.0), |(pv, vol), c| {
        (pv + c.typical_price() * c.volume, vol + c.volume)
    });
    if volume == 0.0 {
        0.0
    } else {
        pv / volume
    }
}

/// Percent change from `closes[len - lookback]` to the last close.
pub fn price_change_pct(closes: &[f64], lookback: usize) -> f64 {
    if lookback == 0 || closes.len() < lookback {
        return 0.0;
    }
    let past = closes[closes.len() - lookback];
    let last = closes[closes.len() - 1];
    if past == 0.0 {
        return 0.0;
    }
    (last - past) / past * 100.0
}

/// Mean volume of the last `recent` candles over the mean of the ones before.
///
/// `None` when fewer than 10 volumes are given or the baseline is zero.
pub fn volume_surge_ratio(volumes: &[f64], recent: usize) -> Option<f64> {
    if volumes.len() < 10 || recent == 0 || recent >= volumes.len() {
        return None;
    }
    let split = volumes.len() - recent;
    let recent_mean = volumes[split..].iter().sum::<f64>() / recent as f64;
    let base_mean = volumes[..split].iter().sum::<f64>() / split as f64;
    if base_mean == 0.0 {
        return None;
    }
    Some(recent_mean / base_mean)
}

/// Where the close sits within the candle range, 0 at the low and 1 at the high.
pub fn candle_position(candle: &Candle) -> Option<f64> {
    let range = candle.high - candle.low;
    if range <= 0.0 {
        return None;
    }
    Some((candle.close - candle.low) / range)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open,
            high,
            low,
            close,
            volume,
            timestamp: 0,
        }
    }

    #[test]
    fn test_ema_seeded_with_first_price() {
        assert_eq!(ema(&[10.0, 10.0, 10.0], 2), 10.0);
        // k = 2/3: 1 -> 1*1/3 + 4*2/3 = 3.0
        assert!((ema(&[1.0, 4.0], 2) - 3.0).abs() < 1e-12);
        assert_eq!(ema(&[1.0, 3.0], 5), 2.0);
    }

    #[test]
    fn test_rsi_edges() {
        assert_eq!(rsi(&[1.0, 2.0], 14), 50.0);
        let rising: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert_eq!(rsi(&rising, 14), 100.0);

        // 7 gains of 1 and 7 losses of 1
        let zigzag: Vec<f64> = (0..15).map(|i| (i % 2) as f64).collect();
        assert!((rsi(&zigzag, 14) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_vwap_and_position() {
        let candles = vec![
            candle(0.0, 12.0, 9.0, 9.0, 1.0),
            candle(0.0, 21.0, 18.0, 21.0, 3.0),
        ];
        // typical prices 10 and 20
        assert!((vwap(&candles) - 17.5).abs() < 1e-12);
        assert_eq!(vwap(&[]), 0.0);

        assert_eq!(candle_position(&candles[1]), Some(1.0));
        assert_eq!(candle_position(&candle(1.0, 1.0, 1.0, 1.0, 1.0)), None);
    }

    #[test]
    fn test_volume_surge_ratio() {
        let mut volumes = vec![100.0; 17];
        volumes.extend([300.0, 300.0, 300.0]);
        assert!((volume_surge_ratio(&volumes, 3).unwrap() - 3.0).abs() < 1e-12);
        assert_eq!(volume_surge_ratio(&volumes[..9], 3), None);
        assert_eq!(volume_surge_ratio(&[0.0; 12], 3), None);
    }

    #[test]
    fn test_price_change() {
        let closes = [100.0, 101.0, 102.0, 103.0, 110.0];
        assert!((price_change_pct(&closes, 5) - 10.0).abs() < 1e-12);
        assert_eq!(price_change_pct(&closes[..3], 5), 0.0);
    }
}
