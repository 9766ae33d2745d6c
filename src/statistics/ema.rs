pub struct Ema;

impl Ema {
    /// EMA over `prices`, seeded with the simple average of the first `period`
    /// values. Entries before the seed are `None`; an empty vector is returned
    /// when there are fewer than `period` prices.
    pub fn series(prices: &[f64], period: usize) -> Vec<Option<f64>> {
        if period == 0 || prices.len() < period {
            return Vec::new();
        }

        let alpha = 2.0 / (period as f64 + 1.0);
        let mut ema = vec![None; prices.len()];

        let seed = prices[..period].iter().sum::<f64>() / period as f64;
        ema[period - 1] = Some(seed);

        let mut prev = seed;
        for i in period..prices.len() {
            prev = prices[i] * alpha + prev * (1.0 - alpha);
            ema[i] = Some(prev);
        }

        ema
    }

    pub fn latest(prices: &[f64], period: usize) -> Option<f64> {
        Self::series(prices, period).last().copied().flatten()
    }
}
