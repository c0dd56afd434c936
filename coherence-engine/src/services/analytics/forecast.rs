//! Short-horizon forecasting of per-source coherence series
//!
//! The series is decomposed into trend + seasonal + residual, then several
//! independent models forecast it:
//! - Holt-Winters exponential smoothing (Holt linear when history is short)
//! - least-squares AR(p) with an MA(1) residual correction
//! - decomposition extrapolation (linear trend + seasonal profile)
//! - nearest-neighbour analog regressor
//!
//! Models are backtested on a holdout tail and blended with weights
//! proportional to `1 / MAE`. Every forecast carries prediction intervals
//! (`±1.96·σ·√h`), backtest accuracy and a confidence value; a series too
//! short to backtest yields a flat neutral forecast with confidence 0.

use super::stats::{linear_fit, mean, solve_linear, std_dev};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const Z_95: f64 = 1.96;

/// Forecasting tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Points kept per source series
    #[serde(default = "default_series_capacity")]
    pub series_capacity: usize,
    /// Points required before models are fitted
    #[serde(default = "default_min_history")]
    pub min_history: usize,
    /// Season length in observations
    #[serde(default = "default_seasonal_period")]
    pub seasonal_period: usize,
    #[serde(default = "default_ar_order")]
    pub ar_order: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_beta")]
    pub beta: f64,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// Largest horizon a caller may request
    #[serde(default = "default_max_horizon")]
    pub max_horizon: usize,
}

fn default_series_capacity() -> usize {
    500
}
fn default_min_history() -> usize {
    12
}
fn default_seasonal_period() -> usize {
    24
}
fn default_ar_order() -> usize {
    3
}
fn default_alpha() -> f64 {
    0.3
}
fn default_beta() -> f64 {
    0.1
}
fn default_gamma() -> f64 {
    0.2
}
fn default_max_horizon() -> usize {
    100
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            series_capacity: default_series_capacity(),
            min_history: default_min_history(),
            seasonal_period: default_seasonal_period(),
            ar_order: default_ar_order(),
            alpha: default_alpha(),
            beta: default_beta(),
            gamma: default_gamma(),
            max_horizon: default_max_horizon(),
        }
    }
}

impl ForecastConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_history < 4 {
            return Err("analytics.forecast.min_history must be at least 4".to_string());
        }
        if self.series_capacity < self.min_history {
            return Err("analytics.forecast.series_capacity must be >= min_history".to_string());
        }
        if self.seasonal_period < 2 || self.ar_order == 0 || self.max_horizon == 0 {
            return Err("analytics.forecast period/order/horizon must be positive".to_string());
        }
        for (name, v) in [("alpha", self.alpha), ("beta", self.beta), ("gamma", self.gamma)] {
            if !(v > 0.0 && v < 1.0) {
                return Err(format!("analytics.forecast.{} must be in (0, 1)", name));
            }
        }
        Ok(())
    }
}

/// One forecast step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Backtest accuracy of the blended forecast
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ForecastAccuracy {
    pub mae: f64,
    pub rmse: f64,
    /// Percent; zero actuals are skipped
    pub mape: f64,
    /// MAE relative to the in-sample naive (last value) forecast
    pub mase: f64,
    /// Holdout points the metrics were computed on
    pub samples: usize,
}

/// Forecast for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub source_id: String,
    pub generated_at: DateTime<Utc>,
    pub points: Vec<ForecastPoint>,
    pub accuracy: ForecastAccuracy,
    /// In [0, 1]; 0 for the neutral forecast
    pub confidence: f64,
    /// Blend weight per model
    pub model_weights: BTreeMap<String, f64>,
}

/// Trend + seasonal + residual split of a series
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub trend: Vec<f64>,
    /// Zero-centred profile of length `period` (empty when the series is too short)
    pub seasonal: Vec<f64>,
    pub residual: Vec<f64>,
    pub period: usize,
}

impl Decomposition {
    pub fn seasonal_at(&self, index: usize) -> f64 {
        if self.seasonal.is_empty() {
            0.0
        } else {
            self.seasonal[index % self.seasonal.len()]
        }
    }
}

/// Centered moving-average trend plus period-indexed seasonal means
pub fn decompose(values: &[f64], period: usize) -> Decomposition {
    let n = values.len();
    let seasonal_enabled = period >= 2 && n >= 2 * period;
    let window = if seasonal_enabled { period } else { n.clamp(1, 5) };
    let half = window / 2;

    let trend: Vec<f64> = (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half).min(n.saturating_sub(1));
            mean(&values[lo..=hi])
        })
        .collect();

    let seasonal = if seasonal_enabled {
        let mut sums = vec![0.0; period];
        let mut counts = vec![0usize; period];
        for (i, (v, t)) in values.iter().zip(trend.iter()).enumerate() {
            sums[i % period] += v - t;
            counts[i % period] += 1;
        }
        let raw: Vec<f64> = sums
            .iter()
            .zip(counts.iter())
            .map(|(s, c)| if *c == 0 { 0.0 } else { s / *c as f64 })
            .collect();
        let offset = mean(&raw);
        raw.iter().map(|s| s - offset).collect()
    } else {
        Vec::new()
    };

    let mut decomposition = Decomposition {
        trend,
        seasonal,
        residual: Vec::new(),
        period: if seasonal_enabled { period } else { 0 },
    };
    decomposition.residual = values
        .iter()
        .enumerate()
        .map(|(i, v)| v - decomposition.trend[i] - decomposition.seasonal_at(i))
        .collect();
    decomposition
}

/// A forecasting model fitted from scratch on each call
pub trait ForecastModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fit on `history` and predict the next `horizon` values
    fn predict(&self, history: &[f64], horizon: usize) -> Vec<f64>;
}

/// Additive Holt-Winters; Holt linear below two full seasons
pub struct HoltWinters {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub period: usize,
}

impl ForecastModel for HoltWinters {
    fn name(&self) -> &'static str {
        "holt_winters"
    }

    fn predict(&self, history: &[f64], horizon: usize) -> Vec<f64> {
        let n = history.len();
        if n == 0 {
            return vec![0.0; horizon];
        }
        if n == 1 {
            return vec![history[0]; horizon];
        }

        let p = self.period;
        if p >= 2 && n >= 2 * p {
            let mut level = mean(&history[..p]);
            let mut trend = (mean(&history[p..2 * p]) - level) / p as f64;
            let mut season: Vec<f64> = history[..p].iter().map(|v| v - level).collect();

            for (t, &value) in history.iter().enumerate().skip(p) {
                let s = season[t % p];
                let prev_level = level;
                level = self.alpha * (value - s) + (1.0 - self.alpha) * (level + trend);
                trend = self.beta * (level - prev_level) + (1.0 - self.beta) * trend;
                season[t % p] = self.gamma * (value - level) + (1.0 - self.gamma) * s;
            }

            (1..=horizon)
                .map(|h| level + h as f64 * trend + season[(n + h - 1) % p])
                .collect()
        } else {
            let mut level = history[0];
            let mut trend = history[1] - history[0];
            for &value in &history[1..] {
                let prev_level = level;
                level = self.alpha * value + (1.0 - self.alpha) * (level + trend);
                trend = self.beta * (level - prev_level) + (1.0 - self.beta) * trend;
            }
            (1..=horizon).map(|h| level + h as f64 * trend).collect()
        }
    }
}

/// Least-squares AR(p) with intercept, plus an MA(1) term on the last residual
pub struct AutoRegressive {
    pub order: usize,
}

impl ForecastModel for AutoRegressive {
    fn name(&self) -> &'static str {
        "ar_ma"
    }

    fn predict(&self, history: &[f64], horizon: usize) -> Vec<f64> {
        let n = history.len();
        let fallback = vec![mean(history); horizon];
        // need a few more equations than unknowns
        let order = self.order.min(n.saturating_sub(2) / 3);
        if order == 0 {
            return fallback;
        }

        // normal equations for [c, φ1..φp]
        let dim = order + 1;
        let mut xtx = vec![vec![0.0; dim]; dim];
        let mut xty = vec![0.0; dim];
        for t in order..n {
            let mut row = Vec::with_capacity(dim);
            row.push(1.0);
            row.extend((1..=order).map(|lag| history[t - lag]));
            for i in 0..dim {
                xty[i] += row[i] * history[t];
                for j in 0..dim {
                    xtx[i][j] += row[i] * row[j];
                }
            }
        }
        // small ridge term; lags of a trending series are collinear
        for (i, row) in xtx.iter_mut().enumerate() {
            row[i] += 1e-6;
        }
        let Some(coef) = solve_linear(xtx, xty) else {
            return fallback;
        };

        let fitted = |series: &[f64], t: usize| -> f64 {
            coef[0] + (1..=order).map(|lag| coef[lag] * series[t - lag]).sum::<f64>()
        };
        let residuals: Vec<f64> = (order..n).map(|t| history[t] - fitted(history, t)).collect();
        let theta = lag_one_autocorrelation(&residuals).clamp(-0.9, 0.9);
        let last_residual = residuals.last().copied().unwrap_or(0.0);

        let mut extended = history.to_vec();
        let mut out = Vec::with_capacity(horizon);
        for h in 0..horizon {
            let t = extended.len();
            let ma = if h == 0 { theta * last_residual } else { 0.0 };
            let next = fitted(&extended, t) + ma;
            let next = if next.is_finite() { next } else { mean(history) };
            extended.push(next);
            out.push(next);
        }
        out
    }
}

fn lag_one_autocorrelation(values: &[f64]) -> f64 {
    if values.len() < 3 {
        return 0.0;
    }
    let m = mean(values);
    let denom: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    if denom < 1e-12 {
        return 0.0;
    }
    let num: f64 = values.windows(2).map(|w| (w[0] - m) * (w[1] - m)).sum();
    num / denom
}

/// Linear extrapolation of the recent trend plus the seasonal profile
pub struct DecompositionModel {
    pub period: usize,
}

impl ForecastModel for DecompositionModel {
    fn name(&self) -> &'static str {
        "decomposition"
    }

    fn predict(&self, history: &[f64], horizon: usize) -> Vec<f64> {
        let n = history.len();
        if n == 0 {
            return vec![0.0; horizon];
        }
        let parts = decompose(history, self.period);
        let tail_len = (2 * self.period).clamp(4, n.max(4)).min(n);
        let tail = &parts.trend[n - tail_len..];
        let (slope, intercept) = linear_fit(tail);
        let last_x = (tail_len - 1) as f64;

        (1..=horizon)
            .map(|h| intercept + slope * (last_x + h as f64) + parts.seasonal_at(n + h - 1))
            .collect()
    }
}

/// Averages what followed the `k` past windows most similar to the latest one
pub struct AnalogRegressor {
    pub window: usize,
    pub k: usize,
}

impl ForecastModel for AnalogRegressor {
    fn name(&self) -> &'static str {
        "analog"
    }

    fn predict(&self, history: &[f64], horizon: usize) -> Vec<f64> {
        let mut series = history.to_vec();
        let mut out = Vec::with_capacity(horizon);
        for _ in 0..horizon {
            let next = self.step(&series);
            series.push(next);
            out.push(next);
        }
        out
    }
}

impl AnalogRegressor {
    fn step(&self, series: &[f64]) -> f64 {
        let n = series.len();
        let w = self.window;
        if n <= w + 1 {
            return series.last().copied().unwrap_or(0.0);
        }

        let current = &series[n - w..];
        let current_last = current[w - 1];
        // candidate windows must be followed by a known value
        let mut candidates: Vec<(f64, f64)> = (0..n - w)
            .map(|start| {
                let window = &series[start..start + w];
                let offset = current_last - window[w - 1];
                let distance: f64 = window
                    .iter()
                    .zip(current.iter())
                    .map(|(a, b)| (a + offset - b).powi(2))
                    .sum();
                let delta = series[start + w] - window[w - 1];
                (distance, delta)
            })
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        let deltas: Vec<f64> = candidates.iter().take(self.k.max(1)).map(|c| c.1).collect();
        current_last + mean(&deltas)
    }
}

/// Default model set for `config`
pub fn default_models(config: &ForecastConfig) -> Vec<Box<dyn ForecastModel>> {
    vec![
        Box::new(HoltWinters {
            alpha: config.alpha,
            beta: config.beta,
            gamma: config.gamma,
            period: config.seasonal_period,
        }),
        Box::new(AutoRegressive {
            order: config.ar_order,
        }),
        Box::new(DecompositionModel {
            period: config.seasonal_period,
        }),
        Box::new(AnalogRegressor { window: 4, k: 3 }),
    ]
}

/// Accuracy metrics of `predicted` against `actual`
///
/// `naive_scale` is the in-sample MAE of the last-value forecast.
pub fn accuracy(actual: &[f64], predicted: &[f64], naive_scale: f64) -> ForecastAccuracy {
    let errors: Vec<f64> = actual.iter().zip(predicted.iter()).map(|(a, p)| a - p).collect();
    if errors.is_empty() {
        return ForecastAccuracy::default();
    }

    let mae = mean(&errors.iter().map(|e| e.abs()).collect::<Vec<_>>());
    let rmse = mean(&errors.iter().map(|e| e * e).collect::<Vec<_>>()).sqrt();
    let pct: Vec<f64> = actual
        .iter()
        .zip(errors.iter())
        .filter(|(a, _)| a.abs() > 1e-12)
        .map(|(a, e)| (e / a).abs() * 100.0)
        .collect();
    let mase = if naive_scale > 1e-12 {
        mae / naive_scale
    } else if mae < 1e-12 {
        0.0
    } else {
        mae / 1e-12
    };

    ForecastAccuracy {
        mae,
        rmse,
        mape: mean(&pct),
        mase,
        samples: errors.len(),
    }
}

fn naive_mae(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    mean(&values.windows(2).map(|w| (w[1] - w[0]).abs()).collect::<Vec<_>>())
}

/// Typical spacing between observations (median gap), 60s when unknown
fn step_size(timestamps: &[DateTime<Utc>]) -> ChronoDuration {
    let mut gaps: Vec<i64> = timestamps
        .windows(2)
        .map(|w| (w[1] - w[0]).num_milliseconds())
        .filter(|g| *g > 0)
        .collect();
    if gaps.is_empty() {
        return ChronoDuration::seconds(60);
    }
    gaps.sort_unstable();
    ChronoDuration::milliseconds(gaps[gaps.len() / 2])
}

fn clamp_score(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.5
    }
}

/// Forecast `horizon` steps of a (timestamp, score) series
pub fn forecast_series(
    source_id: &str,
    series: &[(DateTime<Utc>, f64)],
    horizon: usize,
    config: &ForecastConfig,
) -> Forecast {
    let timestamps: Vec<DateTime<Utc>> = series.iter().map(|(t, _)| *t).collect();
    let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
    let step = step_size(&timestamps);
    let last_ts = timestamps.last().copied().unwrap_or_else(Utc::now);
    let n = values.len();

    if n < config.min_history {
        return neutral_forecast(source_id, &values, last_ts, step, horizon);
    }

    let models = default_models(config);
    let holdout = horizon.clamp(1, (n / 4).max(1));
    let (train, test) = values.split_at(n - holdout);

    let backtests: Vec<Vec<f64>> = models.iter().map(|m| m.predict(train, holdout)).collect();
    let inverse_mae: Vec<f64> = backtests
        .iter()
        .map(|predicted| {
            let mae = accuracy(test, predicted, 1.0).mae;
            if mae.is_finite() {
                1.0 / (mae + 1e-6)
            } else {
                0.0
            }
        })
        .collect();
    let total: f64 = inverse_mae.iter().sum();
    let weights: Vec<f64> = if total > 0.0 {
        inverse_mae.iter().map(|w| w / total).collect()
    } else {
        vec![1.0 / models.len() as f64; models.len()]
    };

    let blend = |predictions: &[Vec<f64>], len: usize| -> Vec<f64> {
        (0..len)
            .map(|i| {
                predictions
                    .iter()
                    .zip(weights.iter())
                    .map(|(p, w)| w * p.get(i).copied().filter(|v| v.is_finite()).unwrap_or(0.0))
                    .sum()
            })
            .collect()
    };

    let backtest_blend = blend(&backtests, holdout);
    let metrics = accuracy(test, &backtest_blend, naive_mae(train));

    let futures: Vec<Vec<f64>> = models.iter().map(|m| m.predict(&values, horizon)).collect();
    let predicted = blend(&futures, horizon);

    let residual_sd = std_dev(&decompose(&values, config.seasonal_period).residual);
    let sigma = if metrics.rmse > 1e-9 { metrics.rmse } else { residual_sd.max(1e-3) };

    let points = predicted
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let h = (i + 1) as f64;
            let value = clamp_score(*v);
            let half_width = Z_95 * sigma * h.sqrt();
            ForecastPoint {
                timestamp: last_ts + step * (i as i32 + 1),
                value,
                lower: clamp_score(value - half_width),
                upper: clamp_score(value + half_width),
            }
        })
        .collect();

    let volume = n as f64 / (n as f64 + 20.0);
    let confidence = (volume / (1.0 + metrics.mase)).clamp(0.0, 1.0);

    Forecast {
        source_id: source_id.to_string(),
        generated_at: Utc::now(),
        points,
        accuracy: metrics,
        confidence,
        model_weights: models
            .iter()
            .zip(weights.iter())
            .map(|(m, w)| (m.name().to_string(), *w))
            .collect(),
    }
}

fn neutral_forecast(
    source_id: &str,
    values: &[f64],
    last_ts: DateTime<Utc>,
    step: ChronoDuration,
    horizon: usize,
) -> Forecast {
    let level = if values.is_empty() { 0.5 } else { clamp_score(mean(values)) };
    let sigma = if values.len() >= 2 { std_dev(values).max(0.05) } else { 0.25 };

    let points = (0..horizon)
        .map(|i| {
            let half_width = Z_95 * sigma * ((i + 1) as f64).sqrt();
            ForecastPoint {
                timestamp: last_ts + step * (i as i32 + 1),
                value: level,
                lower: clamp_score(level - half_width),
                upper: clamp_score(level + half_width),
            }
        })
        .collect();

    Forecast {
        source_id: source_id.to_string(),
        generated_at: Utc::now(),
        points,
        accuracy: ForecastAccuracy::default(),
        confidence: 0.0,
        model_weights: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: &[f64]) -> Vec<(DateTime<Utc>, f64)> {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (start + ChronoDuration::minutes(i as i64), *v))
            .collect()
    }

    fn seasonal_series(n: usize, period: usize) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let phase = (i % period) as f64 / period as f64 * std::f64::consts::TAU;
                0.5 + 0.1 * phase.sin() + 0.001 * i as f64
            })
            .collect()
    }

    #[test]
    fn test_decompose_recovers_seasonality() {
        let values = seasonal_series(96, 12);
        let parts = decompose(&values, 12);
        assert_eq!(parts.period, 12);
        assert_eq!(parts.seasonal.len(), 12);
        assert!(mean(&parts.seasonal).abs() < 1e-9);
        // peak of sin at a quarter period
        let peak = parts
            .seasonal
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert!((2..=4).contains(&peak));
    }

    #[test]
    fn test_decompose_short_series_has_no_season() {
        let parts = decompose(&[0.1, 0.2, 0.3], 24);
        assert!(parts.seasonal.is_empty());
        assert_eq!(parts.residual.len(), 3);
    }

    #[test]
    fn test_models_follow_linear_trend() {
        let values: Vec<f64> = (0..40).map(|i| 0.1 + 0.01 * i as f64).collect();
        let expected = 0.1 + 0.01 * 40.0;
        let config = ForecastConfig::default();
        for model in default_models(&config) {
            let next = model.predict(&values, 1)[0];
            assert!(
                (next - expected).abs() < 0.05,
                "{} predicted {} expected {}",
                model.name(),
                next,
                expected
            );
        }
    }

    #[test]
    fn test_short_history_is_neutral() {
        let forecast = forecast_series("s", &series(&[0.4, 0.6]), 5, &ForecastConfig::default());
        assert_eq!(forecast.points.len(), 5);
        assert_eq!(forecast.confidence, 0.0);
        assert!((forecast.points[0].value - 0.5).abs() < 1e-9);
        assert_eq!(forecast.accuracy.samples, 0);

        let empty = forecast_series("s", &[], 3, &ForecastConfig::default());
        assert_eq!(empty.points.len(), 3);
    }

    #[test]
    fn test_forecast_carries_accuracy_and_growing_intervals() {
        let values = seasonal_series(120, 24);
        let forecast = forecast_series("s", &series(&values), 6, &ForecastConfig::default());

        assert_eq!(forecast.points.len(), 6);
        assert!(forecast.accuracy.samples > 0);
        assert!(forecast.accuracy.mae.is_finite());
        assert!(forecast.confidence > 0.0 && forecast.confidence <= 1.0);
        assert!((forecast.model_weights.values().sum::<f64>() - 1.0).abs() < 1e-9);

        let first = &forecast.points[0];
        let last = &forecast.points[5];
        assert!(first.lower <= first.value && first.value <= first.upper);
        assert!(last.upper - last.lower >= first.upper - first.lower);
        assert!(last.timestamp > first.timestamp);
    }

    #[test]
    fn test_accuracy_metrics() {
        let acc = accuracy(&[1.0, 2.0], &[1.5, 2.5], 1.0);
        assert!((acc.mae - 0.5).abs() < 1e-12);
        assert!((acc.rmse - 0.5).abs() < 1e-12);
        assert!((acc.mape - 37.5).abs() < 1e-9);
        assert!((acc.mase - 0.5).abs() < 1e-12);
        assert_eq!(acc.samples, 2);
    }
}
