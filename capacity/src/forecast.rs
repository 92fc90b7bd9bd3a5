use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::error::CapacityError;
use crate::types::{Forecast, ForecastModel, QueueMetrics};

const EWMA_ALPHA: f64 = 0.3;
const EWMA_GRANULARITY: Duration = Duration::from_secs(300);
const LINEAR_GRANULARITY: Duration = Duration::from_secs(300);
const HW_GRANULARITY: Duration = Duration::from_secs(3_600);
const SEASONAL_GRANULARITY: Duration = Duration::from_secs(3_600);

/// Seasonal period for Holt-Winters: one day of hourly points.
const HW_SEASON: usize = 24;
/// Minimum history (two full seasons) before Holt-Winters engages.
const HW_MIN_POINTS: usize = 48;

/// Produce a time-ordered forecast sequence over `horizon`.
///
/// Sequence length is `horizon / granularity` (model-specific granularity);
/// arrival rates are clamped to be non-negative. Errors on empty history and
/// on a single sample.
pub fn forecast(
    history: &[QueueMetrics],
    model: ForecastModel,
    horizon: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<Forecast>, CapacityError> {
    if history.is_empty() {
        return Err(CapacityError::NoHistory);
    }
    if history.len() < 2 {
        return Err(CapacityError::InsufficientHistory {
            needed: 2,
            got: history.len(),
        });
    }

    match model {
        ForecastModel::Ewma => ewma(history, horizon, now),
        ForecastModel::Linear => linear(history, horizon, now),
        ForecastModel::HoltWinters => holt_winters(history, horizon, now),
        ForecastModel::Seasonal => seasonal(history, horizon, now),
    }
}

fn rates(history: &[QueueMetrics]) -> Vec<f64> {
    history.iter().map(|m| m.arrival_rate.max(0.0)).collect()
}

/// `clamp(1 - MAPE, 0.1, 0.95)` over one-step-ahead in-sample predictions.
fn mape_confidence(actual: &[f64], predicted: &[f64]) -> f64 {
    let mut total = 0.0;
    let mut n = 0usize;
    for (a, p) in actual.iter().zip(predicted.iter()) {
        if *a > 0.0 {
            total += (a - p).abs() / a;
            n += 1;
        }
    }
    if n == 0 {
        return 0.1;
    }
    (1.0 - total / n as f64).clamp(0.1, 0.95)
}

fn emit(
    now: DateTime<Utc>,
    granularity: Duration,
    horizon: Duration,
    model: ForecastModel,
    confidence: f64,
    band: f64,
    value_at: impl Fn(usize) -> f64,
) -> Vec<Forecast> {
    let steps = (horizon.as_secs() / granularity.as_secs().max(1)) as usize;
    (0..steps)
        .map(|i| {
            let rate = value_at(i).max(0.0);
            Forecast {
                timestamp: now + chrono::Duration::seconds(((i + 1) as u64 * granularity.as_secs()) as i64),
                arrival_rate: rate,
                confidence,
                lower: (rate * (1.0 - band)).max(0.0),
                upper: rate * (1.0 + band),
                model,
            }
        })
        .collect()
}

/// Constant forecast at the exponentially-weighted mean.
fn ewma(
    history: &[QueueMetrics],
    horizon: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<Forecast>, CapacityError> {
    let xs = rates(history);

    let mut level = xs[0];
    let mut predictions = Vec::with_capacity(xs.len());
    for x in &xs {
        predictions.push(level);
        level = EWMA_ALPHA * x + (1.0 - EWMA_ALPHA) * level;
    }

    let confidence = mape_confidence(&xs, &predictions);
    Ok(emit(
        now,
        EWMA_GRANULARITY,
        horizon,
        ForecastModel::Ewma,
        confidence,
        0.20,
        move |_| level,
    ))
}

fn least_squares(xs: &[f64]) -> (f64, f64, f64) {
    let n = xs.len() as f64;
    let mean_i = (n - 1.0) / 2.0;
    let mean_y = xs.iter().sum::<f64>() / n;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (i, y) in xs.iter().enumerate() {
        let di = i as f64 - mean_i;
        let dy = y - mean_y;
        sxy += di * dy;
        sxx += di * di;
        syy += dy * dy;
    }

    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let intercept = mean_y - slope * mean_i;
    let r2 = if syy > 0.0 { (sxy * sxy) / (sxx * syy) } else { 0.0 };
    (slope, intercept, r2)
}

/// Least-squares trend line; confidence is R² floored at 0.1.
fn linear(
    history: &[QueueMetrics],
    horizon: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<Forecast>, CapacityError> {
    let xs = rates(history);
    let (slope, intercept, r2) = least_squares(&xs);
    let confidence = r2.max(0.1).min(0.95);

    let n = xs.len() as f64;
    Ok(emit(
        now,
        LINEAR_GRANULARITY,
        horizon,
        ForecastModel::Linear,
        confidence,
        0.10,
        move |i| intercept + slope * (n + i as f64),
    ))
}

/// Additive level + trend + daily seasonality; falls back to EWMA when the
/// history is shorter than two seasons.
fn holt_winters(
    history: &[QueueMetrics],
    horizon: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<Forecast>, CapacityError> {
    let xs = rates(history);
    if xs.len() < HW_MIN_POINTS {
        return ewma(history, horizon, now);
    }

    let (alpha, beta, gamma) = (0.3, 0.1, 0.2);
    let m = HW_SEASON;

    let season1_mean = xs[..m].iter().sum::<f64>() / m as f64;
    let season2_mean = xs[m..2 * m].iter().sum::<f64>() / m as f64;

    let mut level = season1_mean;
    let mut trend = (season2_mean - season1_mean) / m as f64;
    let mut seasonal: Vec<f64> = xs[..m].iter().map(|x| x - season1_mean).collect();

    let mut predictions = Vec::with_capacity(xs.len());
    for (i, x) in xs.iter().enumerate() {
        let s = seasonal[i % m];
        predictions.push(level + trend + s);

        let prev_level = level;
        level = alpha * (x - s) + (1.0 - alpha) * (level + trend);
        trend = beta * (level - prev_level) + (1.0 - beta) * trend;
        seasonal[i % m] = gamma * (x - level) + (1.0 - gamma) * s;
    }

    let confidence = mape_confidence(&xs, &predictions);
    let n = xs.len();
    Ok(emit(
        now,
        HW_GRANULARITY,
        horizon,
        ForecastModel::HoltWinters,
        confidence,
        0.30,
        move |i| {
            let h = i + 1;
            level + h as f64 * trend + seasonal[(n + h - 1) % m]
        },
    ))
}

fn coefficient_of_variation(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    var.sqrt() / mean
}

/// Extract daily-hour and weekday multiplicative patterns, keep whichever
/// varies more, forecast the deseasonalized residual linearly, then reapply
/// the pattern at each forecast timestamp.
fn seasonal(
    history: &[QueueMetrics],
    horizon: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<Forecast>, CapacityError> {
    let xs = rates(history);
    let overall = xs.iter().sum::<f64>() / xs.len() as f64;
    if overall <= 0.0 {
        return ewma(history, horizon, now);
    }

    let mut by_hour: [(f64, usize); 24] = [(0.0, 0); 24];
    let mut by_weekday: [(f64, usize); 7] = [(0.0, 0); 7];
    for (m, x) in history.iter().zip(xs.iter()) {
        let h = m.timestamp.hour() as usize;
        by_hour[h].0 += x;
        by_hour[h].1 += 1;

        let d = m.timestamp.weekday().num_days_from_monday() as usize;
        by_weekday[d].0 += x;
        by_weekday[d].1 += 1;
    }

    let factors = |bins: &[(f64, usize)]| -> Vec<f64> {
        bins.iter()
            .map(|(sum, n)| {
                if *n == 0 {
                    1.0
                } else {
                    ((sum / *n as f64) / overall).max(1e-6)
                }
            })
            .collect()
    };

    let hour_factors = factors(&by_hour);
    let weekday_factors = factors(&by_weekday);

    let use_hourly =
        coefficient_of_variation(&hour_factors) >= coefficient_of_variation(&weekday_factors);

    let factor_of = |ts: &DateTime<Utc>| -> f64 {
        if use_hourly {
            hour_factors[ts.hour() as usize]
        } else {
            weekday_factors[ts.weekday().num_days_from_monday() as usize]
        }
    };

    let residual: Vec<f64> = history
        .iter()
        .zip(xs.iter())
        .map(|(m, x)| x / factor_of(&m.timestamp))
        .collect();

    let (slope, intercept, _) = least_squares(&residual);

    // In-sample reconstruction for the confidence estimate.
    let predictions: Vec<f64> = history
        .iter()
        .enumerate()
        .map(|(i, m)| (intercept + slope * i as f64) * factor_of(&m.timestamp))
        .collect();
    let confidence = mape_confidence(&xs, &predictions);

    let n = xs.len() as f64;
    let granularity = SEASONAL_GRANULARITY;
    Ok(emit(
        now,
        granularity,
        horizon,
        ForecastModel::Seasonal,
        confidence,
        0.20,
        move |i| {
            let ts = now + chrono::Duration::seconds(((i + 1) as u64 * granularity.as_secs()) as i64);
            (intercept + slope * (n + i as f64)) * factor_of(&ts)
        },
    ))
}
