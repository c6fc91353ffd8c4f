//! Forecast generation for the `forecasts` table.
//!
//! A [`ForecastProvider`] is opaque to the rest of the engine: it takes a
//! yearly series and a horizon and hands back `(year, value)` pairs. The
//! results go through the normal schema guard and batch loader.

use warehouse::{Record, Value};

/// `entity_type` written for company revenue forecasts.
pub const COMPANY_REVENUE: &str = "company_revenue";

/// Years forecast past the last observation when nothing else is configured.
pub const DEFAULT_HORIZON: usize = 5;

/// A forecasting model.
pub trait ForecastProvider: Send + Sync {
    /// Value stored in `model_used`.
    fn name(&self) -> &str;

    /// Predict `horizon` years following the last year of `series`.
    /// `series` is sorted by year. May return fewer points (or none) when the
    /// series is too short for the model.
    fn forecast(&self, series: &[(i64, f64)], horizon: usize) -> Vec<(i64, f64)>;
}

/// Ordinary least squares over year, predictions clamped at zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearTrend;

impl ForecastProvider for LinearTrend {
    fn name(&self) -> &str {
        "Linear Regression"
    }

    fn forecast(&self, series: &[(i64, f64)], horizon: usize) -> Vec<(i64, f64)> {
        let Some(&(last_year, _)) = series.last() else {
            return Vec::new();
        };
        if series.len() < 2 || horizon == 0 {
            return Vec::new();
        }

        let n = series.len() as f64;
        let mean_x = series.iter().map(|(x, _)| *x as f64).sum::<f64>() / n;
        let mean_y = series.iter().map(|(_, y)| *y).sum::<f64>() / n;

        let (sxy, sxx) = series.iter().fold((0.0, 0.0), |(sxy, sxx), (x, y)| {
            let dx = *x as f64 - mean_x;
            (sxy + dx * (y - mean_y), sxx + dx * dx)
        });
        // Every point in the same year: no trend to fit, carry the mean.
        let slope = if sxx == 0.0 { 0.0 } else { sxy / sxx };
        let intercept = mean_y - slope * mean_x;

        (1..=horizon as i64)
            .map(|step| {
                let year = last_year + step;
                (year, (intercept + slope * year as f64).max(0.0))
            })
            .collect()
    }
}

/// Build `forecasts` rows from a provider's output.
pub fn forecast_records(
    provider: &dyn ForecastProvider,
    entity_type: &str,
    entity_name: &str,
    series: &[(i64, f64)],
    horizon: usize,
) -> Vec<Record> {
    provider
        .forecast(series, horizon)
        .into_iter()
        .map(|(year, value)| {
            Record::new()
                .with("entity_type", entity_type)
                .with("entity_name", entity_name)
                .with("year", year)
                .with("forecast_value", value)
                .with("model_used", provider.name())
        })
        .collect()
}

/// Extract a `(year, revenue_usd)` series from `company_financials` rows,
/// skipping rows without revenue, sorted by year.
pub fn revenue_series(rows: &[Record]) -> Vec<(i64, f64)> {
    let mut series: Vec<(i64, f64)> = rows
        .iter()
        .filter_map(|r| {
            let year = r.get("year").and_then(Value::as_i64)?;
            let revenue = r.get("revenue_usd").and_then(Value::as_f64)?;
            Some((year, revenue))
        })
        .collect();
    series.sort_by_key(|(year, _)| *year);
    series
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_a_straight_line() {
        let series = [(2020, 100.0), (2021, 110.0), (2022, 120.0)];
        let out = LinearTrend.forecast(&series, 3);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].0, 2023);
        assert!((out[0].1 - 130.0).abs() < 1e-6);
        assert!((out[2].1 - 150.0).abs() < 1e-6);
    }

    #[test]
    fn declining_trend_is_clamped_at_zero() {
        let series = [(2020, 30.0), (2021, 20.0), (2022, 10.0)];
        let out = LinearTrend.forecast(&series, 3);
        assert_eq!(out[0].1, 0.0);
        assert!(out.iter().all(|(_, v)| *v >= 0.0));
    }

    #[test]
    fn needs_two_points() {
        assert!(LinearTrend.forecast(&[(2022, 10.0)], 5).is_empty());
        assert!(LinearTrend.forecast(&[], 5).is_empty());
    }

    #[test]
    fn records_carry_model_and_entity() {
        let rows = forecast_records(
            &LinearTrend,
            COMPANY_REVENUE,
            "Apple",
            &[(2022, 1.0), (2023, 2.0)],
            2,
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("model_used"), Some(&Value::from("Linear Regression")));
        assert_eq!(rows[1].get("year"), Some(&Value::Int(2025)));
    }

    #[test]
    fn revenue_series_skips_gaps_and_sorts() {
        let rows = vec![
            Record::new().with("year", 2023).with("revenue_usd", 5.0),
            Record::new().with("year", 2021).with("revenue_usd", 3),
            Record::new().with("year", 2022).with("revenue_usd", Value::Null),
        ];
        assert_eq!(revenue_series(&rows), vec![(2021, 3.0), (2023, 5.0)]);
    }
}
