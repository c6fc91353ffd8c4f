//! Built-in warehouse tables.

use warehouse::{Column, SpecError, TableSpec};

use crate::LoadMode;

pub const COMPANY_FINANCIALS: &str = "company_financials";
pub const MACRO_INDICATORS: &str = "macro_indicators";
pub const COUNTRIES: &str = "countries";
pub const FORECASTS: &str = "forecasts";

/// Annual revenue and net income per company.
pub fn company_financials() -> Result<TableSpec, SpecError> {
    TableSpec::new(
        COMPANY_FINANCIALS,
        vec![
            Column::text("company"),
            Column::integer("year"),
            Column::double("revenue_usd"),
            Column::double("net_income_usd"),
        ],
        ["company", "year"],
    )
}

/// One indicator value per country and year.
pub fn macro_indicators() -> Result<TableSpec, SpecError> {
    TableSpec::new(
        MACRO_INDICATORS,
        vec![
            Column::text("country_code"),
            Column::integer("year"),
            Column::text("indicator"),
            Column::double("value"),
            Column::text("source"),
        ],
        ["country_code", "year", "indicator"],
    )
}

/// Country code to name reference table.
pub fn countries() -> Result<TableSpec, SpecError> {
    TableSpec::new(
        COUNTRIES,
        vec![Column::text("country_code"), Column::text("country_name")],
        ["country_code"],
    )
}

pub fn forecasts() -> Result<TableSpec, SpecError> {
    TableSpec::new(
        FORECASTS,
        vec![
            Column::text("entity_type"),
            Column::text("entity_name"),
            Column::integer("year"),
            Column::double("forecast_value"),
            Column::text("model_used"),
        ],
        ["entity_type", "entity_name", "year", "model_used"],
    )
}

/// Look up a built-in table by name, case-insensitively.
pub fn lookup(name: &str) -> Option<Result<TableSpec, SpecError>> {
    match name.to_ascii_lowercase().as_str() {
        COMPANY_FINANCIALS => Some(company_financials()),
        MACRO_INDICATORS => Some(macro_indicators()),
        COUNTRIES => Some(countries()),
        FORECASTS => Some(forecasts()),
        _ => None,
    }
}

/// The mode a built-in table is normally loaded with.
pub fn default_mode(name: &str) -> LoadMode {
    if name.eq_ignore_ascii_case(COUNTRIES) {
        LoadMode::TruncateThenLoad
    } else {
        LoadMode::Merge
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_spec_is_valid() {
        for name in [COMPANY_FINANCIALS, MACRO_INDICATORS, COUNTRIES, FORECASTS] {
            let spec = lookup(name).unwrap().unwrap();
            assert_eq!(spec.name(), name);
        }
        assert!(lookup("COMPANY_FINANCIALS").is_some());
        assert!(lookup("unknown").is_none());
    }

    #[test]
    fn keys_match_the_merge_contract() {
        assert_eq!(company_financials().unwrap().key(), ["company", "year"]);
        assert_eq!(
            macro_indicators().unwrap().key(),
            ["country_code", "year", "indicator"]
        );
        assert_eq!(
            forecasts().unwrap().key(),
            ["entity_type", "entity_name", "year", "model_used"]
        );
    }

    #[test]
    fn countries_is_a_reference_table() {
        assert_eq!(default_mode(COUNTRIES), LoadMode::TruncateThenLoad);
        assert_eq!(default_mode(COMPANY_FINANCIALS), LoadMode::Merge);
    }
}
