/// Canonical column names shared by every domain.
pub const ENTITY: &str = "location";
pub const DATE: &str = "date";
pub const SOURCE_URL: &str = "source_url";
pub const VACCINE: &str = "vaccine";

// Vaccination counters
pub const TOTAL_VACCINATIONS: &str = "total_vaccinations";
pub const PEOPLE_VACCINATED: &str = "people_vaccinated";
pub const PEOPLE_FULLY_VACCINATED: &str = "people_fully_vaccinated";
pub const TOTAL_BOOSTERS: &str = "total_boosters";

// Case and death counters
pub const TOTAL_CASES: &str = "total_cases";
pub const TOTAL_DEATHS: &str = "total_deaths";

/// Separator used when a set of vaccine names is rendered into one field.
pub const VACCINE_SEPARATOR: &str = ", ";

/// Joins an indicator and a category into a breakdown column name,
/// e.g. `total_vaccinations:Moderna`.
pub const BREAKDOWN_SEPARATOR: &str = ":";

/// Default `chrono` format for date columns in source extracts.
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";
