//! Row normalizer: raw text row -> typed record
//!
//! Pure over its inputs. Empty values are dropped rather than stored,
//! integer and timestamp fields are coerced, the city field loses its
//! estimate annotation, and (when enabled) a geohash is derived from the
//! coordinate fields.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{IngestError, MalformedValueError, Result};
use crate::schema::{FieldType, PartitionSchema};
use crate::types::{NormalizedRecord, SourceRecord, Value};

pub const DEFAULT_GEOHASH_PRECISION: usize = 8;

/// Longest geohash the encoder produces
pub const MAX_GEOHASH_PRECISION: usize = 12;
pub const DEFAULT_CITY_FIELD: &str = "City";
pub const DEFAULT_CITY_SUFFIX: &str = " (EST.)";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d", "%Y/%m/%d"];

/// Where coordinates come from and where the derived hash goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeohashOptions {
    pub latitude_field: String,
    pub longitude_field: String,
    pub output_field: String,
    pub precision: usize,
}

impl Default for GeohashOptions {
    fn default() -> Self {
        Self {
            latitude_field: "Residence_Addresses_Latitude".to_string(),
            longitude_field: "Residence_Addresses_Longitude".to_string(),
            output_field: "Residence_Addresses_GeoHash".to_string(),
            precision: DEFAULT_GEOHASH_PRECISION,
        }
    }
}

/// Domain cleanups applied after type coercion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeOptions {
    /// Geohash enrichment; `None` disables it
    pub geohash: Option<GeohashOptions>,
    pub city_field: String,
    pub city_suffix: String,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            geohash: None,
            city_field: DEFAULT_CITY_FIELD.to_string(),
            city_suffix: DEFAULT_CITY_SUFFIX.to_string(),
        }
    }
}

impl NormalizeOptions {
    pub fn with_geohash(mut self, options: GeohashOptions) -> Self {
        self.geohash = Some(options);
        self
    }
}

/// Normalizer bound to one partition schema
#[derive(Debug, Clone)]
pub struct RowNormalizer {
    schema: Arc<PartitionSchema>,
    options: NormalizeOptions,
}

impl RowNormalizer {
    /// Checks that an enabled geohash writes to a declared text field
    pub fn new(schema: Arc<PartitionSchema>, options: NormalizeOptions) -> Result<Self> {
        if let Some(ref geo) = options.geohash {
            match schema.field_type(&geo.output_field) {
                Some(FieldType::String) => {}
                Some(other) => {
                    return Err(IngestError::Schema(format!(
                        "geohash field '{}' must be a string, not {:?}",
                        geo.output_field, other
                    )))
                }
                None => {
                    return Err(IngestError::Schema(format!(
                        "geohash enrichment enabled but '{}' is not in the schema",
                        geo.output_field
                    )))
                }
            }
            if !(1..=MAX_GEOHASH_PRECISION).contains(&geo.precision) {
                return Err(IngestError::Schema(format!(
                    "geohash precision {} is out of range",
                    geo.precision
                )));
            }
        }
        Ok(Self { schema, options })
    }

    pub fn schema(&self) -> &Arc<PartitionSchema> {
        &self.schema
    }

    pub fn normalize(
        &self,
        raw: &SourceRecord,
    ) -> std::result::Result<NormalizedRecord, MalformedValueError> {
        normalize(raw, &self.schema, &self.options)
    }
}

/// Normalize one raw row against `schema`
pub fn normalize(
    raw: &SourceRecord,
    schema: &PartitionSchema,
    options: &NormalizeOptions,
) -> std::result::Result<NormalizedRecord, MalformedValueError> {
    let mut record = NormalizedRecord::new();

    for (name, value) in raw.iter() {
        let Some(field_type) = schema.field_type(name) else {
            continue;
        };
        let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
            continue;
        };

        let typed = match field_type {
            FieldType::Integer => Value::Integer(parse_integer(name, value)?),
            FieldType::Timestamp => Value::Timestamp(parse_timestamp(name, value)?),
            FieldType::String if name == options.city_field => {
                let cleaned = value.strip_suffix(options.city_suffix.as_str()).unwrap_or(value);
                if cleaned.trim().is_empty() {
                    continue;
                }
                Value::Text(cleaned.to_string())
            }
            FieldType::String => Value::Text(value.to_string()),
        };
        record.insert(name, typed);
    }

    if let Some(ref geo) = options.geohash {
        if let Some(hash) = derive_geohash(raw, geo)? {
            record.insert(geo.output_field.as_str(), Value::Text(hash));
        }
    }

    if let Some(missing) = schema.required_fields().find(|f| !record.contains(f)) {
        return Err(MalformedValueError::MissingRequired(missing.to_string()));
    }

    Ok(record)
}

fn derive_geohash(
    raw: &SourceRecord,
    options: &GeohashOptions,
) -> std::result::Result<Option<String>, MalformedValueError> {
    let non_empty = |field: &str| raw.get(field).map(str::trim).filter(|v| !v.is_empty());
    let (Some(lat), Some(lon)) = (
        non_empty(&options.latitude_field),
        non_empty(&options.longitude_field),
    ) else {
        return Ok(None);
    };

    let latitude = parse_coordinate(&options.latitude_field, lat)?;
    let longitude = parse_coordinate(&options.longitude_field, lon)?;

    let in_range = (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude);
    let coord = geohash::Coord {
        x: longitude,
        y: latitude,
    };
    in_range
        .then(|| geohash::encode(coord, options.precision).ok())
        .flatten()
        .map(Some)
        .ok_or_else(|| MalformedValueError::InvalidCoordinate {
            field: format!("{},{}", options.latitude_field, options.longitude_field),
            value: format!("{},{}", lat, lon),
        })
}

fn parse_coordinate(field: &str, value: &str) -> std::result::Result<f64, MalformedValueError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| MalformedValueError::InvalidCoordinate {
            field: field.to_string(),
            value: value.to_string(),
        })
}

/// Accepts plain integers and integral decimals such as "42.0"
fn parse_integer(field: &str, value: &str) -> std::result::Result<i64, MalformedValueError> {
    let trimmed = value.trim();
    if let Ok(v) = trimmed.parse::<i64>() {
        return Ok(v);
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 9.0e15 => Ok(v as i64),
        _ => Err(MalformedValueError::InvalidInteger {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Timestamps without an offset are taken as UTC; bare dates as midnight UTC
fn parse_timestamp(
    field: &str,
    value: &str,
) -> std::result::Result<DateTime<Utc>, MalformedValueError> {
    let trimmed = value.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(ts.and_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            if let Some(ts) = date.and_hms_opt(0, 0, 0) {
                return Ok(ts.and_utc());
            }
        }
    }

    Err(MalformedValueError::InvalidTimestamp {
        field: field.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::FieldSpec;
    use chrono::TimeZone;

    fn schema() -> Arc<PartitionSchema> {
        Arc::new(
            PartitionSchema::new(
                vec![
                    FieldSpec::new("LALVOTERID", FieldType::String),
                    FieldSpec::new("Voters_Age", FieldType::Integer),
                    FieldSpec::new("Voters_BirthDate", FieldType::Timestamp),
                    FieldSpec::new("City", FieldType::String),
                    FieldSpec::new("Residence_Addresses_Latitude", FieldType::String),
                    FieldSpec::new("Residence_Addresses_Longitude", FieldType::String),
                    FieldSpec::new("Residence_Addresses_GeoHash", FieldType::String),
                ],
                vec!["LALVOTERID".into()],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_empty_values_are_omitted() {
        let raw = SourceRecord::from_pairs([
            ("LALVOTERID", "LAL1"),
            ("Voters_Age", ""),
            ("City", "   "),
            ("Voters_BirthDate", ""),
        ]);
        let record = normalize(&raw, &schema(), &NormalizeOptions::default()).unwrap();

        assert_eq!(record.len(), 1);
        assert!(!record.contains("Voters_Age"));
        assert!(!record.contains("City"));
        assert!(record.iter().all(|(_, v)| v.as_text() != Some("")));
    }

    #[test]
    fn test_missing_columns_are_omitted() {
        let headers: Arc<[String]> = vec!["LALVOTERID".to_string(), "City".to_string()].into();
        let raw = SourceRecord::new(headers, vec![Some("LAL1".into()), None]);
        let record = normalize(&raw, &schema(), &NormalizeOptions::default()).unwrap();
        assert!(!record.contains("City"));
    }

    #[test]
    fn test_type_coercion() {
        let raw = SourceRecord::from_pairs([
            ("LALVOTERID", "LAL1"),
            ("Voters_Age", "42"),
            ("Voters_BirthDate", "1982-03-14"),
        ]);
        let record = normalize(&raw, &schema(), &NormalizeOptions::default()).unwrap();

        assert_eq!(record.get("Voters_Age"), Some(&Value::Integer(42)));
        assert_eq!(
            record.get("Voters_BirthDate"),
            Some(&Value::Timestamp(Utc.with_ymd_and_hms(1982, 3, 14, 0, 0, 0).unwrap()))
        );
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2020, 11, 3, 8, 30, 0).unwrap();
        assert_eq!(parse_timestamp("f", "2020-11-03T08:30:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("f", "2020-11-03 08:30:00").unwrap(), expected);
        assert_eq!(
            parse_timestamp("f", "11/03/2020").unwrap(),
            Utc.with_ymd_and_hms(2020, 11, 3, 0, 0, 0).unwrap()
        );
        assert!(parse_timestamp("f", "next tuesday").is_err());
    }

    #[test]
    fn test_integral_decimals_are_integers() {
        assert_eq!(parse_integer("f", "42.0").unwrap(), 42);
        assert_eq!(parse_integer("f", " -7 ").unwrap(), -7);
        assert!(parse_integer("f", "4.5").is_err());
        assert!(parse_integer("f", "forty").is_err());
    }

    #[test]
    fn test_malformed_integer_is_reported() {
        let raw = SourceRecord::from_pairs([("LALVOTERID", "LAL1"), ("Voters_Age", "old")]);
        let err = normalize(&raw, &schema(), &NormalizeOptions::default()).unwrap_err();
        assert_eq!(
            err,
            MalformedValueError::InvalidInteger {
                field: "Voters_Age".into(),
                value: "old".into()
            }
        );
    }

    #[test]
    fn test_missing_natural_key_rejects_row() {
        let raw = SourceRecord::from_pairs([("LALVOTERID", ""), ("City", "Fresno")]);
        let err = normalize(&raw, &schema(), &NormalizeOptions::default()).unwrap_err();
        assert_eq!(err, MalformedValueError::MissingRequired("LALVOTERID".into()));
    }

    #[test]
    fn test_city_suffix_is_stripped() {
        let raw = SourceRecord::from_pairs([("LALVOTERID", "LAL1"), ("City", "Springfield (EST.)")]);
        let record = normalize(&raw, &schema(), &NormalizeOptions::default()).unwrap();
        assert_eq!(record.get("City"), Some(&Value::Text("Springfield".into())));
    }

    #[test]
    fn test_geohash_only_when_enabled() {
        let raw = SourceRecord::from_pairs([
            ("LALVOTERID", "LAL1"),
            ("Residence_Addresses_Latitude", "57.64911"),
            ("Residence_Addresses_Longitude", "10.40744"),
        ]);

        let plain = normalize(&raw, &schema(), &NormalizeOptions::default()).unwrap();
        assert!(!plain.contains("Residence_Addresses_GeoHash"));

        let options = NormalizeOptions::default().with_geohash(GeohashOptions::default());
        let enriched = normalize(&raw, &schema(), &options).unwrap();
        assert_eq!(
            enriched.get("Residence_Addresses_GeoHash"),
            Some(&Value::Text("u4pruydq".into()))
        );
    }

    #[test]
    fn test_geohash_skipped_without_both_coordinates() {
        let raw = SourceRecord::from_pairs([
            ("LALVOTERID", "LAL1"),
            ("Residence_Addresses_Latitude", "57.64911"),
            ("Residence_Addresses_Longitude", ""),
        ]);
        let options = NormalizeOptions::default().with_geohash(GeohashOptions::default());
        let record = normalize(&raw, &schema(), &options).unwrap();
        assert!(!record.contains("Residence_Addresses_GeoHash"));
    }

    #[test]
    fn test_out_of_range_coordinate_is_malformed() {
        let raw = SourceRecord::from_pairs([
            ("LALVOTERID", "LAL1"),
            ("Residence_Addresses_Latitude", "91.5"),
            ("Residence_Addresses_Longitude", "10.4"),
        ]);
        let options = NormalizeOptions::default().with_geohash(GeohashOptions::default());
        assert!(matches!(
            normalize(&raw, &schema(), &options),
            Err(MalformedValueError::InvalidCoordinate { .. })
        ));
    }

    #[test]
    fn test_bad_coordinate_is_malformed() {
        let raw = SourceRecord::from_pairs([
            ("LALVOTERID", "LAL1"),
            ("Residence_Addresses_Latitude", "north"),
            ("Residence_Addresses_Longitude", "10.4"),
        ]);
        let options = NormalizeOptions::default().with_geohash(GeohashOptions::default());
        assert!(matches!(
            normalize(&raw, &schema(), &options),
            Err(MalformedValueError::InvalidCoordinate { .. })
        ));
    }

    #[test]
    fn test_geohash_requires_declared_output_field() {
        let schema = Arc::new(
            PartitionSchema::new(
                vec![FieldSpec::new("LALVOTERID", FieldType::String)],
                vec!["LALVOTERID".into()],
            )
            .unwrap(),
        );
        let options = NormalizeOptions::default().with_geohash(GeohashOptions::default());
        assert!(RowNormalizer::new(schema, options).is_err());
    }
}
