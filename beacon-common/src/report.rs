use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Field names used when a report is flattened into stream entry pairs.
const FIELD_COURIER_ID: &str = "courier_id";
const FIELD_LATITUDE: &str = "lat";
const FIELD_LONGITUDE: &str = "lng";
const FIELD_STATUS: &str = "status";
const FIELD_RECORDED_AT: &str = "recorded_at";

/// Enumeration of reasons a submission or a log entry cannot become a
/// valid `PositionReport`. All of these are permanent: a payload that
/// fails to parse today will fail tomorrow, so it is never retried.
#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("required field {0} is missing")]
    MissingField(&'static str),
    #[error("field {field} does not hold a valid {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
}

/// A position submission as received from a courier device.
/// `recorded_at` is the device-side observation time and may lag the
/// wall clock; it defaults to receipt time when absent.
#[derive(Debug, Clone)]
pub struct PositionUpdate {
    pub courier_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub status: Option<String>,
    pub recorded_at: Option<DateTime<Utc>>,
}

/// A validated position report, the unit of work flowing through the
/// pipeline. Coordinates are WGS84 degrees and have been range-checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    pub courier_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub status: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl PositionReport {
    /// Validate a raw submission into a report, resolving `recorded_at`
    /// against the receipt time.
    pub fn from_update(
        update: PositionUpdate,
        received_at: DateTime<Utc>,
    ) -> Result<Self, ParseError> {
        validate_coordinates(update.latitude, update.longitude)?;

        Ok(Self {
            courier_id: update.courier_id,
            latitude: update.latitude,
            longitude: update.longitude,
            status: update.status,
            recorded_at: update.recorded_at.unwrap_or(received_at),
        })
    }

    /// Flatten this report into the field pairs stored in a log entry.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            (FIELD_COURIER_ID.to_owned(), self.courier_id.to_string()),
            (FIELD_LATITUDE.to_owned(), self.latitude.to_string()),
            (FIELD_LONGITUDE.to_owned(), self.longitude.to_string()),
            (FIELD_RECORDED_AT.to_owned(), self.recorded_at.to_rfc3339()),
        ];
        if let Some(status) = &self.status {
            fields.push((FIELD_STATUS.to_owned(), status.clone()));
        }
        fields
    }

    /// Parse a report back out of log entry fields.
    ///
    /// This parser fails closed: a missing, mistyped or out-of-range field
    /// yields a `ParseError` and the entry is treated as malformed, rather
    /// than letting a bad value travel further down the pipeline.
    pub fn from_fields<'a, I>(fields: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut courier_id = None;
        let mut latitude = None;
        let mut longitude = None;
        let mut status = None;
        let mut recorded_at = None;

        for (name, value) in fields {
            match name {
                FIELD_COURIER_ID => {
                    courier_id = Some(value.parse::<i64>().map_err(|_| {
                        ParseError::InvalidField {
                            field: FIELD_COURIER_ID,
                            expected: "integer",
                        }
                    })?)
                }
                FIELD_LATITUDE => latitude = Some(parse_coordinate(value, FIELD_LATITUDE)?),
                FIELD_LONGITUDE => longitude = Some(parse_coordinate(value, FIELD_LONGITUDE)?),
                FIELD_STATUS => status = Some(value.to_owned()),
                FIELD_RECORDED_AT => {
                    recorded_at = Some(
                        DateTime::parse_from_rfc3339(value)
                            .map_err(|_| ParseError::InvalidField {
                                field: FIELD_RECORDED_AT,
                                expected: "RFC 3339 timestamp",
                            })?
                            .with_timezone(&Utc),
                    )
                }
                // Unknown fields are ignored so that producers can grow
                // the payload without breaking older workers.
                _ => {}
            }
        }

        let latitude = latitude.ok_or(ParseError::MissingField(FIELD_LATITUDE))?;
        let longitude = longitude.ok_or(ParseError::MissingField(FIELD_LONGITUDE))?;
        validate_coordinates(latitude, longitude)?;

        Ok(Self {
            courier_id: courier_id.ok_or(ParseError::MissingField(FIELD_COURIER_ID))?,
            latitude,
            longitude,
            status,
            recorded_at: recorded_at.ok_or(ParseError::MissingField(FIELD_RECORDED_AT))?,
        })
    }
}

fn parse_coordinate(value: &str, field: &'static str) -> Result<f64, ParseError> {
    let parsed = value.parse::<f64>().map_err(|_| ParseError::InvalidField {
        field,
        expected: "floating point number",
    })?;
    if !parsed.is_finite() {
        return Err(ParseError::InvalidField {
            field,
            expected: "finite floating point number",
        });
    }
    Ok(parsed)
}

fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), ParseError> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(ParseError::LatitudeOutOfRange(latitude));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(ParseError::LongitudeOutOfRange(longitude));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn update() -> PositionUpdate {
        PositionUpdate {
            courier_id: 42,
            latitude: 52.52,
            longitude: 13.405,
            status: Some("delivering".to_owned()),
            recorded_at: None,
        }
    }

    #[test]
    fn update_defaults_to_receipt_time() {
        let received_at = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        let report = PositionReport::from_update(update(), received_at).expect("valid update");

        assert_eq!(report.recorded_at, received_at);
        assert_eq!(report.courier_id, 42);
    }

    #[test]
    fn update_rejects_out_of_range_coordinates() {
        let received_at = Utc::now();

        let mut bad_latitude = update();
        bad_latitude.latitude = 200.0;
        assert_eq!(
            PositionReport::from_update(bad_latitude, received_at),
            Err(ParseError::LatitudeOutOfRange(200.0))
        );

        let mut bad_longitude = update();
        bad_longitude.longitude = -180.5;
        assert_eq!(
            PositionReport::from_update(bad_longitude, received_at),
            Err(ParseError::LongitudeOutOfRange(-180.5))
        );
    }

    #[test]
    fn fields_round_trip() {
        let received_at = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        let report = PositionReport::from_update(update(), received_at).expect("valid update");

        let fields = report.to_fields();
        let parsed =
            PositionReport::from_fields(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .expect("round trip");

        assert_eq!(parsed, report);
    }

    #[test]
    fn parser_fails_closed_on_missing_fields() {
        let fields = vec![("courier_id", "7"), ("lat", "10.0")];
        assert_eq!(
            PositionReport::from_fields(fields),
            Err(ParseError::MissingField("lng"))
        );

        assert_eq!(
            PositionReport::from_fields(std::iter::empty::<(&str, &str)>()),
            Err(ParseError::MissingField("lat"))
        );
    }

    #[test]
    fn parser_fails_closed_on_mistyped_fields() {
        let fields = vec![
            ("courier_id", "seven"),
            ("lat", "10.0"),
            ("lng", "20.0"),
            ("recorded_at", "2026-07-01T12:00:00+00:00"),
        ];
        assert_eq!(
            PositionReport::from_fields(fields),
            Err(ParseError::InvalidField {
                field: "courier_id",
                expected: "integer"
            })
        );

        let fields = vec![
            ("courier_id", "7"),
            ("lat", "NaN"),
            ("lng", "20.0"),
            ("recorded_at", "2026-07-01T12:00:00+00:00"),
        ];
        assert!(PositionReport::from_fields(fields).is_err());

        let fields = vec![
            ("courier_id", "7"),
            ("lat", "10.0"),
            ("lng", "20.0"),
            ("recorded_at", "not a timestamp"),
        ];
        assert_eq!(
            PositionReport::from_fields(fields),
            Err(ParseError::InvalidField {
                field: "recorded_at",
                expected: "RFC 3339 timestamp"
            })
        );
    }

    #[test]
    fn parser_rejects_out_of_range_entry() {
        let fields = vec![
            ("courier_id", "7"),
            ("lat", "200"),
            ("lng", "20.0"),
            ("recorded_at", "2026-07-01T12:00:00+00:00"),
        ];
        assert_eq!(
            PositionReport::from_fields(fields),
            Err(ParseError::LatitudeOutOfRange(200.0))
        );
    }

    #[test]
    fn parser_ignores_unknown_fields() {
        let fields = vec![
            ("courier_id", "7"),
            ("lat", "10.0"),
            ("lng", "20.0"),
            ("recorded_at", "2026-07-01T12:00:00+00:00"),
            ("battery", "83"),
        ];
        let report = PositionReport::from_fields(fields).expect("unknown fields are ignored");
        assert_eq!(report.courier_id, 7);
        assert_eq!(report.status, None);
    }
}
