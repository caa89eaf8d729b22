//! Cron spec model and admission validation.
//!
//! A `CronSpec` is the operator's recurring declaration. Validation happens
//! once at admission; anything loaded back from the store is assumed to have
//! passed it. The time-of-day grammar is shape-only: digits are not
//! range-checked (`"25:00"` is admitted), matching the admission contract.

use crate::error::SpecError;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Known job kinds. Anything else must be inferable from the run target
/// suffix at execution time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Python,
    Shell,
    Orch,
    Php,
    Node,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Python => "python",
            JobKind::Shell => "shell",
            JobKind::Orch => "orch",
            JobKind::Php => "php",
            JobKind::Node => "node",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "python" => Some(JobKind::Python),
            "shell" => Some(JobKind::Shell),
            "orch" => Some(JobKind::Orch),
            "php" => Some(JobKind::Php),
            "node" => Some(JobKind::Node),
            _ => None,
        }
    }

    /// Resolve the script type for a job: the declared kind when it is one
    /// of the known five, otherwise inferred from the run target suffix.
    pub fn resolve(kind: &str, run_target: &str) -> Result<Self, SpecError> {
        if let Some(kind) = Self::parse(kind) {
            return Ok(kind);
        }
        match run_target.rsplit('.').next() {
            Some("py") => Ok(JobKind::Python),
            Some("sh") => Ok(JobKind::Shell),
            Some("php") => Ok(JobKind::Php),
            Some("js") => Ok(JobKind::Node),
            Some("yml") | Some("yaml") => Ok(JobKind::Orch),
            _ => Err(SpecError::UnknownScriptType(run_target.to_string())),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Schedule frequency unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Second,
    Minute,
    Hour,
    Day,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Second => "second",
            Frequency::Minute => "minute",
            Frequency::Hour => "hour",
            Frequency::Day => "day",
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed time-of-day for `at`-based schedules. The meaning of each field
/// depends on the spec frequency, so parsing requires it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtTime {
    /// `minute` frequency, `:SS`, firing at this second of every minute.
    SecondOfMinute(u32),
    /// `hour` frequency, `:MM`, firing at this minute of every hour.
    MinuteOfHour(u32),
    /// `hour` frequency, `MM:SS`.
    MinuteSecondOfHour(u32, u32),
    /// `day` frequency, `HH:MM`.
    HourMinuteOfDay(u32, u32),
    /// `day` frequency, `HH:MM:SS`.
    HourMinuteSecondOfDay(u32, u32, u32),
}

impl AtTime {
    /// Parse an `at` string against the grammar for the given frequency.
    ///
    /// Shape-only: two-digit fields are required but their numeric range is
    /// deliberately unchecked here.
    pub fn parse(frequency: Frequency, value: &str) -> Result<Self, SpecError> {
        let invalid = || SpecError::InvalidAtFormat {
            frequency: frequency.to_string(),
            value: value.to_string(),
        };
        let bytes = value.as_bytes();
        let two_digits = |range: std::ops::Range<usize>| -> Option<u32> {
            let field = value.get(range)?;
            if field.len() == 2 && field.bytes().all(|b| b.is_ascii_digit()) {
                field.parse().ok()
            } else {
                None
            }
        };

        match frequency {
            Frequency::Second => Err(SpecError::AtWithSecond),
            Frequency::Minute => {
                if bytes.len() == 3 && bytes[0] == b':' {
                    return two_digits(1..3).map(AtTime::SecondOfMinute).ok_or_else(invalid);
                }
                Err(invalid())
            }
            Frequency::Hour => {
                if bytes.len() == 3 && bytes[0] == b':' {
                    return two_digits(1..3).map(AtTime::MinuteOfHour).ok_or_else(invalid);
                }
                if bytes.len() == 5 && bytes[2] == b':' {
                    if let (Some(minute), Some(second)) = (two_digits(0..2), two_digits(3..5)) {
                        return Ok(AtTime::MinuteSecondOfHour(minute, second));
                    }
                }
                Err(invalid())
            }
            Frequency::Day => {
                if bytes.len() == 5 && bytes[2] == b':' {
                    if let (Some(hour), Some(minute)) = (two_digits(0..2), two_digits(3..5)) {
                        return Ok(AtTime::HourMinuteOfDay(hour, minute));
                    }
                }
                if bytes.len() == 8 && bytes[2] == b':' && bytes[5] == b':' {
                    if let (Some(hour), Some(minute), Some(second)) =
                        (two_digits(0..2), two_digits(3..5), two_digits(6..8))
                    {
                        return Ok(AtTime::HourMinuteSecondOfDay(hour, minute, second));
                    }
                }
                Err(invalid())
            }
        }
    }
}

/// Host-name to address mapping carried by specs and job records. Empty
/// means "run locally on the worker".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventoryBinding(pub BTreeMap<String, String>);

impl InventoryBinding {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build the inventory document handed to the orchestration runner.
    ///
    /// An empty binding targets the worker itself over a local connection;
    /// otherwise every host is reached by its bound address.
    pub fn to_runner_inventory(&self) -> serde_json::Value {
        if self.0.is_empty() {
            return serde_json::json!({
                "all": {"hosts": {"localhost": {"ansible_connection": "local"}}}
            });
        }
        let hosts: serde_json::Map<String, serde_json::Value> = self
            .0
            .iter()
            .map(|(host, address)| {
                (
                    host.clone(),
                    serde_json::json!({"ansible_host": address}),
                )
            })
            .collect();
        serde_json::json!({"all": {"hosts": hosts}})
    }
}

/// A recurring job declaration, stored in the `crons` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronSpec {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub kind: JobKind,
    pub run_target: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub frequency: Frequency,
    #[serde(default)]
    pub interval: Option<u32>,
    #[serde(default)]
    pub at: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub host_inventory: InventoryBinding,
    #[serde(default)]
    pub extra_vars: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub disabled: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl CronSpec {
    /// Admission validation: interval/at exclusivity, time-of-day grammar,
    /// and timezone recognition. Rejected specs are never persisted.
    pub fn validate(&self) -> Result<(), SpecError> {
        match (self.interval, self.at.as_deref()) {
            (Some(interval), None) => {
                if interval == 0 {
                    return Err(SpecError::InvalidInterval);
                }
            }
            (None, Some(at)) => {
                AtTime::parse(self.frequency, at)?;
            }
            _ => return Err(SpecError::IntervalAtConflict),
        }
        self.tz()?;
        Ok(())
    }

    /// The spec timezone, parsed.
    pub fn tz(&self) -> Result<Tz, SpecError> {
        self.timezone
            .parse()
            .map_err(|_| SpecError::UnknownTimezone(self.timezone.clone()))
    }

    /// The parsed `at` time, when this is an `at`-based spec.
    pub fn at_time(&self) -> Option<AtTime> {
        let at = self.at.as_deref()?;
        AtTime::parse(self.frequency, at).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(frequency: Frequency, interval: Option<u32>, at: Option<&str>) -> CronSpec {
        CronSpec {
            id: "c1".into(),
            name: "heartbeat".into(),
            kind: JobKind::Shell,
            run_target: "test.sh".into(),
            args: vec![],
            frequency,
            interval,
            at: at.map(Into::into),
            timezone: "UTC".into(),
            host_inventory: InventoryBinding::default(),
            extra_vars: serde_json::Map::new(),
            disabled: false,
        }
    }

    #[test]
    fn at_grammar_minute() {
        assert!(AtTime::parse(Frequency::Minute, ":30").is_ok());
        assert!(AtTime::parse(Frequency::Minute, ":05").is_ok());
        assert!(AtTime::parse(Frequency::Minute, ":5").is_err());
        assert!(AtTime::parse(Frequency::Minute, "30").is_err());
        assert!(AtTime::parse(Frequency::Minute, ":3a").is_err());
    }

    #[test]
    fn at_grammar_hour() {
        assert_eq!(
            AtTime::parse(Frequency::Hour, ":45").ok(),
            Some(AtTime::MinuteOfHour(45))
        );
        assert_eq!(
            AtTime::parse(Frequency::Hour, "30:05").ok(),
            Some(AtTime::MinuteSecondOfHour(30, 5))
        );
        assert!(AtTime::parse(Frequency::Hour, "7:05").is_err());
        assert!(AtTime::parse(Frequency::Hour, "30:5").is_err());
    }

    #[test]
    fn at_grammar_day() {
        assert_eq!(
            AtTime::parse(Frequency::Day, "12:30").ok(),
            Some(AtTime::HourMinuteOfDay(12, 30))
        );
        assert_eq!(
            AtTime::parse(Frequency::Day, "12:30:05").ok(),
            Some(AtTime::HourMinuteSecondOfDay(12, 30, 5))
        );
        assert!(AtTime::parse(Frequency::Day, "7:00").is_err());
        assert!(AtTime::parse(Frequency::Day, "12:30:5").is_err());
    }

    #[test]
    fn at_grammar_is_shape_only() {
        // Range is deliberately unchecked at admission; only the shape is.
        assert!(AtTime::parse(Frequency::Day, "25:00").is_ok());
        assert!(AtTime::parse(Frequency::Minute, ":99").is_ok());
    }

    #[test]
    fn at_with_second_frequency_is_rejected() {
        assert!(matches!(
            AtTime::parse(Frequency::Second, ":30"),
            Err(SpecError::AtWithSecond)
        ));
    }

    #[test]
    fn validate_requires_exactly_one_of_interval_and_at() {
        assert!(spec(Frequency::Minute, Some(5), None).validate().is_ok());
        assert!(spec(Frequency::Minute, None, Some(":30")).validate().is_ok());
        assert!(spec(Frequency::Minute, None, None).validate().is_err());
        assert!(
            spec(Frequency::Minute, Some(5), Some(":30"))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn validate_rejects_zero_interval_and_bad_timezone() {
        assert!(matches!(
            spec(Frequency::Second, Some(0), None).validate(),
            Err(SpecError::InvalidInterval)
        ));

        let mut bad_tz = spec(Frequency::Second, Some(5), None);
        bad_tz.timezone = "Mars/Olympus".into();
        assert!(matches!(
            bad_tz.validate(),
            Err(SpecError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn script_type_resolution() {
        assert_eq!(JobKind::resolve("shell", "x.py").ok(), Some(JobKind::Shell));
        assert_eq!(JobKind::resolve("", "x.py").ok(), Some(JobKind::Python));
        assert_eq!(
            JobKind::resolve("javascript", "x.js").ok(),
            Some(JobKind::Node)
        );
        assert_eq!(JobKind::resolve("", "x.yaml").ok(), Some(JobKind::Orch));
        assert_eq!(JobKind::resolve("", "x.yml").ok(), Some(JobKind::Orch));
        assert_eq!(JobKind::resolve("", "x.php").ok(), Some(JobKind::Php));
        assert!(JobKind::resolve("", "mystery.bin").is_err());
    }

    #[test]
    fn empty_inventory_targets_localhost() {
        let inventory = InventoryBinding::default().to_runner_inventory();
        assert_eq!(
            inventory,
            serde_json::json!({
                "all": {"hosts": {"localhost": {"ansible_connection": "local"}}}
            })
        );
    }

    #[test]
    fn bound_inventory_maps_hosts_to_addresses() {
        let mut binding = InventoryBinding::default();
        binding.0.insert("h1".into(), "10.0.0.1".into());
        assert_eq!(
            binding.to_runner_inventory(),
            serde_json::json!({
                "all": {"hosts": {"h1": {"ansible_host": "10.0.0.1"}}}
            })
        );
    }

    #[test]
    fn cron_spec_bson_round_trip_uses_wire_names() {
        let spec = spec(Frequency::Minute, Some(5), None);
        let doc = bson::to_document(&spec).expect("spec should encode");
        assert!(doc.contains_key("_id"));
        assert!(doc.contains_key("runTarget"));
        assert!(doc.contains_key("hostInventory"));
        let back: CronSpec = bson::from_document(doc).expect("spec should decode");
        assert_eq!(back.id, "c1");
        assert_eq!(back.kind, JobKind::Shell);
    }
}
