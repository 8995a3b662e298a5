//! Loads `settings.xml`, the data-file-pool policy describing how wide a newly allocated shard's
//! `[start,end)` window should be (§4.I, §6).
//!
//! `settings.xml` is written in the Java Properties XML format (`java.util.Properties.storeToXML`):
//! a flat `<properties>` document whose children are `<entry key="...">value</entry>` pairs, not
//! typed elements named after each field. We deserialize into [`PropertiesDocument`] first, then
//! map its entries onto [`PoolSettings`] by key, same as a caller of `Properties.getProperty`
//! would.

use std::{fs, path::Path};

use serde::Deserialize;
use snafu::ResultExt;

use crate::error::{ConfigError, InvalidSnafu, ReadFailedSnafu, XmlSnafu};

/// One `<entry key="...">value</entry>` child of a Java Properties XML document.
#[derive(Debug, Deserialize)]
struct PropertyEntry {
    #[serde(rename = "@key")]
    key: String,
    #[serde(rename = "$text")]
    value: Option<String>,
}

/// The raw shape of a `java.util.Properties.storeToXML` document: a `<properties>` root holding
/// an optional `<comment>` and any number of `<entry>` children, in file order.
#[derive(Debug, Deserialize)]
#[serde(rename = "properties")]
struct PropertiesDocument {
    #[serde(rename = "comment", default)]
    #[allow(dead_code)]
    comment: Option<String>,
    #[serde(rename = "entry", default)]
    entries: Vec<PropertyEntry>,
}

impl PropertiesDocument {
    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .and_then(|e| e.value.as_deref())
    }
}

/// A duration unit as it appears in `settings.xml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "NANOSECONDS" => Some(TimeUnit::Nanoseconds),
            "MICROSECONDS" => Some(TimeUnit::Microseconds),
            "MILLISECONDS" => Some(TimeUnit::Milliseconds),
            "SECONDS" => Some(TimeUnit::Seconds),
            "MINUTES" => Some(TimeUnit::Minutes),
            "HOURS" => Some(TimeUnit::Hours),
            "DAYS" => Some(TimeUnit::Days),
            _ => None,
        }
    }

    /// The unit's length in milliseconds, for converting `time * unit` into a shard-width.
    pub fn as_millis(self) -> u64 {
        match self {
            TimeUnit::Nanoseconds => 0, // sub-millisecond; callers round up to at least 1ms.
            TimeUnit::Microseconds => 0,
            TimeUnit::Milliseconds => 1,
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
            TimeUnit::Hours => 3_600_000,
            TimeUnit::Days => 86_400_000,
        }
    }
}

/// The shard-width policy used by the back-end manager when no existing shard covers a given
/// time (§4.D `getBackEndForInsert`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub time: u64,
    pub unit: TimeUnit,
    pub count: u32,
    pub version: u32,
}

impl PoolSettings {
    /// The width, in milliseconds, of one shard allocated under this policy.
    pub fn shard_width_millis(&self) -> u64 {
        let unit_millis = self.unit.as_millis().max(1);
        self.time.saturating_mul(unit_millis).saturating_mul(self.count as u64)
    }

    fn validate(&self) -> Result<(), String> {
        if self.version != 1 {
            return Err(format!("unsupported settings version {} (expected 1)", self.version));
        }
        if self.time == 0 {
            return Err("time must be non-zero".to_string());
        }
        if self.count == 0 {
            return Err("count must be non-zero".to_string());
        }
        Ok(())
    }

    /// Maps a parsed properties document's `<entry key="...">` pairs onto the typed fields
    /// `PoolSettings` actually needs, the way a caller of `Properties.getProperty` would.
    fn from_properties(doc: &PropertiesDocument) -> Result<Self, String> {
        let time: u64 = doc
            .get("time")
            .ok_or("missing entry key \"time\"")?
            .parse()
            .map_err(|_| "entry key \"time\" is not a valid integer")?;
        let unit = TimeUnit::parse(doc.get("unit").ok_or("missing entry key \"unit\"")?)
            .ok_or("entry key \"unit\" is not a recognized time unit")?;
        let count: u32 = doc
            .get("count")
            .ok_or("missing entry key \"count\"")?
            .parse()
            .map_err(|_| "entry key \"count\" is not a valid integer")?;
        let version: u32 = doc
            .get("version")
            .ok_or("missing entry key \"version\"")?
            .parse()
            .map_err(|_| "entry key \"version\" is not a valid integer")?;

        Ok(PoolSettings { time, unit, count, version })
    }

    /// Parses and validates a `settings.xml` document already read into memory.
    pub fn from_xml_str(xml: &str) -> Result<Self, ConfigError> {
        let path = std::path::PathBuf::new();
        let doc: PropertiesDocument = quick_xml::de::from_str(xml).context(XmlSnafu { path })?;
        let settings = Self::from_properties(&doc).map_err(|reason| InvalidSnafu { reason }.build())?;
        settings.validate().map_err(|reason| InvalidSnafu { reason }.build())?;
        Ok(settings)
    }

    /// Loads and validates `settings.xml` from disk.
    #[tracing::instrument]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let xml = fs::read_to_string(path).context(ReadFailedSnafu { path: path.to_path_buf() })?;
        let doc: PropertiesDocument = quick_xml::de::from_str(&xml).context(XmlSnafu { path: path.to_path_buf() })?;
        let settings = Self::from_properties(&doc).map_err(|reason| InvalidSnafu { reason }.build())?;
        settings
            .validate()
            .map_err(|reason| InvalidSnafu { reason }.build())?;
        tracing::debug!(?settings, "loaded pool settings");
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_XML: &str = r#"
        <!DOCTYPE properties SYSTEM "http://java.sun.com/dtd/properties.dtd">
        <properties>
            <comment>chronicle-store pool settings</comment>
            <entry key="time">15</entry>
            <entry key="unit">MINUTES</entry>
            <entry key="count">96</entry>
            <entry key="version">1</entry>
        </properties>
    "#;

    #[test]
    fn parses_valid_settings() {
        let settings = PoolSettings::from_xml_str(VALID_XML).unwrap();
        assert_eq!(settings.time, 15);
        assert_eq!(settings.unit, TimeUnit::Minutes);
        assert_eq!(settings.count, 96);
        assert_eq!(settings.version, 1);
        assert_eq!(settings.shard_width_millis(), 15 * 60_000 * 96);
    }

    #[test]
    fn rejects_unsupported_version() {
        let xml = VALID_XML.replace(r#"<entry key="version">1</entry>"#, r#"<entry key="version">2</entry>"#);
        assert!(PoolSettings::from_xml_str(&xml).is_err());
    }

    #[test]
    fn rejects_zero_count() {
        let xml = VALID_XML.replace(r#"<entry key="count">96</entry>"#, r#"<entry key="count">0</entry>"#);
        assert!(PoolSettings::from_xml_str(&xml).is_err());
    }

    #[test]
    fn rejects_missing_entry() {
        let xml = VALID_XML.replace(r#"<entry key="count">96</entry>"#, "");
        assert!(PoolSettings::from_xml_str(&xml).is_err());
    }

    #[test]
    fn rejects_malformed_xml() {
        assert!(PoolSettings::from_xml_str("<properties><entry key=\"time\">1</entry>").is_err());
    }
}
