//! Monitored target definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};
use crate::utils::get_domain;

/// Stable identity of a target, derived from its query-defining fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetKey(String);

impl TargetKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TargetKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One monitored query against the portal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Operator-facing name, referenced by subscriptions
    pub name: String,

    /// Query endpoint
    pub endpoint: String,

    /// Query string parameters sent with every fetch
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// Office or province being watched
    #[serde(default)]
    pub location: Option<String>,

    /// Procedure / document type being watched
    #[serde(default)]
    pub document_type: Option<String>,

    /// Ignore slots before this day
    #[serde(default)]
    pub date_from: Option<NaiveDate>,

    /// Ignore slots after this day
    #[serde(default)]
    pub date_to: Option<NaiveDate>,

    /// How to read the portal's response
    pub layout: SiteLayout,

    /// How to obtain a session
    #[serde(default)]
    pub auth: AuthMethod,

    /// Scheduling and backoff parameters
    #[serde(default)]
    pub polling: PollPolicy,
}

impl Target {
    /// Derive the stable key: SHA-256 over the canonical query, first 16 bytes in hex.
    ///
    /// Name, layout, auth and polling policy are not part of the key; changing
    /// them keeps the stored baseline.
    pub fn key(&self) -> TargetKey {
        let mut hasher = Sha256::new();
        hasher.update(self.endpoint.trim().as_bytes());
        for (k, v) in &self.params {
            hasher.update(b"\x1f");
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
        }
        for field in [
            self.location.as_deref(),
            self.document_type.as_deref(),
        ] {
            hasher.update(b"\x1e");
            hasher.update(field.unwrap_or("").as_bytes());
        }
        for day in [self.date_from, self.date_to] {
            hasher.update(b"\x1e");
            if let Some(day) = day {
                hasher.update(day.to_string().as_bytes());
            }
        }
        let digest = hasher.finalize();
        TargetKey(hex::encode(&digest[..16]))
    }

    /// Host the requests go to, used to share rate limits between targets.
    pub fn host(&self) -> Result<String> {
        get_domain(&self.endpoint)
            .ok_or_else(|| AppError::config(format!("target '{}' endpoint has no host", self.name)))
    }

    /// Short description used in notifications and logs.
    pub fn describe(&self) -> String {
        let mut parts = vec![self.name.clone()];
        if let Some(doc) = &self.document_type {
            parts.push(doc.clone());
        }
        if let Some(loc) = &self.location {
            parts.push(loc.clone());
        }
        parts.join(" / ")
    }

    /// Check the definition for values that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::validation("target name is empty"));
        }
        let url = url::Url::parse(&self.endpoint).map_err(|e| {
            AppError::validation(format!("target '{}' endpoint is invalid: {e}", self.name))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::validation(format!(
                "target '{}' endpoint must be http(s)",
                self.name
            )));
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(AppError::validation(format!(
                    "target '{}' date_from is after date_to",
                    self.name
                )));
            }
        }
        self.layout
            .validate()
            .map_err(|e| AppError::validation(format!("target '{}': {e}", self.name)))?;
        self.polling
            .validate()
            .map_err(|e| AppError::validation(format!("target '{}': {e}", self.name)))
    }
}

/// Response layout of a portal page; selects the fetcher implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SiteLayout {
    Html(HtmlLayout),
    Json(JsonLayout),
}

impl SiteLayout {
    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            SiteLayout::Html(layout) => {
                for (name, selector) in layout.selectors() {
                    scraper::Selector::parse(selector)
                        .map_err(|e| format!("invalid {name} selector '{selector}': {e:?}"))?;
                }
                Ok(())
            }
            SiteLayout::Json(layout) => {
                if !layout.slots_pointer.is_empty() && !layout.slots_pointer.starts_with('/') {
                    return Err(format!(
                        "slots_pointer '{}' must be empty or start with '/'",
                        layout.slots_pointer
                    ));
                }
                Ok(())
            }
        }
    }
}

/// CSS selectors describing an HTML slot table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtmlLayout {
    /// Selector for one slot row
    pub row_selector: String,

    /// Selector (inside a row) for the day
    pub date_selector: String,

    /// Selector (inside a row) for the time of day
    #[serde(default)]
    pub time_selector: Option<String>,

    /// Selector (inside a row) for the office; falls back to the target location
    #[serde(default)]
    pub location_selector: Option<String>,

    /// Extra named selectors copied into slot qualifiers
    #[serde(default)]
    pub qualifier_selectors: BTreeMap<String, String>,

    /// Text the portal shows when nothing is bookable. A page that yields no
    /// slots is only accepted as empty when it contains this text; otherwise
    /// it is treated as a layout change.
    #[serde(default)]
    pub empty_marker: Option<String>,

    /// `chrono` format of the day text
    #[serde(default = "defaults::date_format")]
    pub date_format: String,

    /// `chrono` format of the time text
    #[serde(default = "defaults::time_format")]
    pub time_format: String,
}

impl HtmlLayout {
    /// All selectors with a label, for validation.
    pub fn selectors(&self) -> Vec<(String, &str)> {
        let mut all = vec![
            ("row".to_string(), self.row_selector.as_str()),
            ("date".to_string(), self.date_selector.as_str()),
        ];
        if let Some(s) = &self.time_selector {
            all.push(("time".to_string(), s.as_str()));
        }
        if let Some(s) = &self.location_selector {
            all.push(("location".to_string(), s.as_str()));
        }
        for (name, s) in &self.qualifier_selectors {
            all.push((format!("qualifier '{name}'"), s.as_str()));
        }
        all
    }
}

/// Field names describing a JSON slot list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLayout {
    /// JSON pointer to the slot array; empty means the document root
    #[serde(default)]
    pub slots_pointer: String,

    #[serde(default = "defaults::date_field")]
    pub date_field: String,

    #[serde(default)]
    pub time_field: Option<String>,

    #[serde(default)]
    pub location_field: Option<String>,

    /// Extra fields copied into slot qualifiers
    #[serde(default)]
    pub qualifier_fields: Vec<String>,

    #[serde(default = "defaults::date_format")]
    pub date_format: String,

    #[serde(default = "defaults::time_format")]
    pub time_format: String,
}

/// How a session is obtained for a target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Public portal, no credentials
    #[default]
    Anonymous,

    /// Harvest cookies from a landing page before querying
    Cookie {
        /// Landing page; defaults to the target endpoint
        #[serde(default)]
        url: Option<String>,
    },
}

/// Largest accepted backoff ceiling: one week.
pub const MAX_BACKOFF_CEILING_SECS: u64 = 7 * 24 * 3600;

/// Per-target scheduling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Base polling interval in seconds
    #[serde(default = "defaults::interval")]
    pub interval_secs: u64,

    /// Upper bound of the random delay added to each interval
    #[serde(default = "defaults::jitter")]
    pub jitter_secs: u64,

    /// Interval multiplier applied on each hostile response
    #[serde(default = "defaults::backoff_factor")]
    pub backoff_factor: f64,

    /// Interval ceiling while backing off
    #[serde(default = "defaults::backoff_ceiling")]
    pub backoff_ceiling_secs: u64,

    /// Consecutive clean cycles needed before the interval decays
    #[serde(default = "defaults::decay_after")]
    pub decay_after: u32,

    /// Minimum spacing between two polls of this target, in milliseconds
    #[serde(default = "defaults::min_spacing")]
    pub min_spacing_ms: u64,
}

impl PollPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_secs(self.jitter_secs)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.backoff_ceiling_secs)
    }

    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if !(self.backoff_factor > 1.0 && self.backoff_factor.is_finite()) {
            return Err(format!(
                "backoff_factor must be a finite number > 1, got {}",
                self.backoff_factor
            ));
        }
        if self.backoff_ceiling_secs > MAX_BACKOFF_CEILING_SECS {
            return Err(format!(
                "backoff_ceiling_secs ({}) exceeds the maximum of {}",
                self.backoff_ceiling_secs, MAX_BACKOFF_CEILING_SECS
            ));
        }
        if self.backoff_ceiling_secs < self.interval_secs {
            return Err(format!(
                "backoff_ceiling_secs ({}) is below interval_secs ({})",
                self.backoff_ceiling_secs, self.interval_secs
            ));
        }
        if self.decay_after == 0 {
            return Err("decay_after must be > 0".to_string());
        }
        Ok(())
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_secs: defaults::interval(),
            jitter_secs: defaults::jitter(),
            backoff_factor: defaults::backoff_factor(),
            backoff_ceiling_secs: defaults::backoff_ceiling(),
            decay_after: defaults::decay_after(),
            min_spacing_ms: defaults::min_spacing(),
        }
    }
}

mod defaults {
    pub fn date_format() -> String {
        "%d/%m/%Y".into()
    }
    pub fn time_format() -> String {
        "%H:%M".into()
    }
    pub fn date_field() -> String {
        "date".into()
    }
    pub fn interval() -> u64 {
        120
    }
    pub fn jitter() -> u64 {
        30
    }
    pub fn backoff_factor() -> f64 {
        2.0
    }
    pub fn backoff_ceiling() -> u64 {
        3600
    }
    pub fn decay_after() -> u32 {
        3
    }
    pub fn min_spacing() -> u64 {
        10_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_target() -> Target {
        toml::from_str(
            r#"
            name = "madrid-tie"
            endpoint = "https://citas.example.es/slots"
            location = "Madrid"
            document_type = "TIE"
            params = { office = "28", procedure = "4010" }

            [layout]
            kind = "html"
            row_selector = "tr.slot"
            date_selector = "td.date"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_key_is_stable_and_ignores_name() {
        let a = sample_target();
        let mut b = sample_target();
        b.name = "renamed".to_string();
        b.polling.interval_secs = 5;
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().as_str().len(), 32);
    }

    #[test]
    fn test_key_changes_with_query() {
        let a = sample_target();
        let mut b = sample_target();
        b.params.insert("office".into(), "08".into());
        assert_ne!(a.key(), b.key());

        let mut c = sample_target();
        c.date_from = NaiveDate::from_ymd_opt(2026, 1, 1);
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_host_is_lowercased() {
        let mut t = sample_target();
        t.endpoint = "https://Citas.Example.ES/slots".into();
        assert_eq!(t.host().unwrap(), "citas.example.es");
    }

    #[test]
    fn test_validate_defaults_ok() {
        assert!(sample_target().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_selector() {
        let mut t = sample_target();
        if let SiteLayout::Html(layout) = &mut t.layout {
            layout.row_selector = "[[broken".into();
        }
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_growing_backoff() {
        let mut t = sample_target();
        t.polling.backoff_factor = 1.0;
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_backoff_ceiling() {
        let mut t = sample_target();
        t.polling.backoff_ceiling_secs = MAX_BACKOFF_CEILING_SECS;
        assert!(t.validate().is_ok());
        t.polling.backoff_ceiling_secs = u64::MAX;
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let mut t = sample_target();
        t.date_from = NaiveDate::from_ymd_opt(2026, 5, 1);
        t.date_to = NaiveDate::from_ymd_opt(2026, 4, 1);
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_describe() {
        assert_eq!(sample_target().describe(), "madrid-tie / TIE / Madrid");
    }
}
