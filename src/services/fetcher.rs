// src/services/fetcher.rs

//! Target fetchers.
//!
//! A fetcher performs one query against the portal and turns the response
//! into a `Snapshot`. One implementation exists per site layout and is picked
//! when the configuration is loaded. Fetchers never touch shared state.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use regex::{Regex, RegexBuilder};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::models::{HtmlLayout, JsonLayout, SessionHandle, SiteLayout, Slot, Snapshot, Target};
use crate::utils::http::{is_block_status, is_transient_status};
use crate::utils::snippet;

/// Performs one query and returns the advertised slots.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the current snapshot.
    ///
    /// Errors are `TransientFetch`, `Blocked` or `Parse`.
    async fn fetch(&self, target: &Target, session: &SessionHandle) -> Result<Snapshot>;
}

/// Recognizes challenge and rate-limit pages by content.
#[derive(Debug, Clone)]
pub struct BlockDetector {
    markers: Vec<Regex>,
}

impl BlockDetector {
    /// Compile case-insensitive markers.
    pub fn new(markers: &[String]) -> Result<Self> {
        let markers = markers
            .iter()
            .map(|m| {
                RegexBuilder::new(m)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| AppError::config(format!("invalid block marker '{m}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { markers })
    }

    /// The first marker found in `body`, if any.
    pub fn detect(&self, body: &str) -> Option<&str> {
        self.markers
            .iter()
            .find(|re| re.is_match(body))
            .map(|re| re.as_str())
    }
}

/// Send a query and return the body, classifying failures.
pub(crate) async fn fetch_body(
    client: &Client,
    detector: &BlockDetector,
    target: &Target,
    url: &str,
    params: &BTreeMap<String, String>,
    session: &SessionHandle,
) -> Result<String> {
    let request = session.apply(client.get(url).query(params));
    let response = request
        .send()
        .await
        .map_err(|e| AppError::transient(&target.name, e))?;

    let status = response.status();
    if is_block_status(status) {
        return Err(AppError::blocked(&target.name, format!("HTTP {status}")));
    }
    if is_transient_status(status) {
        return Err(AppError::transient(&target.name, format!("HTTP {status}")));
    }

    let body = response
        .text()
        .await
        .map_err(|e| AppError::transient(&target.name, e))?;

    if let Some(marker) = detector.detect(&body) {
        return Err(AppError::blocked(
            &target.name,
            format!("challenge page (matched '{marker}')"),
        ));
    }
    if !status.is_success() {
        return Err(AppError::parse(
            &target.name,
            format!("unexpected HTTP {status}: {}", snippet(&body, 120)),
        ));
    }
    Ok(body)
}

/// Build the fetcher for a target's layout.
pub fn build_fetcher(
    target: &Target,
    client: Client,
    detector: Arc<BlockDetector>,
) -> Arc<dyn Fetcher> {
    match &target.layout {
        SiteLayout::Html(layout) => Arc::new(HtmlFetcher::new(client, layout.clone(), detector)),
        SiteLayout::Json(layout) => Arc::new(JsonFetcher::new(client, layout.clone(), detector)),
    }
}

/// Keep slots inside the target's date range.
fn into_snapshot(target: &Target, slots: Vec<Slot>) -> Snapshot {
    Snapshot::new(
        slots
            .into_iter()
            .filter(|s| s.within(target.date_from, target.date_to)),
    )
}

fn parse_date(target: &Target, text: &str, format: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), format).map_err(|e| {
        AppError::parse(
            &target.name,
            format!("date '{}' does not match '{format}': {e}", text.trim()),
        )
    })
}

fn parse_time(target: &Target, text: &str, format: &str) -> Result<Option<NaiveTime>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    NaiveTime::parse_from_str(text, format)
        .map(Some)
        .map_err(|e| {
            AppError::parse(
                &target.name,
                format!("time '{text}' does not match '{format}': {e}"),
            )
        })
}

// --- HTML ---

/// Fetcher for portals rendering slots as an HTML table or list.
pub struct HtmlFetcher {
    client: Client,
    layout: HtmlLayout,
    detector: Arc<BlockDetector>,
}

impl HtmlFetcher {
    pub fn new(client: Client, layout: HtmlLayout, detector: Arc<BlockDetector>) -> Self {
        Self {
            client,
            layout,
            detector,
        }
    }

    fn parse_selector(s: &str) -> Result<Selector> {
        Selector::parse(s).map_err(|e| AppError::selector(s, format!("{e:?}")))
    }

    fn element_text(row: &ElementRef, selector: &Selector) -> Option<String> {
        row.select(selector).next().map(|el| {
            el.text()
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
    }

    /// Parse a page into slots.
    pub fn parse(&self, target: &Target, body: &str) -> Result<Vec<Slot>> {
        let layout = &self.layout;
        let document = Html::parse_document(body);

        let row_sel = Self::parse_selector(&layout.row_selector)?;
        let date_sel = Self::parse_selector(&layout.date_selector)?;
        let time_sel = layout
            .time_selector
            .as_deref()
            .map(Self::parse_selector)
            .transpose()?;
        let location_sel = layout
            .location_selector
            .as_deref()
            .map(Self::parse_selector)
            .transpose()?;
        let qualifier_sels = layout
            .qualifier_selectors
            .iter()
            .map(|(name, s)| Ok((name.clone(), Self::parse_selector(s)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut rows = 0usize;
        let mut slots = Vec::new();
        for row in document.select(&row_sel) {
            rows += 1;
            // Header and spacer rows carry no date cell.
            let Some(date_text) = Self::element_text(&row, &date_sel) else {
                continue;
            };
            let date = parse_date(target, &date_text, &layout.date_format)?;

            let time = match &time_sel {
                Some(sel) => match Self::element_text(&row, sel) {
                    Some(text) => parse_time(target, &text, &layout.time_format)?,
                    None => None,
                },
                None => None,
            };

            let location = location_sel
                .as_ref()
                .and_then(|sel| Self::element_text(&row, sel))
                .filter(|s| !s.is_empty())
                .or_else(|| target.location.clone())
                .unwrap_or_default();

            let mut slot = Slot::new(date, time, location);
            for (name, sel) in &qualifier_sels {
                if let Some(value) = Self::element_text(&row, sel).filter(|v| !v.is_empty()) {
                    slot.qualifiers.insert(name.clone(), value);
                }
            }
            slots.push(slot);
        }

        // An empty result only counts as "no slots" when the page says so.
        if slots.is_empty() {
            let confirmed = layout
                .empty_marker
                .as_deref()
                .is_some_and(|marker| body.contains(marker));
            if !confirmed {
                let detail = if rows == 0 {
                    format!("no rows matched '{}'", layout.row_selector)
                } else {
                    format!(
                        "{} row(s) matched '{}' but none had '{}'",
                        rows, layout.row_selector, layout.date_selector
                    )
                };
                let reason = match &layout.empty_marker {
                    Some(_) => "the empty-page text is missing",
                    None => "no empty-page text is configured",
                };
                return Err(AppError::parse(&target.name, format!("{detail} and {reason}")));
            }
        }
        Ok(slots)
    }
}

#[async_trait]
impl Fetcher for HtmlFetcher {
    async fn fetch(&self, target: &Target, session: &SessionHandle) -> Result<Snapshot> {
        let body = fetch_body(
            &self.client,
            &self.detector,
            target,
            &target.endpoint,
            &target.params,
            session,
        )
        .await?;
        let slots = self.parse(target, &body)?;
        Ok(into_snapshot(target, slots))
    }
}

// --- JSON ---

/// Fetcher for portals exposing slots through a JSON API.
pub struct JsonFetcher {
    client: Client,
    layout: JsonLayout,
    detector: Arc<BlockDetector>,
}

impl JsonFetcher {
    pub fn new(client: Client, layout: JsonLayout, detector: Arc<BlockDetector>) -> Self {
        Self {
            client,
            layout,
            detector,
        }
    }

    fn field_text(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Parse a JSON document into slots.
    pub fn parse(&self, target: &Target, body: &str) -> Result<Vec<Slot>> {
        let layout = &self.layout;
        let document: Value = serde_json::from_str(body).map_err(|e| {
            AppError::parse(&target.name, format!("invalid JSON: {e}: {}", snippet(body, 80)))
        })?;

        let items = document
            .pointer(&layout.slots_pointer)
            .ok_or_else(|| {
                AppError::parse(
                    &target.name,
                    format!("'{}' not found in response", layout.slots_pointer),
                )
            })?
            .as_array()
            .ok_or_else(|| {
                AppError::parse(
                    &target.name,
                    format!("'{}' is not an array", layout.slots_pointer),
                )
            })?;

        let mut slots = Vec::with_capacity(items.len());
        for item in items {
            let object = item.as_object().ok_or_else(|| {
                AppError::parse(&target.name, "slot entry is not an object")
            })?;

            let date_text = object
                .get(&layout.date_field)
                .and_then(Self::field_text)
                .ok_or_else(|| {
                    AppError::parse(
                        &target.name,
                        format!("slot entry has no '{}' field", layout.date_field),
                    )
                })?;
            let date = parse_date(target, &date_text, &layout.date_format)?;

            let time = match layout
                .time_field
                .as_ref()
                .and_then(|f| object.get(f))
                .and_then(Self::field_text)
            {
                Some(text) => parse_time(target, &text, &layout.time_format)?,
                None => None,
            };

            let location = layout
                .location_field
                .as_ref()
                .and_then(|f| object.get(f))
                .and_then(Self::field_text)
                .filter(|s| !s.is_empty())
                .or_else(|| target.location.clone())
                .unwrap_or_default();

            let mut slot = Slot::new(date, time, location);
            for field in &layout.qualifier_fields {
                if let Some(value) = object.get(field).and_then(Self::field_text) {
                    slot.qualifiers.insert(field.clone(), value);
                }
            }
            slots.push(slot);
        }
        Ok(slots)
    }
}

#[async_trait]
impl Fetcher for JsonFetcher {
    async fn fetch(&self, target: &Target, session: &SessionHandle) -> Result<Snapshot> {
        let body = fetch_body(
            &self.client,
            &self.detector,
            target,
            &target.endpoint,
            &target.params,
            session,
        )
        .await?;
        let slots = self.parse(target, &body)?;
        Ok(into_snapshot(target, slots))
    }
}
