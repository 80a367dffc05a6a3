//! Field observations and the species predictions attached to them.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
#[cfg(feature = "ts")]
use ts_rs::TS;

use crate::api::request::FormPart;

/// Coordinates come back from decimal fields as strings, but numbers are accepted too.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(f64),
    Text(String),
}

fn coordinate<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid coordinate: {:?}", s))),
    }
}

/// A geotagged photo observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS))]
pub struct Observation {
    pub id: i64,
    pub date: NaiveDate,
    #[serde(default)]
    pub place_text: Option<String>,
    #[serde(deserialize_with = "coordinate")]
    pub latitude: f64,
    #[serde(deserialize_with = "coordinate")]
    pub longitude: f64,
    /// Path relative to the media root
    #[serde(default)]
    pub photo: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub inference: Option<InferenceSummary>,
}

impl Observation {
    /// Place description, falling back to coordinates
    pub fn place_display(&self) -> String {
        match self.place_text.as_deref().map(str::trim) {
            Some(place) if !place.is_empty() => place.to_string(),
            _ => format!("{:.5}, {:.5}", self.latitude, self.longitude),
        }
    }

    pub fn predicted_label(&self) -> Option<&str> {
        self.inference.as_ref().map(|i| i.predicted_label.as_str())
    }
}

/// The prediction shown alongside an observation in lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS))]
pub struct InferenceSummary {
    pub predicted_label: String,
    /// Percentage, 0 to 100
    pub confidence: f64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A stored classification of an observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS))]
pub struct Inference {
    pub id: i64,
    pub predicted_label: String,
    pub confidence: f64,
    /// User feedback; `None` until validated
    #[serde(default)]
    pub is_correct: Option<bool>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Prediction for an image that has not been saved yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS))]
pub struct PredictPreview {
    pub label: String,
    pub confidence: f64,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationAck {
    pub ok: bool,
}

/// A paginated list envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub count: u64,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<T>,
}

/// Observation lists come back either bare or paginated depending on server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ObservationList {
    Plain(Vec<Observation>),
    Paged(Page<Observation>),
}

impl ObservationList {
    pub fn into_vec(self) -> Vec<Observation> {
        match self {
            ObservationList::Plain(items) => items,
            ObservationList::Paged(page) => page.results,
        }
    }
}

/// Filters for listing observations
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub search: Option<String>,
    /// Field name, prefixed with `-` for descending, e.g. `-date`
    pub ordering: Option<String>,
    pub page: Option<u32>,
}

/// An image to upload with its file name and MIME type.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoUpload {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl PhotoUpload {
    pub fn new(file_name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime: mime.into(),
            bytes,
        }
    }

    /// Read an image file, guessing its MIME type from the extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read photo {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("photo.jpg")
            .to_string();
        let mime = Self::guess_mime(&file_name);
        Ok(Self::new(file_name, mime, bytes))
    }

    fn guess_mime(file_name: &str) -> &'static str {
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "png" => "image/png",
            "webp" => "image/webp",
            "heic" => "image/heic",
            "gif" => "image/gif",
            _ => "image/jpeg",
        }
    }

    pub(crate) fn into_part(self, field: &str) -> FormPart {
        FormPart::File {
            name: field.to_string(),
            file_name: self.file_name,
            mime: self.mime,
            bytes: self.bytes,
        }
    }
}

/// The prediction preview to save with a new observation
#[derive(Debug, Clone, Default)]
pub struct SavedPrediction {
    pub label: String,
    pub confidence: f64,
    pub version: Option<String>,
}

impl From<PredictPreview> for SavedPrediction {
    fn from(preview: PredictPreview) -> Self {
        Self {
            label: preview.label,
            confidence: preview.confidence,
            version: preview.version,
        }
    }
}

/// A new observation, sent as a multipart form.
#[derive(Debug, Clone)]
pub struct NewObservation {
    pub date: NaiveDate,
    pub place_text: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub photo: Option<PhotoUpload>,
    pub prediction: Option<SavedPrediction>,
}

impl NewObservation {
    pub(crate) fn into_parts(self) -> Vec<FormPart> {
        let mut parts = vec![
            FormPart::text("date", self.date.format("%Y-%m-%d")),
            FormPart::text("latitude", self.latitude),
            FormPart::text("longitude", self.longitude),
        ];
        if let Some(place) = self.place_text {
            parts.push(FormPart::text("place_text", place));
        }
        if let Some(prediction) = self.prediction {
            parts.push(FormPart::text("predicted_label", prediction.label));
            parts.push(FormPart::text("predicted_confidence", prediction.confidence));
            if let Some(version) = prediction.version {
                parts.push(FormPart::text("predicted_version", version));
            }
        }
        if let Some(photo) = self.photo {
            parts.push(photo.into_part("photo"));
        }
        parts
    }
}

/// A partial update. Only set fields are sent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservationUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub place_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip)]
    pub photo: Option<PhotoUpload>,
}

impl ObservationUpdate {
    pub fn has_photo(&self) -> bool {
        self.photo.is_some()
    }

    pub(crate) fn into_parts(self) -> Vec<FormPart> {
        let mut parts = Vec::new();
        if let Some(date) = self.date {
            parts.push(FormPart::text("date", date.format("%Y-%m-%d")));
        }
        if let Some(place) = self.place_text {
            parts.push(FormPart::text("place_text", place));
        }
        if let Some(latitude) = self.latitude {
            parts.push(FormPart::text("latitude", latitude));
        }
        if let Some(longitude) = self.longitude {
            parts.push(FormPart::text("longitude", longitude));
        }
        if let Some(photo) = self.photo {
            parts.push(photo.into_part("photo"));
        }
        parts
    }
}
