use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::fence::Geofence;
use crate::sample::Position;

pub const CSV_HEADER: &str = "timestamp,latitude,longitude,accuracy,speed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    /// Full nested document.
    #[default]
    Json,
    /// History only, one row per sample, five columns.
    Csv,
}

impl ExportFormat {
    /// Strict lookup of a format name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }

    /// Unknown names fall back to the JSON document.
    pub fn from_name(name: &str) -> Self {
        Self::parse(name).unwrap_or_default()
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

/// Point-in-time export of tracker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub current_position: Option<Position>,
    pub history: Vec<Position>,
    pub geofences: Vec<Geofence>,
    #[serde(with = "time::serde::rfc3339")]
    pub exported_at: OffsetDateTime,
}

impl Snapshot {
    pub fn render(&self, format: ExportFormat) -> serde_json::Result<String> {
        match format {
            ExportFormat::Json => self.to_json(),
            ExportFormat::Csv => Ok(self.to_csv()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Lossy on purpose: only timestamp, coordinates, accuracy and speed.
    pub fn to_csv(&self) -> String {
        let mut out = String::with_capacity(64 * (self.history.len() + 1));
        out.push_str(CSV_HEADER);
        out.push('\n');
        for p in &self.history {
            let ts = p
                .timestamp
                .format(&Rfc3339)
                .unwrap_or_else(|_| p.timestamp.unix_timestamp().to_string());
            out.push_str(&format!(
                "{},{},{},{},{}\n",
                ts,
                p.latitude,
                p.longitude,
                opt_cell(p.accuracy),
                opt_cell(p.speed),
            ));
        }
        out
    }
}

fn opt_cell(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}
