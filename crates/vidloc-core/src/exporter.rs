//! Run report export

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::Local;
use serde::Serialize;
use thiserror::Error;

use crate::report::{RunReport, SegmentReport, SegmentStatus};

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Report exporter
pub struct Exporter;

impl Exporter {
    /// Export the JSON report
    pub fn to_json<P: AsRef<Path>>(report: &RunReport, output_path: P, pretty: bool) -> Result<(), ExportError> {
        let output_path = output_path.as_ref();

        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = JsonReport::from_report(report);

        let json = if pretty {
            serde_json::to_string_pretty(&data)?
        } else {
            serde_json::to_string(&data)?
        };

        fs::write(output_path, json)?;
        Ok(())
    }

    /// Export an EDL with one event per segment
    ///
    /// Generated segments use reel `AX`; substituted segments point back at
    /// the source reel so an editor can see which spans were left unedited.
    pub fn to_edl<P: AsRef<Path>>(
        report: &RunReport,
        output_path: P,
        fps: f64,
        title: Option<&str>,
    ) -> Result<(), ExportError> {
        let output_path = output_path.as_ref();

        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let source_name = report
            .source
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("source");
        let edl_title = title.unwrap_or_else(|| {
            report
                .source
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("Untitled")
        });

        let mut content = String::new();
        content.push_str(&format!("TITLE: {}\n", edl_title));
        content.push_str("FCM: NON-DROP FRAME\n\n");

        for (i, segment) in report.segments.iter().enumerate() {
            let event_num = format!("{:03}", i + 1);
            let reel = match segment.status {
                SegmentStatus::Generated => "AX",
                SegmentStatus::Substituted | SegmentStatus::Failed => "SRC",
            };

            let src_in = Self::seconds_to_timecode(segment.start_time, fps);
            let src_out = Self::seconds_to_timecode(segment.end_time, fps);

            content.push_str(&format!(
                "{}  {:<8} AA/V  C        {} {} {} {}\n",
                event_num, reel, src_in, src_out, src_in, src_out
            ));

            match segment.status {
                SegmentStatus::Generated => {
                    let clip_name = segment
                        .clip
                        .as_ref()
                        .and_then(|p| p.file_name())
                        .and_then(|s| s.to_str())
                        .unwrap_or("generated");
                    content.push_str(&format!("* FROM CLIP NAME: {}\n", clip_name));
                }
                SegmentStatus::Substituted => {
                    content.push_str(&format!("* FROM CLIP NAME: {}\n", source_name));
                    content.push_str(&format!("* SUBSTITUTED: {}\n", Self::failure_text(segment)));
                }
                SegmentStatus::Failed => {
                    content.push_str(&format!("* FROM CLIP NAME: {}\n", source_name));
                    content.push_str(&format!("* FAILED: {}\n", Self::failure_text(segment)));
                }
            }
            content.push('\n');
        }

        fs::write(output_path, content)?;
        Ok(())
    }

    /// Export per-segment markers
    pub fn to_markers<P: AsRef<Path>>(
        report: &RunReport,
        output_path: P,
        format: MarkerFormat,
    ) -> Result<(), ExportError> {
        let output_path = output_path.as_ref();

        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = match format {
            MarkerFormat::Csv => Self::format_markers_csv(report),
            MarkerFormat::Chapters => Self::format_markers_chapters(report),
        };

        fs::write(output_path, content)?;
        Ok(())
    }

    fn failure_text(segment: &SegmentReport) -> String {
        segment
            .failure
            .as_ref()
            .map(|f| format!("{} ({})", f.message.replace('\n', " "), f.stage))
            .unwrap_or_default()
    }

    /// Seconds to `HH:MM:SS:FF`
    fn seconds_to_timecode(seconds: f64, fps: f64) -> String {
        let fps = (fps.round() as u32).max(1);
        let total_frames = (seconds * fps as f64).round() as u32;
        let frames = total_frames % fps;
        let total_seconds = total_frames / fps;
        let secs = total_seconds % 60;
        let total_minutes = total_seconds / 60;
        let mins = total_minutes % 60;
        let hours = total_minutes / 60;

        format!("{:02}:{:02}:{:02}:{:02}", hours, mins, secs, frames)
    }

    fn format_markers_csv(report: &RunReport) -> String {
        let mut lines = vec!["index,start,end,status,attempts,fallback,reason".to_string()];

        for segment in &report.segments {
            let fallback = segment.fallback.map(|f| f.to_string()).unwrap_or_default();
            let reason = Self::failure_text(segment).replace('"', "'");
            lines.push(format!(
                "{},{:.3},{:.3},{},{},{},\"{}\"",
                segment.index,
                segment.start_time,
                segment.end_time,
                segment.status,
                segment.attempts,
                fallback,
                reason
            ));
        }

        lines.join("\n")
    }

    /// ffmpeg metadata chapters, one per segment
    fn format_markers_chapters(report: &RunReport) -> String {
        let mut lines = vec![";FFMETADATA1".to_string()];

        for segment in &report.segments {
            lines.push("[CHAPTER]".to_string());
            lines.push("TIMEBASE=1/1000".to_string());
            lines.push(format!("START={}", (segment.start_time * 1000.0).round() as u64));
            lines.push(format!("END={}", (segment.end_time * 1000.0).round() as u64));
            lines.push(format!("title=Segment {} ({})", segment.index, segment.status));
        }

        lines.join("\n")
    }
}

/// Marker format
pub enum MarkerFormat {
    /// CSV
    Csv,
    /// ffmpeg `FFMETADATA1` chapters
    Chapters,
}

/// JSON report structure
#[derive(Serialize)]
struct JsonReport<'a> {
    version: String,
    generated_at: String,
    #[serde(flatten)]
    report: &'a RunReport,
    statistics: Statistics,
}

#[derive(Serialize)]
struct Statistics {
    by_status: BTreeMap<String, StatusStats>,
    total_attempts: u32,
    success_rate_percent: f64,
}

#[derive(Serialize)]
struct StatusStats {
    count: u32,
    duration: f64,
}

impl<'a> JsonReport<'a> {
    fn from_report(report: &'a RunReport) -> Self {
        let mut by_status: BTreeMap<String, StatusStats> = BTreeMap::new();
        let mut total_attempts = 0;

        for segment in &report.segments {
            total_attempts += segment.attempts;

            let stats = by_status.entry(segment.status.to_string()).or_insert(StatusStats {
                count: 0,
                duration: 0.0,
            });
            stats.count += 1;
            stats.duration += segment.duration();
        }

        let generated = report
            .segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Generated)
            .count();
        let success_rate_percent = if report.segments.is_empty() {
            0.0
        } else {
            generated as f64 / report.segments.len() as f64 * 100.0
        };

        Self {
            version: "1.0".to_string(),
            generated_at: Local::now().to_rfc3339(),
            report,
            statistics: Statistics {
                by_status,
                total_attempts,
                success_rate_percent,
            },
        }
    }
}
