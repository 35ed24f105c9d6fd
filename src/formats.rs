use std::{cmp::Ordering, collections::HashSet, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Duration;

use crate::{
    extractor::classify_failure,
    tools::{CommandRunner, ToolError, failure_text},
};

pub const MAX_FORMATS: usize = 80;

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    uploader: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    fps: Option<f32>,
    format_note: Option<String>,
    tbr: Option<f32>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct FormatsReport {
    pub title: String,
    pub uploader: Option<String>,
    pub thumbnail: Option<String>,
    pub formats: Vec<FormatOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatOption {
    pub format_id: String,
    pub label: String,
    pub ext: String,
    pub resolution: Option<String>,
    pub has_video: bool,
    pub has_audio: bool,
}

#[derive(Debug, Error)]
pub enum FormatsError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("{0}")]
    Failed(String),
    #[error("could not read yt-dlp metadata: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Metadata-only yt-dlp run (`-J`) summarized into a sorted format list.
pub async fn list_formats(
    runner: &dyn CommandRunner,
    yt_dlp: &str,
    url: &str,
    cookies: Option<&Path>,
    limit: Duration,
) -> Result<FormatsReport, FormatsError> {
    let mut args = vec![
        "-J".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
    ];
    if let Some(path) = cookies {
        args.push("--cookies".to_string());
        args.push(path.display().to_string());
    }
    args.push(url.to_string());

    let output = runner.run(yt_dlp, &args, limit).await?;
    if !output.success {
        return Err(FormatsError::Failed(classify_failure(&failure_text(
            &output,
        ))));
    }

    let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout)?;
    Ok(FormatsReport {
        title: info
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Untitled".to_string()),
        uploader: info.uploader.filter(|value| !value.trim().is_empty()),
        thumbnail: info.thumbnail,
        formats: build_options(&info.formats),
    })
}

fn build_options(formats: &[YtDlpFormat]) -> Vec<FormatOption> {
    let mut options: Vec<(u32, f32, FormatOption)> = formats
        .iter()
        .filter(|item| has_video(item) || has_audio(item))
        .map(|item| {
            let ext = item.ext.clone().unwrap_or_else(|| "bin".to_string());
            let resolution = item
                .height
                .map(|height| format!("{height}p"))
                .or_else(|| item.format_note.clone().filter(|_| has_video(item)));
            let size_label = item
                .filesize
                .or(item.filesize_approx)
                .map(format_filesize_mb)
                .unwrap_or_else(|| "size unknown".to_string());
            let kind = match (has_video(item), has_audio(item)) {
                (true, true) => "video+audio",
                (true, false) => "video only",
                _ => "audio only",
            };
            let fps_label = item
                .fps
                .filter(|fps| *fps > 0.0)
                .map(|fps| format!(" · {}fps", fps.round() as u32))
                .unwrap_or_default();

            let label = format!(
                "{} · {}{fps_label} · {size_label} · {kind}",
                resolution.as_deref().unwrap_or("Audio"),
                ext.to_uppercase(),
            );

            (
                item.height.unwrap_or_default(),
                item.tbr.unwrap_or_default(),
                FormatOption {
                    format_id: item.format_id.clone(),
                    label,
                    ext,
                    resolution,
                    has_video: has_video(item),
                    has_audio: has_audio(item),
                },
            )
        })
        .collect();

    options.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
    });

    let mut seen_ids = HashSet::new();
    options
        .into_iter()
        .map(|(_, _, option)| option)
        .filter(|option| seen_ids.insert(option.format_id.clone()))
        .take(MAX_FORMATS)
        .collect()
}

fn has_video(format: &YtDlpFormat) -> bool {
    matches!(format.vcodec.as_deref(), Some(value) if value != "none")
}

fn has_audio(format: &YtDlpFormat) -> bool {
    matches!(format.acodec.as_deref(), Some(value) if value != "none")
}

fn format_filesize_mb(bytes: f64) -> String {
    let mb = bytes / 1_048_576.0;
    if mb > 1024.0 {
        format!("{:.2} GB", mb / 1024.0)
    } else {
        format!("{mb:.1} MB")
    }
}
