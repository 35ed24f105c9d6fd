use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::tools::{CommandRunner, ToolError, failure_text, last_line};

const PROBE_TIMEOUT_SECONDS: u64 = 60;
const MAX_LONG_SIDE: u32 = 1280;
const MAX_FPS: u32 = 30;
const KEYFRAME_INTERVAL: u32 = 60;
const AUDIO_BITRATE: &str = "128k";
const TARGET_EXTENSION: &str = "mp4";

/// How video artifacts are made playable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizePolicy {
    /// Re-encode every video job.
    #[default]
    Always,
    /// Probe the streams and remux when they are already compatible.
    ProbeFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizeAction {
    Remux,
    Transcode,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("ffmpeg {action:?} failed: {detail}")]
    Failed {
        action: NormalizeAction,
        detail: String,
    },
    #[error("ffprobe failed: {0}")]
    Probe(String),
    #[error("ffmpeg produced no output")]
    EmptyOutput,
    #[error("could not move normalized file into place: {0}")]
    Io(#[from] std::io::Error),
}

/// What ffprobe reported for the first video and first audio stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamProbe {
    pub video_codec: Option<String>,
    pub pixel_format: Option<String>,
    pub audio_codec: Option<String>,
}

impl StreamProbe {
    /// H.264 in 4:2:0 with AAC or no audio, already inside an mp4 container.
    pub fn is_playback_ready(&self, path: &Path) -> bool {
        let video_ok = self
            .video_codec
            .as_deref()
            .is_some_and(|codec| codec.eq_ignore_ascii_case("h264"));
        let pixels_ok = self
            .pixel_format
            .as_deref()
            .is_some_and(|format| matches!(format, "yuv420p" | "yuvj420p"));
        let audio_ok = self
            .audio_codec
            .as_deref()
            .is_none_or(|codec| codec.eq_ignore_ascii_case("aac"));
        let container_ok = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(TARGET_EXTENSION));

        video_ok && pixels_ok && audio_ok && container_ok
    }
}

#[derive(Clone)]
pub struct Normalizer {
    runner: Arc<dyn CommandRunner>,
    ffmpeg: String,
    ffprobe: String,
    limit: Duration,
}

impl Normalizer {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        ffmpeg: impl Into<String>,
        ffprobe: impl Into<String>,
        limit: Duration,
    ) -> Self {
        Self {
            runner,
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            limit,
        }
    }

    pub async fn probe(&self, path: &Path) -> Result<StreamProbe, NormalizeError> {
        let video = self.probe_stream(path, "v:0", "codec_name,pix_fmt").await?;
        let audio = self.probe_stream(path, "a:0", "codec_name").await?;

        Ok(StreamProbe {
            video_codec: probe_value(&video, "codec_name"),
            pixel_format: probe_value(&video, "pix_fmt"),
            audio_codec: probe_value(&audio, "codec_name"),
        })
    }

    /// True unless the probe proves the file is already compatible. A probe
    /// that fails in any way counts as "needs transcode".
    pub async fn needs_transcode(&self, path: &Path) -> bool {
        match self.probe(path).await {
            Ok(probe) => {
                debug!("ffprobe {:?}: {:?}", path, probe);
                !probe.is_playback_ready(path)
            }
            Err(error) => {
                debug!("ffprobe failed for {:?}, assuming transcode: {error}", path);
                true
            }
        }
    }

    pub async fn choose(&self, path: &Path, policy: NormalizePolicy) -> NormalizeAction {
        match policy {
            NormalizePolicy::Always => NormalizeAction::Transcode,
            NormalizePolicy::ProbeFirst if self.needs_transcode(path).await => {
                NormalizeAction::Transcode
            }
            NormalizePolicy::ProbeFirst => NormalizeAction::Remux,
        }
    }

    pub async fn remux(&self, src: &Path, dst: &Path) -> Result<(), NormalizeError> {
        self.run_ffmpeg(NormalizeAction::Remux, remux_args(src, dst))
            .await
    }

    pub async fn transcode(&self, src: &Path, dst: &Path) -> Result<(), NormalizeError> {
        self.run_ffmpeg(NormalizeAction::Transcode, transcode_args(src, dst))
            .await
    }

    /// Normalizes `src` into `{dir}/{job_id}.mp4`. ffmpeg writes to a staging
    /// name first; the source is only removed once the result is in place, so
    /// on error `src` is left untouched.
    pub async fn normalize(
        &self,
        src: &Path,
        job_id: &str,
        policy: NormalizePolicy,
    ) -> Result<(PathBuf, NormalizeAction), NormalizeError> {
        let dir = src.parent().unwrap_or_else(|| Path::new("."));
        let staging = dir.join(format!("{job_id}.normalizing.{TARGET_EXTENSION}"));
        let target = dir.join(format!("{job_id}.{TARGET_EXTENSION}"));

        let action = self.choose(src, policy).await;
        info!("Normalizing job {job_id} with {:?}", action);

        let result = match action {
            NormalizeAction::Remux => self.remux(src, &staging).await,
            NormalizeAction::Transcode => self.transcode(src, &staging).await,
        };
        if let Err(error) = result {
            remove_quietly(&staging).await;
            return Err(error);
        }

        let produced = tokio::fs::metadata(&staging)
            .await
            .map(|metadata| metadata.len())
            .unwrap_or(0);
        if produced == 0 {
            remove_quietly(&staging).await;
            return Err(NormalizeError::EmptyOutput);
        }

        if let Err(error) = tokio::fs::rename(&staging, &target).await {
            remove_quietly(&staging).await;
            return Err(error.into());
        }
        if src != target.as_path() {
            remove_quietly(src).await;
        }

        Ok((target, action))
    }

    async fn probe_stream(
        &self,
        path: &Path,
        selector: &str,
        entries: &str,
    ) -> Result<String, NormalizeError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-select_streams".to_string(),
            selector.to_string(),
            "-show_entries".to_string(),
            format!("stream={entries}"),
            "-of".to_string(),
            "default=noprint_wrappers=1".to_string(),
            path.display().to_string(),
        ];
        let output = self
            .runner
            .run(
                &self.ffprobe,
                &args,
                Duration::from_secs(PROBE_TIMEOUT_SECONDS),
            )
            .await?;
        if !output.success {
            return Err(NormalizeError::Probe(failure_text(&output)));
        }
        Ok(output.stdout_text())
    }

    async fn run_ffmpeg(
        &self,
        action: NormalizeAction,
        args: Vec<String>,
    ) -> Result<(), NormalizeError> {
        let output = self.runner.run(&self.ffmpeg, &args, self.limit).await?;
        if output.success {
            return Ok(());
        }

        let text = failure_text(&output);
        Err(NormalizeError::Failed {
            action,
            detail: last_line(&text).unwrap_or(&text).to_string(),
        })
    }
}

/// Reads `key=value` from ffprobe's flat output. `N/A` and empty values are
/// treated as absent.
pub fn probe_value(output: &str, key: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (name, value) = line.trim().split_once('=')?;
        let value = value.trim();
        (name.trim() == key && !value.is_empty() && value != "N/A").then(|| value.to_string())
    })
}

fn ffmpeg_prelude(src: &Path) -> Vec<String> {
    [
        "-hide_banner",
        "-nostdin",
        "-y",
        "-loglevel",
        "error",
        "-i",
    ]
    .iter()
    .map(ToString::to_string)
    .chain(std::iter::once(src.display().to_string()))
    .collect()
}

pub fn remux_args(src: &Path, dst: &Path) -> Vec<String> {
    let mut args = ffmpeg_prelude(src);
    args.extend(
        ["-c", "copy", "-movflags", "+faststart"]
            .iter()
            .map(ToString::to_string),
    );
    args.push(dst.display().to_string());
    args
}

pub fn transcode_args(src: &Path, dst: &Path) -> Vec<String> {
    let scale = format!(
        "scale=w='if(gte(iw,ih),min({MAX_LONG_SIDE},iw),-2)':h='if(gte(iw,ih),-2,min({MAX_LONG_SIDE},ih))'"
    );
    let mut args = ffmpeg_prelude(src);
    args.extend(
        [
            "-map", "0:v:0", "-map", "0:a:0?", "-c:v", "libx264", "-profile:v", "main", "-preset",
            "veryfast", "-crf", "23", "-pix_fmt", "yuv420p", "-vf",
        ]
        .iter()
        .map(ToString::to_string),
    );
    args.push(scale);
    args.extend([
        "-fpsmax".to_string(),
        MAX_FPS.to_string(),
        "-g".to_string(),
        KEYFRAME_INTERVAL.to_string(),
        "-keyint_min".to_string(),
        KEYFRAME_INTERVAL.to_string(),
        "-sc_threshold".to_string(),
        "0".to_string(),
        "-metadata:s:v:0".to_string(),
        "rotate=0".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        AUDIO_BITRATE.to_string(),
        "-ac".to_string(),
        "2".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
    ]);
    args.push(dst.display().to_string());
    args
}

async fn remove_quietly(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != ErrorKind::NotFound
    {
        debug!("Could not remove {:?}: {error}", path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTools;

    fn normalizer(tools: &Arc<ScriptedTools>) -> Normalizer {
        Normalizer::new(
            tools.clone(),
            "ffmpeg",
            "ffprobe",
            Duration::from_secs(30),
        )
    }

    #[test]
    fn probe_values_ignore_missing_fields() {
        let output = "codec_name=h264\npix_fmt=N/A\n";
        assert_eq!(probe_value(output, "codec_name").as_deref(), Some("h264"));
        assert_eq!(probe_value(output, "pix_fmt"), None);
        assert_eq!(probe_value("", "codec_name"), None);
    }

    #[test]
    fn playback_ready_requires_every_property() {
        let ready = StreamProbe {
            video_codec: Some("h264".to_string()),
            pixel_format: Some("yuv420p".to_string()),
            audio_codec: Some("aac".to_string()),
        };
        assert!(ready.is_playback_ready(Path::new("a.mp4")));
        assert!(!ready.is_playback_ready(Path::new("a.webm")));

        let silent = StreamProbe {
            audio_codec: None,
            ..ready.clone()
        };
        assert!(silent.is_playback_ready(Path::new("a.mp4")));

        let opus = StreamProbe {
            audio_codec: Some("opus".to_string()),
            ..ready.clone()
        };
        assert!(!opus.is_playback_ready(Path::new("a.mp4")));

        let ten_bit = StreamProbe {
            pixel_format: Some("yuv420p10le".to_string()),
            ..ready.clone()
        };
        assert!(!ten_bit.is_playback_ready(Path::new("a.mp4")));

        let vp9 = StreamProbe {
            video_codec: Some("vp9".to_string()),
            ..ready
        };
        assert!(!vp9.is_playback_ready(Path::new("a.mp4")));
    }

    #[test]
    fn transcode_args_cover_playback_constraints() {
        let args = transcode_args(Path::new("in.webm"), Path::new("out.mp4"));
        let joined = args.join(" ");
        for expected in [
            "-c:v libx264",
            "-pix_fmt yuv420p",
            "-fpsmax 30",
            "-g 60",
            "-metadata:s:v:0 rotate=0",
            "-c:a aac",
            "-b:a 128k",
            "-movflags +faststart",
            "min(1280,iw)",
        ] {
            assert!(joined.contains(expected), "missing {expected}");
        }
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));

        let remux = remux_args(Path::new("in.mp4"), Path::new("out.mp4")).join(" ");
        assert!(remux.contains("-c copy -movflags +faststart"));
    }

    #[tokio::test]
    async fn probe_failure_means_transcode() {
        let tools = Arc::new(ScriptedTools::default());
        let normalizer = normalizer(&tools);
        assert!(normalizer.needs_transcode(Path::new("missing.mp4")).await);
        assert_eq!(
            normalizer
                .choose(Path::new("missing.mp4"), NormalizePolicy::ProbeFirst)
                .await,
            NormalizeAction::Transcode
        );
    }

    #[tokio::test]
    async fn compatible_file_is_remuxed_and_replaces_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("job9.mp4");
        tokio::fs::write(&src, b"raw").await.unwrap();

        let tools = Arc::new(ScriptedTools {
            probe_video: Some(("h264".to_string(), "yuv420p".to_string())),
            probe_audio: Some("aac".to_string()),
            ..ScriptedTools::default()
        });
        let (path, action) = normalizer(&tools)
            .normalize(&src, "job9", NormalizePolicy::ProbeFirst)
            .await
            .unwrap();

        assert_eq!(action, NormalizeAction::Remux);
        assert_eq!(path, src);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"raw");
        assert!(!dir.path().join("job9.normalizing.mp4").exists());
    }

    #[tokio::test]
    async fn always_policy_transcodes_without_probing() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("job3.webm");
        tokio::fs::write(&src, b"webm").await.unwrap();

        let tools = Arc::new(ScriptedTools::default());
        let (path, action) = normalizer(&tools)
            .normalize(&src, "job3", NormalizePolicy::Always)
            .await
            .unwrap();

        assert_eq!(action, NormalizeAction::Transcode);
        assert_eq!(path, dir.path().join("job3.mp4"));
        assert!(!src.exists());
        assert!(tools.calls_to("ffprobe").is_empty());
    }

    #[tokio::test]
    async fn failed_transcode_keeps_source_and_removes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("job4.mkv");
        tokio::fs::write(&src, b"mkv").await.unwrap();

        let tools = Arc::new(ScriptedTools {
            transcode_fails: true,
            ..ScriptedTools::default()
        });
        let error = normalizer(&tools)
            .normalize(&src, "job4", NormalizePolicy::Always)
            .await
            .unwrap_err();

        assert!(matches!(error, NormalizeError::Failed { .. }));
        assert!(src.exists());
        assert!(!dir.path().join("job4.normalizing.mp4").exists());
        assert!(!dir.path().join("job4.mp4").exists());
    }
}
