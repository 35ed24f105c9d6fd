use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    cookies::{CookieBundle, CookieSite},
    jobs::MediaKind,
    tools::{CommandRunner, ToolError, failure_text, last_line, tool_available},
};

const TOOL_RETRIES: &str = "3";
const SOCKET_TIMEOUT_SECONDS: &str = "30";
const CLIENTS_WITH_COOKIES: &str = "web,web_safari,mweb";
const CLIENTS_WITHOUT_COOKIES: &str = "android,ios,web_embedded";

/// Preferred output extensions, best first.
const ARTIFACT_PRIORITY: [&str; 12] = [
    "mp4", "m4v", "mov", "mkv", "webm", "m4a", "mp3", "aac", "opus", "ogg", "flac", "wav",
];
const PARTIAL_SUFFIXES: [&str; 4] = [".part", ".ytdl", ".temp", ".tmp"];

/// One step of the fallback ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rung {
    pub name: &'static str,
    pub format: &'static str,
    pub extra_args: &'static [&'static str],
    /// Only tried when ffmpeg is installed.
    pub needs_muxer: bool,
}

pub const VIDEO_LADDER: [Rung; 4] = [
    Rung {
        name: "native",
        format: "b[ext=mp4][vcodec^=avc1][acodec^=mp4a]/b[ext=mp4][vcodec^=avc1]",
        extra_args: &[],
        needs_muxer: false,
    },
    Rung {
        name: "relaxed",
        format: "b[ext=mp4]",
        extra_args: &[],
        needs_muxer: false,
    },
    Rung {
        name: "merge",
        format: "bv*+ba/b",
        extra_args: &["--merge-output-format", "mp4"],
        needs_muxer: true,
    },
    Rung {
        name: "last_resort",
        format: "best",
        extra_args: &[],
        needs_muxer: false,
    },
];

pub const AUDIO_LADDER: [Rung; 1] = [Rung {
    name: "audio",
    format: "ba/b",
    extra_args: &["-x", "--audio-format", "m4a", "--audio-quality", "0"],
    needs_muxer: false,
}];

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("{0}")]
    Failed(String),
    #[error("yt-dlp reported success for rung {rung} but left no file")]
    NoArtifact { rung: &'static str },
}

/// Runs yt-dlp down the ladder for one job until a rung leaves a file behind.
#[derive(Clone)]
pub struct Extractor {
    runner: Arc<dyn CommandRunner>,
    yt_dlp: String,
    ffmpeg: String,
    output_dir: PathBuf,
    limit: Duration,
}

impl Extractor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        yt_dlp: impl Into<String>,
        ffmpeg: impl Into<String>,
        output_dir: PathBuf,
        limit: Duration,
    ) -> Self {
        Self {
            runner,
            yt_dlp: yt_dlp.into(),
            ffmpeg: ffmpeg.into(),
            output_dir,
            limit,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Rungs to try for `kind`. The merge rung is dropped when no muxer is
    /// installed.
    pub async fn plan(&self, kind: MediaKind) -> Vec<Rung> {
        match kind {
            MediaKind::Audio => AUDIO_LADDER.to_vec(),
            MediaKind::Video => {
                let muxer = tool_available(self.runner.as_ref(), &self.ffmpeg, "-version").await;
                if !muxer {
                    debug!("ffmpeg not available, skipping merge rung");
                }
                VIDEO_LADDER
                    .iter()
                    .filter(|rung| muxer || !rung.needs_muxer)
                    .copied()
                    .collect()
            }
        }
    }

    pub async fn invoke(
        &self,
        url: &str,
        kind: MediaKind,
        cookies: Option<&CookieBundle>,
        job_id: &str,
    ) -> Result<PathBuf, ExtractionError> {
        let ladder = self.plan(kind).await;
        let mut last_error: Option<ExtractionError> = None;

        for rung in &ladder {
            let args = self.build_args(rung, url, cookies.map(CookieBundle::path), job_id);
            info!("Job {job_id}: trying rung {}", rung.name);

            match self.runner.run(&self.yt_dlp, &args, self.limit).await {
                Err(ToolError::NotFound(program)) => {
                    return Err(ExtractionError::Failed(format!(
                        "{program} is not installed on this system"
                    )));
                }
                Err(error) => {
                    warn!("Job {job_id}: rung {} failed to run: {error}", rung.name);
                    last_error = Some(ExtractionError::Failed(classify_failure(
                        &error.to_string(),
                    )));
                }
                Ok(output) if !output.success => {
                    let detail = failure_text(&output);
                    debug!("Job {job_id}: rung {} exited non-zero", rung.name);
                    last_error = Some(ExtractionError::Failed(classify_failure(&detail)));
                }
                Ok(_) => match locate_artifact(&self.output_dir, job_id).await {
                    Some(path) => {
                        info!("Job {job_id}: rung {} produced {:?}", rung.name, path.file_name());
                        return Ok(path);
                    }
                    None => {
                        warn!("Job {job_id}: rung {} exited cleanly without a file", rung.name);
                        last_error = Some(ExtractionError::NoArtifact { rung: rung.name });
                    }
                },
            }

            remove_job_files(&self.output_dir, job_id).await;
        }

        Err(last_error
            .unwrap_or_else(|| ExtractionError::Failed("no extraction strategy applies".to_string())))
    }

    pub fn build_args(
        &self,
        rung: &Rung,
        url: &str,
        cookies: Option<&Path>,
        job_id: &str,
    ) -> Vec<String> {
        let template = self.output_dir.join(format!("{job_id}.%(ext)s"));
        let mut args: Vec<String> = [
            "--no-playlist",
            "--no-warnings",
            "--newline",
            "--restrict-filenames",
            "--force-overwrites",
            "--retries",
            TOOL_RETRIES,
            "--fragment-retries",
            TOOL_RETRIES,
            "--socket-timeout",
            SOCKET_TIMEOUT_SECONDS,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        args.push("-o".to_string());
        args.push(template.display().to_string());
        args.push("-f".to_string());
        args.push(rung.format.to_string());
        args.extend(rung.extra_args.iter().map(ToString::to_string));

        if let Some(path) = cookies {
            args.push("--cookies".to_string());
            args.push(path.display().to_string());
        }

        if CookieSite::for_url(url) == Some(CookieSite::YouTube) {
            let clients = if cookies.is_some() {
                CLIENTS_WITH_COOKIES
            } else {
                CLIENTS_WITHOUT_COOKIES
            };
            args.push("--extractor-args".to_string());
            args.push(format!("youtube:player_client={clients}"));
        }

        args.push(url.to_string());
        args
    }
}

/// Best finished file in `dir` whose name starts with `{job_id}.`.
pub async fn locate_artifact(dir: &Path, job_id: &str) -> Option<PathBuf> {
    let prefix = format!("{job_id}.");
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut candidates: Vec<(usize, usize, PathBuf)> = Vec::new();

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix)
            || PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
        {
            continue;
        }

        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() || metadata.len() == 0 {
            continue;
        }

        let extension = Path::new(&name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let rank = ARTIFACT_PRIORITY
            .iter()
            .position(|known| *known == extension)
            .unwrap_or(ARTIFACT_PRIORITY.len());
        candidates.push((rank, name.len(), entry.path()));
    }

    candidates.sort();
    candidates.into_iter().next().map(|(_, _, path)| path)
}

/// Deletes every file in `dir` named `{job_id}.*`. Used between rungs and by
/// the reaper.
pub async fn remove_job_files(dir: &Path, job_id: &str) {
    let prefix = format!("{job_id}.");
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let path = entry.path();
        if let Err(error) = tokio::fs::remove_file(&path).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!("Could not remove {:?}: {error}", path);
        }
    }
}

/// Prefixes the common yt-dlp failures with a readable cause. The tool's own
/// text always follows.
pub fn classify_failure(detail: &str) -> String {
    let detail = detail.trim();
    let summary = last_line(detail).unwrap_or("yt-dlp could not complete the download");
    let lower = detail.to_ascii_lowercase();

    let prefix = if lower.contains("sign in to confirm")
        || lower.contains("login required")
        || lower.contains("cookies")
        || lower.contains("age-restricted")
    {
        Some("Sign-in required")
    } else if lower.contains("requested format is not available")
        || lower.contains("no video formats found")
    {
        Some("Format unavailable")
    } else if lower.contains("http error 429") || lower.contains("too many requests") {
        Some("Rate limited")
    } else if lower.contains("unsupported url") {
        Some("Unsupported URL")
    } else if lower.contains("private video") {
        Some("Private video")
    } else if lower.contains("video unavailable") || lower.contains("has been removed") {
        Some("Video unavailable")
    } else if lower.contains("exceeded the time limit") || lower.contains("timed out") {
        Some("Timed out")
    } else {
        None
    };

    let full = if detail.is_empty() { summary } else { detail };
    match prefix {
        Some(prefix) => format!("{prefix}: {full}"),
        None => full.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTools;

    fn extractor(tools: &Arc<ScriptedTools>, dir: &Path) -> Extractor {
        Extractor::new(
            tools.clone(),
            "yt-dlp",
            "ffmpeg",
            dir.to_path_buf(),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn third_rung_wins_and_fourth_is_never_tried() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(ScriptedTools {
            failing_rungs: vec!["native", "relaxed"],
            ..ScriptedTools::default()
        });

        let path = extractor(&tools, dir.path())
            .invoke("https://example.com/watch?v=abc", MediaKind::Video, None, "job1")
            .await
            .unwrap();

        assert_eq!(tools.rungs_tried(), vec!["native", "relaxed", "merge"]);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "merge");
    }

    #[tokio::test]
    async fn merge_rung_skipped_without_muxer() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(ScriptedTools {
            failing_rungs: vec!["native", "relaxed"],
            muxer_present: false,
            ..ScriptedTools::default()
        });

        let path = extractor(&tools, dir.path())
            .invoke("https://example.com/v", MediaKind::Video, None, "job2")
            .await
            .unwrap();

        assert_eq!(tools.rungs_tried(), vec!["native", "relaxed", "last_resort"]);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "last_resort");
    }

    #[tokio::test]
    async fn audio_uses_single_rung() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(ScriptedTools::default());

        let path = extractor(&tools, dir.path())
            .invoke("https://example.com/v", MediaKind::Audio, None, "job3")
            .await
            .unwrap();

        assert_eq!(tools.rungs_tried(), vec!["audio"]);
        assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("m4a"));
    }

    #[tokio::test]
    async fn exhausted_ladder_keeps_last_detail() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(ScriptedTools {
            failing_rungs: vec!["native", "relaxed", "merge", "last_resort"],
            failure_stderr: "ERROR: [youtube] abc: Sign in to confirm you're not a bot".to_string(),
            ..ScriptedTools::default()
        });

        let error = extractor(&tools, dir.path())
            .invoke("https://www.youtube.com/watch?v=abc", MediaKind::Video, None, "job4")
            .await
            .unwrap_err();

        let ExtractionError::Failed(message) = error else {
            panic!("expected Failed");
        };
        assert!(message.starts_with("Sign-in required: "));
        assert!(message.contains("Sign in to confirm"));
        assert_eq!(tools.rungs_tried().len(), 4);
    }

    #[tokio::test]
    async fn clean_exit_without_file_is_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(ScriptedTools {
            silent_rungs: vec!["audio"],
            ..ScriptedTools::default()
        });

        let error = extractor(&tools, dir.path())
            .invoke("https://example.com/v", MediaKind::Audio, None, "job5")
            .await
            .unwrap_err();
        assert!(matches!(error, ExtractionError::NoArtifact { rung: "audio" }));
    }

    #[test]
    fn youtube_client_identity_depends_on_cookies() {
        let tools = Arc::new(ScriptedTools::default());
        let extractor = extractor(&tools, Path::new("/srv/storage"));
        let rung = VIDEO_LADDER[0];

        let signed_out =
            extractor.build_args(&rung, "https://youtu.be/abc", None, "job6");
        assert!(signed_out.contains(&format!("youtube:player_client={CLIENTS_WITHOUT_COOKIES}")));
        assert!(!signed_out.contains(&"--cookies".to_string()));
        assert_eq!(signed_out.last().map(String::as_str), Some("https://youtu.be/abc"));

        let signed_in = extractor.build_args(
            &rung,
            "https://www.youtube.com/watch?v=abc",
            Some(Path::new("/tmp/youtube_cookies_x.txt")),
            "job6",
        );
        assert!(signed_in.contains(&format!("youtube:player_client={CLIENTS_WITH_COOKIES}")));
        assert!(signed_in.contains(&"/tmp/youtube_cookies_x.txt".to_string()));
        assert!(signed_in.contains(&"/srv/storage/job6.%(ext)s".to_string()));

        let other = extractor.build_args(&rung, "https://vimeo.com/1", None, "job6");
        assert!(!other.contains(&"--extractor-args".to_string()));
    }

    #[tokio::test]
    async fn locate_prefers_priority_and_ignores_partials_and_other_jobs() {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in [
            ("job7.webm", "w"),
            ("job7.mp4", "m"),
            ("job7.mp4.part", "p"),
            ("job7.m4a", ""),
            ("job70.mp4", "other"),
        ] {
            tokio::fs::write(dir.path().join(name), body).await.unwrap();
        }

        let found = locate_artifact(dir.path(), "job7").await.unwrap();
        assert_eq!(found.file_name().unwrap(), "job7.mp4");
        assert!(locate_artifact(dir.path(), "job8").await.is_none());

        remove_job_files(dir.path(), "job7").await;
        assert!(locate_artifact(dir.path(), "job7").await.is_none());
        assert!(dir.path().join("job70.mp4").exists());
    }

    #[test]
    fn classification_preserves_detail() {
        assert_eq!(
            classify_failure("ERROR: HTTP Error 429: Too Many Requests"),
            "Rate limited: ERROR: HTTP Error 429: Too Many Requests"
        );
        assert!(
            classify_failure("ERROR: Requested format is not available")
                .starts_with("Format unavailable")
        );
        assert_eq!(classify_failure("ERROR: something odd"), "ERROR: something odd");
        assert!(!classify_failure("").is_empty());
    }
}
