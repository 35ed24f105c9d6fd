use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::time::Duration;

use crate::{
    cookies::CookieReconciler,
    extractor::{AUDIO_LADDER, Extractor, VIDEO_LADDER},
    jobs::{Clock, JobState, JobView, MemoryJobStore},
    manager::{JobManager, ManagerSettings},
    normalizer::Normalizer,
    tools::{CommandRunner, ToolError, ToolOutput},
};

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    /// Whether the file passed to `--cookies` existed while the call ran.
    pub cookie_file_present: Option<bool>,
    /// Contents of that file at call time.
    pub cookie_contents: Option<String>,
}

/// Stand-in for yt-dlp, ffmpeg and ffprobe. yt-dlp calls are matched to a
/// rung through their `-f` selector and write a file containing the rung
/// name. `{output}` in `failure_stderr` expands to the output template.
pub struct ScriptedTools {
    pub failing_rungs: Vec<&'static str>,
    pub silent_rungs: Vec<&'static str>,
    pub muxer_present: bool,
    pub transcode_fails: bool,
    pub probe_video: Option<(String, String)>,
    pub probe_audio: Option<String>,
    pub extraction_delay: Duration,
    pub failure_stderr: String,
    pub(crate) calls: Mutex<Vec<RecordedCall>>,
    pub(crate) active: AtomicUsize,
    pub(crate) peak: AtomicUsize,
}

impl Default for ScriptedTools {
    fn default() -> Self {
        Self {
            failing_rungs: Vec::new(),
            silent_rungs: Vec::new(),
            muxer_present: true,
            transcode_fails: false,
            probe_video: None,
            probe_audio: None,
            extraction_delay: Duration::ZERO,
            failure_stderr: "ERROR: scripted failure".to_string(),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

impl ScriptedTools {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.program == program)
            .collect()
    }

    /// Rung names of every yt-dlp download call, in order.
    pub fn rungs_tried(&self) -> Vec<&'static str> {
        self.calls_to("yt-dlp")
            .iter()
            .filter_map(|call| rung_for(&call.args))
            .collect()
    }

    pub fn peak_extractions(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn record(&self, program: &str, args: &[String]) {
        let cookie_file = arg_after(args, "--cookies");
        self.calls.lock().unwrap().push(RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
            cookie_file_present: cookie_file.map(|path| Path::new(path).exists()),
            cookie_contents: cookie_file.and_then(|path| std::fs::read_to_string(path).ok()),
        });
    }

    async fn extract(&self, args: &[String]) -> ToolOutput {
        if args.iter().any(|arg| arg == "-J") {
            return ToolOutput {
                success: true,
                stdout: br#"{"title":"Scripted","formats":[]}"#.to_vec(),
                stderr: Vec::new(),
            };
        }

        let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        if !self.extraction_delay.is_zero() {
            tokio::time::sleep(self.extraction_delay).await;
        }
        let output = self.extract_rung(args).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        output
    }

    async fn extract_rung(&self, args: &[String]) -> ToolOutput {
        let Some(rung) = rung_for(args) else {
            return failure("ERROR: unknown format selector");
        };
        let Some(template) = arg_after(args, "-o") else {
            return failure("ERROR: no output template");
        };
        if self.failing_rungs.contains(&rung) {
            return failure(&self.failure_stderr.replace("{output}", template));
        }
        if self.silent_rungs.contains(&rung) {
            return success(Vec::new());
        }

        let extension = if rung == AUDIO_LADDER[0].name { "m4a" } else { "mp4" };
        let target = PathBuf::from(template.replace("%(ext)s", extension));
        if let Err(error) = tokio::fs::write(&target, rung).await {
            return failure(&format!("ERROR: {error}"));
        }
        success(Vec::new())
    }

    async fn ffmpeg(&self, args: &[String]) -> ToolOutput {
        if args.iter().any(|arg| arg == "-version") {
            return if self.muxer_present {
                success(b"ffmpeg version scripted".to_vec())
            } else {
                failure("ffmpeg missing")
            };
        }
        let (Some(src), Some(dst)) = (arg_after(args, "-i"), args.last()) else {
            return failure("ffmpeg: missing input or output");
        };
        if self.transcode_fails && args.iter().any(|arg| arg == "libx264") {
            return failure(&format!("{src}: Invalid data found when processing input"));
        }
        match tokio::fs::copy(src, dst).await {
            Ok(_) => success(Vec::new()),
            Err(error) => failure(&format!("{src}: {error}")),
        }
    }

    fn ffprobe(&self, args: &[String]) -> ToolOutput {
        match arg_after(args, "-select_streams") {
            Some("v:0") => match &self.probe_video {
                Some((codec, pix_fmt)) => {
                    success(format!("codec_name={codec}\npix_fmt={pix_fmt}\n").into_bytes())
                }
                None => failure("Invalid data found when processing input"),
            },
            _ => match &self.probe_audio {
                Some(codec) => success(format!("codec_name={codec}\n").into_bytes()),
                None => success(Vec::new()),
            },
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedTools {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _limit: Duration,
    ) -> Result<ToolOutput, ToolError> {
        self.record(program, args);
        match program {
            "yt-dlp" => Ok(self.extract(args).await),
            "ffmpeg" => Ok(self.ffmpeg(args).await),
            "ffprobe" => Ok(self.ffprobe(args)),
            other => Err(ToolError::NotFound(other.to_string())),
        }
    }
}

fn rung_for(args: &[String]) -> Option<&'static str> {
    let format = arg_after(args, "-f")?;
    VIDEO_LADDER
        .iter()
        .chain(AUDIO_LADDER.iter())
        .find(|rung| rung.format == format)
        .map(|rung| rung.name)
}

fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|index| args.get(index + 1))
        .map(String::as_str)
}

fn success(stdout: Vec<u8>) -> ToolOutput {
    ToolOutput {
        success: true,
        stdout,
        stderr: Vec::new(),
    }
}

fn failure(stderr: &str) -> ToolOutput {
    ToolOutput {
        success: false,
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Polls until the job leaves `queued`/`running`.
pub async fn wait_terminal(manager: &JobManager, id: &str) -> JobView {
    for _ in 0..500 {
        let view = manager.get(id).await.unwrap();
        if matches!(view.status, JobState::Done | JobState::Error) {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never finished");
}

/// A manager wired to scripted tools, a manual clock and scratch directories.
pub struct Harness {
    pub manager: JobManager,
    pub store: Arc<MemoryJobStore>,
    pub tools: Arc<ScriptedTools>,
    pub clock: Arc<ManualClock>,
    pub storage: TempDir,
    pub cookies: CookieReconciler,
    _cookie_dir: TempDir,
}

pub fn harness(tools: ScriptedTools, settings: ManagerSettings) -> Harness {
    harness_with_cookies(tools, settings, &[])
}

pub fn harness_with_cookies(
    tools: ScriptedTools,
    settings: ManagerSettings,
    cookie_files: &[(&str, &str)],
) -> Harness {
    let storage = tempfile::tempdir().unwrap();
    let cookie_dir = tempfile::tempdir().unwrap();
    for (name, body) in cookie_files {
        std::fs::write(cookie_dir.path().join(name), body).unwrap();
    }

    let tools = Arc::new(tools);
    let store = Arc::new(MemoryJobStore::new());
    let clock = ManualClock::new(Utc::now());
    let cookies = CookieReconciler::new(vec![cookie_dir.path().to_path_buf()]);
    let extractor = Extractor::new(
        tools.clone(),
        "yt-dlp",
        "ffmpeg",
        storage.path().to_path_buf(),
        Duration::from_secs(30),
    );
    let normalizer = Normalizer::new(tools.clone(), "ffmpeg", "ffprobe", Duration::from_secs(30));
    let manager = JobManager::new(
        store.clone(),
        clock.clone(),
        cookies.clone(),
        extractor,
        normalizer,
        settings,
    );

    Harness {
        manager,
        store,
        tools,
        clock,
        storage,
        cookies,
        _cookie_dir: cookie_dir,
    }
}
