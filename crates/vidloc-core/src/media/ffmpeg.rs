//! ffmpeg/ffprobe media backend

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use image::RgbaImage;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{list_frames, FrameVisitor, MediaBackend, MediaError};
use crate::types::{ClipFormat, FrameSpan, VideoInfo};

/// ffmpeg invocation settings
#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    /// ffmpeg binary
    pub ffmpeg: PathBuf,
    /// ffprobe binary
    pub ffprobe: PathBuf,
    /// Video codec for intermediate clips
    pub clip_codec: String,
    /// Constant rate factor for intermediate clips
    pub clip_crf: u8,
    /// Video codec for the packed master; lossless so composited pixels survive encoding
    pub master_codec: String,
    /// Constant rate factor for the master (0 = lossless)
    pub master_crf: u8,
    /// Audio codec used when muxing the source audio back
    pub audio_codec: String,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            clip_codec: "libx264".to_string(),
            clip_crf: 18,
            master_codec: "libx264rgb".to_string(),
            master_crf: 0,
            audio_codec: "aac".to_string(),
        }
    }
}

/// Media backend driving the ffmpeg command-line tools
#[derive(Debug, Clone, Default)]
pub struct FfmpegBackend {
    config: FfmpegConfig,
}

impl FfmpegBackend {
    /// Create backend using `ffmpeg`/`ffprobe` from PATH
    pub fn new() -> Self {
        Self::default()
    }

    /// Create backend with custom settings
    pub fn with_config(config: FfmpegConfig) -> Self {
        Self { config }
    }

    /// Run ffmpeg and return stdout
    async fn ffmpeg(&self, args: Vec<OsString>) -> Result<Vec<u8>, MediaError> {
        run_tool(&self.config.ffmpeg, args).await
    }

    fn clip_encode_args(&self) -> Vec<OsString> {
        vec![
            "-c:v".into(),
            self.config.clip_codec.clone().into(),
            "-crf".into(),
            self.config.clip_crf.to_string().into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-an".into(),
        ]
    }
}

/// Video filter for `conform`
///
/// With an exact frame count the clip is stretched to the target length,
/// padded with its last frame and cut by `-frames:v`.
fn conform_filter(format: &ClipFormat, clip_duration: Option<f64>) -> String {
    let scale = format!(
        "fps={},scale={}:{}:flags=lanczos,setsar=1",
        format.fps, format.width, format.height
    );
    match (format.frames, clip_duration) {
        (Some(frames), Some(duration)) if duration > 0.0 => {
            let factor = frames as f64 / format.fps / duration;
            format!("setpts={:.6}*PTS,{},tpad=stop_mode=clone:stop={}", factor, scale, frames)
        }
        _ => scale,
    }
}

async fn run_tool(program: &Path, args: Vec<OsString>) -> Result<Vec<u8>, MediaError> {
    debug!("Running {} {:?}", program.display(), args);

    let output = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(MediaError::ToolNotFound)?;

    if !output.status.success() {
        return Err(MediaError::ExecutionFailed {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    Ok(output.stdout)
}

fn ensure_exists(path: &Path) -> Result<(), MediaError> {
    if path.exists() {
        Ok(())
    } else {
        Err(MediaError::NotFound(path.display().to_string()))
    }
}

async fn ensure_parent(path: &Path) -> Result<(), MediaError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// ffmpeg `select` expression matching exactly the given frame numbers
fn select_filter(indices: &[u64]) -> String {
    let terms: Vec<String> = indices.iter().map(|i| format!("eq(n\\,{})", i)).collect();
    format!("select={}", terms.join("+"))
}

impl MediaBackend for FfmpegBackend {
    async fn probe(&self, video: &Path) -> Result<VideoInfo, MediaError> {
        ensure_exists(video)?;

        let args: Vec<OsString> = vec![
            "-v".into(),
            "quiet".into(),
            "-print_format".into(),
            "json".into(),
            "-show_format".into(),
            "-show_streams".into(),
            video.as_os_str().to_owned(),
        ];
        let stdout = run_tool(&self.config.ffprobe, args).await?;
        let stdout = String::from_utf8_lossy(&stdout);
        let probe: FfprobeOutput = serde_json::from_str(&stdout)
            .map_err(|e| MediaError::ParseError(format!("{}: {}", e, stdout)))?;

        let stream = first_video_stream(&probe)
            .ok_or_else(|| MediaError::ParseError("no video stream".to_string()))?;
        let (width, height) = (stream.width.unwrap_or(0), stream.height.unwrap_or(0));
        let fps = parse_framerate(&probe);

        if width == 0 || height == 0 || fps <= 0.0 {
            return Err(MediaError::ParseError(format!(
                "invalid video stream ({}x{} @ {} fps)",
                width, height, fps
            )));
        }

        Ok(VideoInfo {
            path: video.to_path_buf(),
            width,
            height,
            fps,
            frame_count: parse_total_frames(&probe),
            has_audio: probe
                .streams
                .iter()
                .any(|s| s.codec_type.as_deref() == Some("audio")),
        })
    }

    async fn read_frame(&self, video: &Path, index: u64) -> Result<RgbaImage, MediaError> {
        let info = self.probe(video).await?;
        if index >= info.frame_count {
            return Err(MediaError::FrameOutOfRange {
                index,
                frame_count: info.frame_count,
            });
        }

        let args: Vec<OsString> = vec![
            "-v".into(),
            "error".into(),
            "-i".into(),
            video.as_os_str().to_owned(),
            "-vf".into(),
            select_filter(&[index]).into(),
            "-vsync".into(),
            "0".into(),
            "-frames:v".into(),
            "1".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgba".into(),
            "-".into(),
        ];
        let bytes = self.ffmpeg(args).await?;

        let expected = info.width as usize * info.height as usize * 4;
        if bytes.len() < expected {
            return Err(MediaError::FrameOutOfRange {
                index,
                frame_count: info.frame_count,
            });
        }

        RgbaImage::from_raw(info.width, info.height, bytes[..expected].to_vec())
            .ok_or_else(|| MediaError::ParseError("raw frame has wrong size".to_string()))
    }

    async fn scan_frames(
        &self,
        video: &Path,
        indices: &[u64],
        visitor: &mut FrameVisitor<'_>,
    ) -> Result<(), MediaError> {
        if indices.is_empty() {
            return Ok(());
        }

        let info = self.probe(video).await?;
        if let Some(&index) = indices.iter().find(|&&i| i >= info.frame_count) {
            return Err(MediaError::FrameOutOfRange {
                index,
                frame_count: info.frame_count,
            });
        }

        let frame_len = info.width as usize * info.height as usize * 4;

        let mut child = Command::new(&self.config.ffmpeg)
            .args(["-v", "error", "-i"])
            .arg(video)
            .arg("-vf")
            .arg(select_filter(indices))
            .args(["-vsync", "0", "-f", "rawvideo", "-pix_fmt", "rgba", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(MediaError::ToolNotFound)?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::TaskFailed("ffmpeg stdout unavailable".to_string()))?;

        let mut delivered = 0usize;
        for &index in indices {
            let mut buffer = vec![0u8; frame_len];
            match stdout.read_exact(&mut buffer).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let frame = RgbaImage::from_raw(info.width, info.height, buffer)
                .ok_or_else(|| MediaError::ParseError("raw frame has wrong size".to_string()))?;
            visitor(index, frame)?;
            delivered += 1;
        }
        drop(stdout);

        let output = child.wait_with_output().await?;
        if delivered < indices.len() {
            if !output.status.success() {
                return Err(MediaError::ExecutionFailed {
                    exit_code: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                });
            }
            return Err(MediaError::FrameOutOfRange {
                index: indices[delivered],
                frame_count: info.frame_count,
            });
        }

        debug!("Scanned {} frames from {}", delivered, video.display());
        Ok(())
    }

    async fn cut(&self, video: &Path, span: FrameSpan, output: &Path) -> Result<(), MediaError> {
        ensure_exists(video)?;
        ensure_parent(output).await?;

        let mut args: Vec<OsString> = vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-i".into(),
            video.as_os_str().to_owned(),
            "-vf".into(),
            format!(
                "trim=start_frame={}:end_frame={},setpts=PTS-STARTPTS",
                span.start, span.end
            )
            .into(),
        ];
        args.extend(self.clip_encode_args());
        args.push(output.as_os_str().to_owned());

        self.ffmpeg(args).await?;
        info!("Cut frames {}..{} into {}", span.start, span.end, output.display());
        Ok(())
    }

    async fn conform(&self, clip: &Path, format: ClipFormat, output: &Path) -> Result<(), MediaError> {
        ensure_exists(clip)?;
        ensure_parent(output).await?;

        let clip_duration = match format.frames {
            Some(_) => {
                let info = self.probe(clip).await?;
                if info.frame_count == 0 || info.fps <= 0.0 {
                    return Err(MediaError::Unsupported(format!(
                        "cannot conform empty clip {}",
                        clip.display()
                    )));
                }
                Some(info.duration())
            }
            None => None,
        };
        let filter = conform_filter(&format, clip_duration);
        let frame_limit = format.frames;

        let mut args: Vec<OsString> = vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-i".into(),
            clip.as_os_str().to_owned(),
            "-vf".into(),
            filter.into(),
        ];
        if let Some(frames) = frame_limit {
            args.push("-frames:v".into());
            args.push(frames.to_string().into());
        }
        args.extend(self.clip_encode_args());
        args.push(output.as_os_str().to_owned());

        self.ffmpeg(args).await?;
        Ok(())
    }

    async fn concat(&self, clips: &[PathBuf], output: &Path) -> Result<(), MediaError> {
        if clips.is_empty() {
            return Err(MediaError::Unsupported("nothing to concatenate".to_string()));
        }
        ensure_parent(output).await?;

        // Concat demuxer list; quotes inside paths are escaped as '\''
        let mut list = String::new();
        for clip in clips {
            ensure_exists(clip)?;
            let absolute = tokio::fs::canonicalize(clip).await?;
            let escaped = absolute.to_string_lossy().replace('\'', "'\\''");
            list.push_str(&format!("file '{}'\n", escaped));
        }
        let list_path = output.with_extension("concat.txt");
        tokio::fs::write(&list_path, list).await?;

        let args: Vec<OsString> = vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.as_os_str().to_owned(),
            "-c".into(),
            "copy".into(),
            output.as_os_str().to_owned(),
        ];
        let result = self.ffmpeg(args).await;
        let _ = tokio::fs::remove_file(&list_path).await;
        result?;

        info!("Concatenated {} clips into {}", clips.len(), output.display());
        Ok(())
    }

    async fn unpack(&self, video: &Path, dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
        ensure_exists(video)?;
        tokio::fs::create_dir_all(dir).await?;

        let args: Vec<OsString> = vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-i".into(),
            video.as_os_str().to_owned(),
            "-vsync".into(),
            "0".into(),
            "-start_number".into(),
            "0".into(),
            dir.join("frame_%06d.png").into_os_string(),
        ];
        self.ffmpeg(args).await?;

        list_frames(dir).await
    }

    async fn pack(&self, dir: &Path, fps: f64, output: &Path) -> Result<(), MediaError> {
        ensure_exists(dir)?;
        ensure_parent(output).await?;

        let args: Vec<OsString> = vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-framerate".into(),
            fps.to_string().into(),
            "-start_number".into(),
            "0".into(),
            "-i".into(),
            dir.join("frame_%06d.png").into_os_string(),
            "-c:v".into(),
            self.config.master_codec.clone().into(),
            "-crf".into(),
            self.config.master_crf.to_string().into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            output.as_os_str().to_owned(),
        ];
        self.ffmpeg(args).await?;
        Ok(())
    }

    async fn mux_audio(&self, video: &Path, audio_source: &Path, output: &Path) -> Result<(), MediaError> {
        ensure_exists(video)?;
        ensure_exists(audio_source)?;
        ensure_parent(output).await?;

        let args: Vec<OsString> = vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-i".into(),
            video.as_os_str().to_owned(),
            "-i".into(),
            audio_source.as_os_str().to_owned(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "1:a:0?".into(),
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            self.config.audio_codec.clone().into(),
            "-shortest".into(),
            output.as_os_str().to_owned(),
        ];
        self.ffmpeg(args).await?;
        Ok(())
    }

    fn clip_extension(&self) -> &'static str {
        "mp4"
    }
}

// ffprobe JSON output (`-print_format json -show_format -show_streams`)

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    /// e.g. "30/1" or "24000/1001"
    r_frame_rate: Option<String>,
    duration: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

fn first_video_stream(probe: &FfprobeOutput) -> Option<&FfprobeStream> {
    probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
}

/// Duration in seconds, from the format or the video stream
fn parse_duration(probe: &FfprobeOutput) -> f64 {
    if let Some(secs) = probe.format.duration.as_deref().and_then(|d| d.parse::<f64>().ok()) {
        return secs;
    }
    first_video_stream(probe)
        .and_then(|s| s.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn parse_framerate(probe: &FfprobeOutput) -> f64 {
    first_video_stream(probe)
        .and_then(|s| s.r_frame_rate.as_deref())
        .map(parse_fraction)
        .unwrap_or(0.0)
}

/// Parse a fraction string like `"30/1"`
fn parse_fraction(s: &str) -> f64 {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() == 2 {
        let num = parts[0].parse::<f64>().unwrap_or(0.0);
        let den = parts[1].parse::<f64>().unwrap_or(1.0);
        if den > 0.0 {
            return num / den;
        }
    }
    s.parse::<f64>().unwrap_or(0.0)
}

/// Frame count from `nb_frames`, else estimated from duration and frame rate
fn parse_total_frames(probe: &FfprobeOutput) -> u64 {
    if let Some(n) = first_video_stream(probe)
        .and_then(|s| s.nb_frames.as_deref())
        .and_then(|n| n.parse::<u64>().ok())
    {
        return n;
    }
    let duration = parse_duration(probe);
    let fps = parse_framerate(probe);
    if duration > 0.0 && fps > 0.0 {
        (duration * fps).round() as u64
    } else {
        0
    }
}
