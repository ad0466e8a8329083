//! Audio pipeline: transcoding, speech presence, reply assembly and
//! background mixing.
//!
//! Every operation is a stateless function over byte buffers; the heavy
//! lifting is delegated to an external `ffmpeg` process. Argument lists are
//! built by pure functions so they can be checked without running ffmpeg.

use std::path::PathBuf;
use std::process::Stdio;

use axum::body::Bytes;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

// ---

/// Canonical recognition format: 8 kHz, 16-bit, mono.
pub const VOICE_SAMPLE_RATE: u32 = 8000;
pub const VOICE_CHANNELS: u32 = 1;
pub const VOICE_GAIN: f64 = 10.0;

/// Silence between assembled reply components, in seconds.
pub const COMPONENT_SPACING_S: f64 = 0.5;

/// Volume applied to effect components such as song previews.
pub const EFFECT_VOLUME: f64 = 0.25;

/// Sample rate all assembled components are normalized to.
const MIX_SAMPLE_RATE: u32 = 16000;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("failed to start ffmpeg: {0}")]
    Spawn(std::io::Error),

    #[error("ffmpeg exited with {status}: {stderr}")]
    Ffmpeg { status: String, stderr: String },

    #[error("audio I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed WAV data: {0}")]
    MalformedWav(&'static str),
}

pub type AudioResult<T> = Result<T, AudioError>;

/// Outcome of [`detect_speech_presence`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeechPresence {
    Speech { peak_db: f64 },
    Silence { peak_db: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Speech,
    Effect,
}

/// One clip of an assembled reply.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioComponent {
    pub kind: ComponentKind,
    pub data: Bytes,
    /// ffmpeg demuxer name, e.g. `mp3` or `m4a`.
    pub format: String,
    /// Extra filter directive applied to this clip only, e.g. `volume=0.25`.
    pub filter: Option<String>,
}

impl AudioComponent {
    pub fn speech(data: Bytes, format: &str) -> Self {
        Self {
            kind: ComponentKind::Speech,
            data,
            format: format.to_string(),
            filter: None,
        }
    }

    pub fn effect(data: Bytes, format: &str, filter: Option<String>) -> Self {
        Self {
            kind: ComponentKind::Effect,
            data,
            format: format.to_string(),
            filter,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembleOptions {
    /// Output bitrate, e.g. `16k`.
    pub bitrate: String,
    /// Seconds of silence between components.
    pub spacing: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MixOptions {
    /// Seconds into the background clip to start from.
    pub start_offset: f64,
    /// Background gain.
    pub volume: f64,
    /// Seconds of background before the foreground starts.
    pub pre_delay: f64,
    /// Seconds of background after the foreground ends.
    pub post_delay: f64,
    pub bitrate: String,
}

// ---

/// Peak level of 16-bit PCM WAV data, compared against `floor_db` (dBFS).
pub fn detect_speech_presence(wav: &[u8], floor_db: f64) -> AudioResult<SpeechPresence> {
    // ---
    let samples = pcm16_samples(wav)?;
    let peak = samples
        .chunks_exact(2)
        .map(|s| i32::from(i16::from_le_bytes([s[0], s[1]])).abs())
        .max()
        .unwrap_or(0);

    let peak_db = if peak == 0 {
        f64::NEG_INFINITY
    } else {
        20.0 * (f64::from(peak) / 32768.0).log10()
    };

    Ok(if peak_db >= floor_db {
        SpeechPresence::Speech { peak_db }
    } else {
        SpeechPresence::Silence { peak_db }
    })
}

/// The data chunk of a 16-bit PCM RIFF/WAVE buffer.
///
/// Streamed WAV headers carry placeholder sizes, so a data chunk size that
/// runs past the buffer means "until the end".
fn pcm16_samples(wav: &[u8]) -> AudioResult<&[u8]> {
    // ---
    if wav.len() < 12 || &wav[0..4] != b"RIFF" || &wav[8..12] != b"WAVE" {
        return Err(AudioError::MalformedWav("missing RIFF/WAVE header"));
    }

    let mut pos = 12;
    let mut saw_pcm16 = false;
    while pos + 8 <= wav.len() {
        let id = &wav[pos..pos + 4];
        let size = u32::from_le_bytes([wav[pos + 4], wav[pos + 5], wav[pos + 6], wav[pos + 7]]) as usize;
        let body = pos + 8;

        match id {
            b"fmt " => {
                if body + 16 > wav.len() {
                    return Err(AudioError::MalformedWav("truncated fmt chunk"));
                }
                let tag = u16::from_le_bytes([wav[body], wav[body + 1]]);
                let bits = u16::from_le_bytes([wav[body + 14], wav[body + 15]]);
                // 1 = PCM, 0xFFFE = extensible
                saw_pcm16 = (tag == 1 || tag == 0xFFFE) && bits == 16;
            }
            b"data" => {
                if !saw_pcm16 {
                    return Err(AudioError::MalformedWav("not 16-bit PCM"));
                }
                let end = match body.checked_add(size) {
                    Some(end) if size != 0 && end <= wav.len() => end,
                    _ => wav.len(),
                };
                return Ok(&wav[body..end]);
            }
            _ => {}
        }

        // Chunks are word aligned
        pos = match body.checked_add(size + (size & 1)) {
            Some(next) => next,
            None => break,
        };
    }
    Err(AudioError::MalformedWav("no data chunk"))
}

// ---

/// Arguments converting `source_format` on stdin to canonical WAV on stdout.
pub fn transcode_args(source_format: &str) -> Vec<String> {
    // ---
    let rate = VOICE_SAMPLE_RATE.to_string();
    let channels = VOICE_CHANNELS.to_string();
    let gain = format!("volume={VOICE_GAIN}");

    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        source_format,
        "-i",
        "pipe:0",
        "-ar",
        rate.as_str(),
        "-ac",
        channels.as_str(),
        "-sample_fmt",
        "s16",
        "-af",
        gain.as_str(),
        "-f",
        "wav",
        "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn normalize_filter(extra: Option<&str>) -> String {
    let head = extra.unwrap_or("anull");
    format!("{head},aresample={MIX_SAMPLE_RATE},aformat=sample_fmts=s16:channel_layouts=mono")
}

/// Arguments concatenating `inputs` (path, format, filter) with silence
/// between consecutive clips. `inputs` must not be empty.
pub fn assemble_args(inputs: &[(String, String, Option<String>)], opts: &AssembleOptions) -> Vec<String> {
    // ---
    let n = inputs.len();
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    for (path, format, _) in inputs {
        args.extend(["-f".into(), format.clone(), "-i".into(), path.clone()]);
    }

    let mut graph: Vec<String> = inputs
        .iter()
        .enumerate()
        .map(|(i, (_, _, filter))| format!("[{i}:a]{}[c{i}]", normalize_filter(filter.as_deref())))
        .collect();

    let gaps = n.saturating_sub(1);
    if gaps > 0 {
        args.extend([
            "-f".into(),
            "lavfi".into(),
            "-t".into(),
            opts.spacing.to_string(),
            "-i".into(),
            format!("anullsrc=r={MIX_SAMPLE_RATE}:cl=mono"),
        ]);
        let labels: String = (0..gaps).map(|g| format!("[s{g}]")).collect();
        graph.push(format!(
            "[{n}:a]aformat=sample_fmts=s16:channel_layouts=mono,asplit={gaps}{labels}"
        ));
    }

    let mut concat_inputs = String::new();
    for i in 0..n {
        concat_inputs.push_str(&format!("[c{i}]"));
        if i < gaps {
            concat_inputs.push_str(&format!("[s{i}]"));
        }
    }
    graph.push(format!("{concat_inputs}concat=n={}:v=0:a=1[out]", n + gaps));

    args.extend([
        "-filter_complex".into(),
        graph.join(";"),
        "-map".into(),
        "[out]".into(),
        "-b:a".into(),
        opts.bitrate.clone(),
        "-f".into(),
        "mp3".into(),
        "pipe:1".into(),
    ]);
    args
}

/// Arguments laying `background` under `foreground`, trimmed to the padded
/// foreground length.
pub fn mix_args(
    foreground: (&str, &str),
    background: (&str, &str),
    opts: &MixOptions,
) -> Vec<String> {
    // ---
    let pre_delay_ms = (opts.pre_delay * 1000.0).round() as u64;
    let graph = format!(
        "[0:a]{},adelay=delays={pre_delay_ms}:all=1,apad=pad_dur={}[fg];\
         [1:a]{},volume={}[bg];\
         [fg][bg]amix=inputs=2:duration=first:dropout_transition=0[out]",
        normalize_filter(None),
        opts.post_delay,
        normalize_filter(None),
        opts.volume,
    );

    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.extend([
        "-f".into(),
        foreground.1.to_string(),
        "-i".into(),
        foreground.0.to_string(),
        "-ss".into(),
        opts.start_offset.to_string(),
        "-f".into(),
        background.1.to_string(),
        "-i".into(),
        background.0.to_string(),
        "-filter_complex".into(),
        graph,
        "-map".into(),
        "[out]".into(),
        "-b:a".into(),
        opts.bitrate.clone(),
        "-f".into(),
        "mp3".into(),
        "pipe:1".into(),
    ]);
    args
}

// ---

/// Runs ffmpeg for the pipeline operations.
#[derive(Debug, Clone)]
pub struct AudioPipeline {
    ffmpeg: PathBuf,
}

impl AudioPipeline {
    // ---
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    /// Convert device audio to canonical recognition WAV.
    pub async fn transcode(&self, input: Bytes, source_format: &str) -> AudioResult<Bytes> {
        // ---
        tracing::debug!("Transcoding {} bytes of {}", input.len(), source_format);
        self.run(&transcode_args(source_format), Some(input)).await
    }

    /// Concatenate components into one mp3. No components yields no audio.
    pub async fn assemble(&self, components: &[AudioComponent], opts: &AssembleOptions) -> AudioResult<Bytes> {
        // ---
        if components.is_empty() {
            return Ok(Bytes::new());
        }

        let mut files = Vec::with_capacity(components.len());
        let mut inputs = Vec::with_capacity(components.len());
        for component in components {
            let file = stage(&component.data).await?;
            inputs.push((
                file.path().to_string_lossy().into_owned(),
                component.format.clone(),
                component.filter.clone(),
            ));
            files.push(file);
        }

        // `files` keeps the staged inputs alive until ffmpeg is done
        let out = self.run(&assemble_args(&inputs, opts), None).await;
        drop(files);
        out
    }

    /// Lay an ambient track under a spoken clip.
    // No session path plays ambience yet; kept as a pipeline capability.
    #[allow(dead_code)]
    pub async fn mix_background(
        &self,
        foreground: &AudioComponent,
        background: &AudioComponent,
        opts: &MixOptions,
    ) -> AudioResult<Bytes> {
        // ---
        let fg = stage(&foreground.data).await?;
        let bg = stage(&background.data).await?;
        let fg_path = fg.path().to_string_lossy().into_owned();
        let bg_path = bg.path().to_string_lossy().into_owned();

        self.run(
            &mix_args(
                (&fg_path, &foreground.format),
                (&bg_path, &background.format),
                opts,
            ),
            None,
        )
        .await
    }

    async fn run(&self, args: &[String], stdin: Option<Bytes>) -> AudioResult<Bytes> {
        // ---
        let mut child = Command::new(&self.ffmpeg)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(AudioError::Spawn)?;

        // Feed stdin concurrently so a full stdout pipe cannot stall us
        let writer = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => Some(tokio::spawn(async move {
                let result = pipe.write_all(&input).await;
                drop(pipe);
                result
            })),
            _ => None,
        };

        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AudioError::Ffmpeg {
                status: output.status.to_string(),
                stderr: stderr.trim().chars().take(500).collect(),
            });
        }

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("ffmpeg stdin closed early: {}", e),
                Err(e) => tracing::warn!("ffmpeg stdin writer failed: {}", e),
            }
        }

        Ok(Bytes::from(output.stdout))
    }
}

/// Write a clip to a temp file for ffmpeg to read.
async fn stage(data: &Bytes) -> AudioResult<tempfile::NamedTempFile> {
    let file = tempfile::NamedTempFile::new()?;
    tokio::fs::write(file.path(), data).await?;
    Ok(file)
}

#[cfg(test)]
pub(crate) fn wav_pcm16(samples: &[i16], data_size_field: Option<u32>) -> Vec<u8> {
    // ---
    let data: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let data_size = data_size_field.unwrap_or(data.len() as u32);

    let mut wav = Vec::new();
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&VOICE_SAMPLE_RATE.to_le_bytes());
    wav.extend_from_slice(&(VOICE_SAMPLE_RATE * 2).to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_size.to_le_bytes());
    wav.extend_from_slice(&data);
    wav
}
