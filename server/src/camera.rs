use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use pi_rover_common::config::CameraConfig;
use pi_rover_common::frame::FrameRelay;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SOI: &[u8] = &[0xFF, 0xD8];
const EOI: &[u8] = &[0xFF, 0xD9];

/// Largest image the splitter will buffer before giving up on it.
const MAX_IMAGE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("failed to run {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("no cameras detected")]
    NotDetected,
    #[error("camera process has no stdout handle")]
    NoStdout,
    #[error("no frames received from camera within {0:?}")]
    NoFrames(Duration),
    #[error("camera process exited during startup: {0}")]
    Exited(std::process::ExitStatus),
}

/// A camera as reported by `rpicam-hello --list-cameras`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub index: u32,
    pub model: String,
}

/// Parse the camera listing. Sensor lines look like
/// `0 : ov5647 [2592x1944 10-bit GBRG] (/base/soc/i2c0mux/i2c@1/ov5647@36)`;
/// mode lines and headers are skipped.
pub fn parse_camera_list(output: &str) -> Vec<CameraInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (index, rest) = line.trim().split_once(" : ")?;
            let index = index.trim().parse().ok()?;
            let model = rest.split_whitespace().next()?.to_string();
            Some(CameraInfo { index, model })
        })
        .collect()
}

/// Check that at least one camera is attached.
pub async fn list_cameras(config: &CameraConfig) -> Result<Vec<CameraInfo>, CameraError> {
    let output = Command::new(&config.list_command)
        .arg("--list-cameras")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| CameraError::Spawn(config.list_command.clone(), e))?;

    // rpicam-hello prints the listing on stdout, older libcamera builds on stderr.
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    let cameras = parse_camera_list(&text);
    if cameras.is_empty() {
        error!("no cameras detected");
        warn!("check the camera ribbon cable connection");
        warn!("run: {} --list-cameras", config.list_command);
        warn!("ensure the legacy camera stack is disabled in raspi-config, then reboot");
        return Err(CameraError::NotDetected);
    }
    for camera in &cameras {
        info!(index = camera.index, model = camera.model, "detected camera");
    }
    Ok(cameras)
}

/// Arguments for a continuous MJPEG capture written to stdout.
pub fn vid_args(config: &CameraConfig) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-t".into(),
        "0".into(),
        "-n".into(),
        "--codec".into(),
        "mjpeg".into(),
        "--width".into(),
        config.width.to_string(),
        "--height".into(),
        config.height.to_string(),
        "--framerate".into(),
        config.framerate.to_string(),
        "-q".into(),
        config.quality.to_string(),
    ];
    if config.hflip {
        args.push("--hflip".into());
    }
    if config.vflip {
        args.push("--vflip".into());
    }
    args.extend(["-o".into(), "-".into()]);
    args
}

/// Parse state for a raw concatenated JPEG byte stream.
enum ParseState {
    /// Looking for the start-of-image marker.
    SeekingStart,
    /// Inside an image, looking for the end-of-image marker.
    CollectingJpeg,
}

/// Splits a byte stream of back-to-back JPEG images into whole images.
pub struct JpegSplitter {
    buffer: BytesMut,
    state: ParseState,
    /// Offset in `buffer` from which to resume the EOI search.
    scan_from: usize,
}

impl Default for JpegSplitter {
    fn default() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingStart,
            scan_from: 0,
        }
    }
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every image it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut images = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingStart => {
                    if let Some(pos) = find_subsequence(&self.buffer, SOI) {
                        let _ = self.buffer.split_to(pos);
                        self.scan_from = SOI.len();
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        // Keep a trailing 0xFF in case the marker spans chunks
                        if self.buffer.len() > 1 {
                            let _ = self.buffer.split_to(self.buffer.len() - 1);
                        }
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    if let Some(pos) = find_subsequence(&self.buffer[self.scan_from..], EOI) {
                        let end = self.scan_from + pos + EOI.len();
                        images.push(self.buffer.split_to(end).freeze());
                        self.state = ParseState::SeekingStart;
                    } else if self.buffer.len() > MAX_IMAGE_BYTES {
                        warn!(
                            buffered = self.buffer.len(),
                            "no end of image marker, discarding partial image"
                        );
                        self.buffer.clear();
                        self.state = ParseState::SeekingStart;
                        break;
                    } else {
                        self.scan_from = self.buffer.len().saturating_sub(1).max(SOI.len());
                        break;
                    }
                }
            }
        }

        images
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// A running capture process feeding the frame relay.
pub struct CameraStream {
    child: Child,
    reader: JoinHandle<()>,
}

impl CameraStream {
    /// Spawn the capture process and wait until its first frame arrives.
    pub async fn start(config: &CameraConfig, relay: Arc<FrameRelay>) -> Result<Self, CameraError> {
        let args = vid_args(config);
        debug!(command = config.vid_command, ?args, "spawning camera process");

        let mut child = Command::new(&config.vid_command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CameraError::Spawn(config.vid_command.clone(), e))?;

        let mut stdout = child.stdout.take().ok_or(CameraError::NoStdout)?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "camera", "{line}");
                }
            });
        }

        let mut first_frame = relay.subscribe();
        let reader_relay = Arc::clone(&relay);
        let reader = tokio::spawn(async move {
            let mut splitter = JpegSplitter::new();
            let mut buf = vec![0u8; 64 * 1024];
            let mut total: u64 = 0;
            loop {
                let n = match stdout.read(&mut buf).await {
                    Ok(0) => {
                        warn!(frames = total, "camera process closed its output");
                        return;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        error!(error = %e, "failed to read from camera process");
                        return;
                    }
                };
                for jpeg in splitter.push(&buf[..n]) {
                    total += 1;
                    let seq = reader_relay.publish(jpeg);
                    if seq % 300 == 0 {
                        debug!(seq, "frames published");
                    }
                }
            }
        });

        let timeout = Duration::from_secs(config.startup_timeout_secs);
        let failure = tokio::select! {
            frame = tokio::time::timeout(timeout, first_frame.next_frame()) => match frame {
                Ok(_) => None,
                Err(_) => Some(CameraError::NoFrames(timeout)),
            },
            status = child.wait() => Some(match status {
                Ok(status) => CameraError::Exited(status),
                Err(e) => CameraError::Spawn(config.vid_command.clone(), e),
            }),
        };

        let mut stream = Self { child, reader };
        if let Some(err) = failure {
            stream.stop().await;
            return Err(err);
        }

        info!(
            width = config.width,
            height = config.height,
            framerate = config.framerate,
            hflip = config.hflip,
            vflip = config.vflip,
            "camera streaming"
        );
        Ok(stream)
    }

    pub async fn stop(&mut self) {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(%status, "camera process already exited");
        } else if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to stop camera process");
        }
        self.reader.abort();
        info!("camera stopped");
    }
}
