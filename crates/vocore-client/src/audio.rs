//! Capture/playback wiring over [`vocore_media`]'s DSP graph (section 4.5).
//!
//! Capture requests mono 48kHz from the device; the wire codec is stereo
//! (`vocore_media::codec::audio_codec_parameters`), so frames are duplicated
//! to both channels right before Opus encoding. `cpal::Stream` isn't `Send`,
//! so both [`AudioCapture`] and [`AudioPlayback`] hold theirs directly and
//! must stay on whichever thread started them, same as the source this is
//! adapted from.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use tokio::sync::mpsc;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use vocore_media::dsp::{AudioPipeline, PipelineConfig};
use vocore_media::{AudioDecoder, AudioEncoder, VoiceActivityDetector, CHANNELS, FRAME_SIZE, SAMPLE_RATE};

use crate::error::ClientError;

const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Duplicates each mono sample into both channels of `stereo`, in place.
/// `stereo` must be exactly `2 * mono.len()` long.
fn duplicate_to_stereo(mono: &[f32], stereo: &mut [f32]) {
    for (i, sample) in mono.iter().enumerate() {
        stereo[i * CHANNELS] = *sample;
        stereo[i * CHANNELS + 1] = *sample;
    }
}

fn input_device(name: Option<&str>) -> Result<cpal::Device, ClientError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| ClientError::Connect(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or(ClientError::MicDeviceAbsent),
        None => host.default_input_device().ok_or(ClientError::MicDeviceAbsent),
    }
}

/// Outbound half: captures mono mic audio, runs it through the DSP graph
/// and VAD, encodes to Opus, and writes samples to the negotiator's audio
/// track. Mute is applied after the VAD observes the frame, so speaking
/// state still reflects what the mic is actually picking up.
pub struct AudioCapture {
    stream: Option<cpal::Stream>,
    muted: Arc<AtomicBool>,
    pipeline_tx: Option<mpsc::UnboundedSender<PipelineConfig>>,
}

impl AudioCapture {
    pub fn new() -> Self {
        Self { stream: None, muted: Arc::new(AtomicBool::new(false)), pipeline_tx: None }
    }

    pub fn list_devices() -> Result<Vec<String>, ClientError> {
        let host = cpal::default_host();
        Ok(host
            .input_devices()
            .map_err(|e| ClientError::Connect(e.to_string()))?
            .filter_map(|d| d.name().ok())
            .collect())
    }

    /// Starts capture on `device_name` (or the default device), writing
    /// Opus samples to `track`. Returns a receiver of debounced
    /// speaking-state changes from the VAD.
    pub fn start(
        &mut self,
        device_name: Option<&str>,
        config: PipelineConfig,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<mpsc::UnboundedReceiver<bool>, ClientError> {
        let device = input_device(device_name)?;

        let stream_config =
            StreamConfig { channels: 1, sample_rate: SampleRate(SAMPLE_RATE), buffer_size: BufferSize::Default };

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Vec<f32>>();
        let mut carry: Vec<f32> = Vec::with_capacity(FRAME_SIZE);

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    carry.extend_from_slice(data);
                    while carry.len() >= FRAME_SIZE {
                        let frame: Vec<f32> = carry.drain(..FRAME_SIZE).collect();
                        let _ = raw_tx.send(frame);
                    }
                },
                |err| tracing::error!("audio capture error: {}", err),
                None,
            )
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        stream.play().map_err(|e| ClientError::Connect(e.to_string()))?;

        let (pipeline_tx, mut pipeline_rx) = mpsc::unbounded_channel::<PipelineConfig>();
        let (speaking_tx, speaking_rx) = mpsc::unbounded_channel::<bool>();
        let muted = self.muted.clone();

        tokio::spawn(async move {
            let mut pipeline = match AudioPipeline::new(config) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!("failed to build audio pipeline: {}", e);
                    return;
                }
            };
            let mut encoder = match AudioEncoder::new() {
                Ok(e) => e,
                Err(e) => {
                    tracing::error!("failed to build opus encoder: {}", e);
                    return;
                }
            };
            let mut vad = VoiceActivityDetector::default();
            let mut stereo = vec![0.0f32; FRAME_SIZE * CHANNELS];
            let mut was_speaking = false;

            while let Some(mut frame) = raw_rx.recv().await {
                while let Ok(new_config) = pipeline_rx.try_recv() {
                    if let Err(e) = pipeline.reconfigure(new_config) {
                        tracing::warn!("audio pipeline reconfigure failed: {}", e);
                    }
                }

                if let Err(e) = pipeline.process(&mut frame) {
                    tracing::warn!("audio pipeline error: {}", e);
                }

                let speaking = vad.observe_samples(&frame);
                if speaking != was_speaking {
                    was_speaking = speaking;
                    let _ = speaking_tx.send(speaking);
                }

                if muted.load(Ordering::SeqCst) {
                    continue;
                }

                duplicate_to_stereo(&frame, &mut stereo);

                match encoder.encode_float(&stereo) {
                    Ok(payload) => {
                        let sample = Sample { data: Bytes::from(payload), duration: FRAME_DURATION, ..Default::default() };
                        if let Err(e) = track.write_sample(&sample).await {
                            tracing::debug!("outbound audio write failed: {}", e);
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("opus encode failed: {}", e),
                }
            }
        });

        self.stream = Some(stream);
        self.pipeline_tx = Some(pipeline_tx);
        Ok(speaking_rx)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Rebuilds the DSP graph in place without restarting capture.
    pub fn reconfigure(&self, config: PipelineConfig) {
        if let Some(tx) = &self.pipeline_tx {
            let _ = tx.send(config);
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stop(&mut self) {
        self.stream = None;
        self.pipeline_tx = None;
    }
}

impl Default for AudioCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound half: decodes a remote participant's Opus track and plays it on
/// the chosen output device.
pub struct AudioPlayback {
    stream: Option<cpal::Stream>,
}

impl AudioPlayback {
    pub fn new() -> Self {
        Self { stream: None }
    }

    pub fn list_devices() -> Result<Vec<String>, ClientError> {
        let host = cpal::default_host();
        Ok(host
            .output_devices()
            .map_err(|e| ClientError::Connect(e.to_string()))?
            .filter_map(|d| d.name().ok())
            .collect())
    }

    /// Starts playback of `remote` on `device_name` (or the default
    /// device). Switching devices mid-call means `stop` then `start` again
    /// on the new name; platforms without a sink-selection API just keep
    /// playing on the default device (logged, not an error).
    pub fn start(&mut self, device_name: Option<&str>, remote: Arc<TrackRemote>) -> Result<(), ClientError> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => match host.output_devices().ok().and_then(|mut it| it.find(|d| d.name().map(|n| n == name).unwrap_or(false))) {
                Some(d) => d,
                None => {
                    tracing::warn!("output device '{}' not found, falling back to default", name);
                    host.default_output_device().ok_or(ClientError::MicDeviceAbsent)?
                }
            },
            None => host.default_output_device().ok_or(ClientError::MicDeviceAbsent)?,
        };

        let supported = device.default_output_config().map_err(|e| ClientError::Connect(e.to_string()))?;

        let sample_buffer: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
        let buffer_for_task = sample_buffer.clone();

        tokio::spawn(async move {
            let mut decoder = match AudioDecoder::new() {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!("failed to build opus decoder: {}", e);
                    return;
                }
            };
            loop {
                match remote.read_rtp().await {
                    Ok((packet, _attributes)) => match decoder.decode_float(&packet.payload) {
                        Ok(samples) => buffer_for_task.lock().unwrap().extend(samples),
                        Err(e) => tracing::debug!("opus decode failed: {}", e),
                    },
                    Err(e) => {
                        let msg = e.to_string();
                        if msg.contains("closed") || msg.contains("eof") {
                            tracing::debug!("remote audio track closed");
                        } else {
                            tracing::debug!("error reading remote audio track: {}", e);
                        }
                        break;
                    }
                }
            }
        });

        let stream = device
            .build_output_stream(
                &supported.into(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buffer = sample_buffer.lock().unwrap();
                    let len = data.len().min(buffer.len());
                    data[..len].copy_from_slice(&buffer[..len]);
                    for sample in &mut data[len..] {
                        *sample = 0.0;
                    }
                    buffer.drain(..len);
                },
                |err| tracing::error!("audio playback error: {}", err),
                None,
            )
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        stream.play().map_err(|e| ClientError::Connect(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stream = None;
    }
}

impl Default for AudioPlayback {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_to_stereo_interleaves_both_channels() {
        let mono = [0.1, -0.2, 0.3];
        let mut stereo = vec![0.0; mono.len() * CHANNELS];
        duplicate_to_stereo(&mono, &mut stereo);
        assert_eq!(stereo, vec![0.1, 0.1, -0.2, -0.2, 0.3, 0.3]);
    }

    #[test]
    fn new_capture_starts_unmuted_and_idle() {
        let capture = AudioCapture::new();
        assert!(!capture.is_muted());
        assert!(!capture.is_capturing());
    }
}
