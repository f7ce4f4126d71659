//! Audio codec, SFU media-engine codec descriptors, client DSP graph and VAD.

pub mod audio;
pub mod codec;
pub mod dsp;
pub mod vad;

pub use audio::{AudioDecoder, AudioEncoder, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
pub use dsp::{AudioPipeline, CompressorParams, NoiseSuppressor, PipelineConfig};
pub use vad::VoiceActivityDetector;
