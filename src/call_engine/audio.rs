//! Audio Handler - Mikrofon Capture und Playback
//!
//! Der Relay spricht nur mit den Traits `AudioCapture`/`AudioPlayback`.
//! Das Standard-Backend verwendet cpal; zwischen Geräte-Callback und Relay
//! liegt jeweils ein Ring-Buffer mit 16-Bit-Samples im Wire-Format
//! (16kHz Mono, Little-Endian). Ein Codec ist bewusst nicht vorgesehen.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Ring-Buffer-Größe in Frames
const RING_BUFFER_FRAMES: usize = 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Audio device error: {0}")]
    Device(String),
}

// ============================================================================
// FORMAT
// ============================================================================

/// PCM-Format auf dem Wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration: Duration,
}

impl AudioFormat {
    /// 16-Bit Mono mit gegebener Rate und Frame-Dauer
    pub fn voice(sample_rate: u32, frame_duration: Duration) -> Self {
        Self {
            sample_rate,
            channels: CHANNELS,
            frame_duration,
        }
    }

    /// Samples pro Frame (über alle Kanäle)
    pub fn frame_samples(&self) -> usize {
        let per_channel =
            self.sample_rate as usize * self.frame_duration.as_millis() as usize / 1000;
        per_channel * self.channels as usize
    }

    /// Bytes pro Frame (16 Bit pro Sample)
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples() * 2
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Aufnahme-Handle, gehört für die Dauer eines Anrufs dem Send-Loop
pub trait AudioCapture: Send {
    /// Liest höchstens einen Frame; 0 heißt "noch kein vollständiger Frame"
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError>;

    fn release(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
}

/// Wiedergabe-Handle, gehört für die Dauer eines Anrufs dem Receive-Loop
pub trait AudioPlayback: Send {
    fn write(&mut self, buf: &[u8]) -> Result<usize, AudioError>;

    fn release(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
}

/// Plattform-Audio
pub trait AudioBackend: Send + Sync {
    fn open_capture(&self, format: &AudioFormat) -> Result<Box<dyn AudioCapture>, AudioError>;

    fn open_playback(&self, format: &AudioFormat) -> Result<Box<dyn AudioPlayback>, AudioError>;

    /// Audio-Routing für Telefonie (Hörer statt Lautsprecher etc.)
    fn enter_call_mode(&self) -> Result<(), AudioError> {
        Ok(())
    }

    fn exit_call_mode(&self) -> Result<(), AudioError> {
        Ok(())
    }
}

// ============================================================================
// CPAL BACKEND
// ============================================================================

/// Standard-Backend über die Default-Geräte von cpal
#[derive(Debug, Clone, Default)]
pub struct CpalAudioBackend;

impl AudioBackend for CpalAudioBackend {
    fn open_capture(&self, format: &AudioFormat) -> Result<Box<dyn AudioCapture>, AudioError> {
        Ok(Box::new(CpalCapture::open(format)?))
    }

    fn open_playback(&self, format: &AudioFormat) -> Result<Box<dyn AudioPlayback>, AudioError> {
        Ok(Box::new(CpalPlayback::open(format)?))
    }
}

type SampleRing = Arc<Mutex<HeapRb<i16>>>;

/// Mikrofon über cpal
pub struct CpalCapture {
    stream: Option<Stream>,
    buffer: SampleRing,
    frame_samples: usize,
}

// Stream ist nicht Send; er wird nur vom besitzenden Loop angefasst
unsafe impl Send for CpalCapture {}

impl CpalCapture {
    fn open(format: &AudioFormat) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;

        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let config = select_best_config(configs.collect(), format.sample_rate)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let buffer: SampleRing = Arc::new(Mutex::new(HeapRb::new(
            format.frame_samples() * RING_BUFFER_FRAMES,
        )));
        let capture_buffer = Arc::clone(&buffer);
        let source_rate = config.sample_rate.0;
        let target_rate = format.sample_rate;
        let channels = config.channels as usize;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = downmix(data, channels);
                    let samples = resample(&mono, source_rate, target_rate);

                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(f32_to_i16(sample));
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            buffer,
            frame_samples: format.frame_samples(),
        })
    }
}

impl AudioCapture for CpalCapture {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        let wanted = (buf.len() / 2).min(self.frame_samples);
        let mut buffer = self.buffer.lock();
        if wanted == 0 || buffer.occupied_len() < wanted {
            return Ok(0);
        }

        for chunk in buf[..wanted * 2].chunks_exact_mut(2) {
            let sample = buffer.try_pop().unwrap_or(0);
            chunk.copy_from_slice(&sample.to_le_bytes());
        }
        Ok(wanted * 2)
    }

    fn release(&mut self) -> Result<(), AudioError> {
        if let Some(stream) = self.stream.take() {
            stream
                .pause()
                .map_err(|e| AudioError::Device(e.to_string()))?;
            tracing::info!("Audio capture stopped");
        }
        Ok(())
    }
}

/// Lautsprecher über cpal
pub struct CpalPlayback {
    stream: Option<Stream>,
    buffer: SampleRing,
}

// Siehe CpalCapture
unsafe impl Send for CpalPlayback {}

impl CpalPlayback {
    fn open(format: &AudioFormat) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        let configs = device
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let config = select_best_config(configs.collect(), format.sample_rate)?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let buffer: SampleRing = Arc::new(Mutex::new(HeapRb::new(
            format.frame_samples() * RING_BUFFER_FRAMES,
        )));
        let playback_buffer = Arc::clone(&buffer);
        let source_rate = format.sample_rate;
        let target_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames_needed = data.len() / channels.max(1);
                    let source_needed = (frames_needed as u64 * source_rate as u64)
                        .div_ceil(target_rate.max(1) as u64)
                        as usize;

                    let source: Vec<f32> = {
                        let mut buffer = playback_buffer.lock();
                        (0..source_needed)
                            .map(|_| i16_to_f32(buffer.try_pop().unwrap_or(0)))
                            .collect()
                    };
                    let samples = resample(&source, source_rate, target_rate);

                    // Mono auf alle Kanäle verteilen
                    for (i, frame) in data.chunks_mut(channels.max(1)).enumerate() {
                        let sample = samples.get(i).copied().unwrap_or(0.0);
                        for s in frame.iter_mut() {
                            *s = sample;
                        }
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            buffer,
        })
    }
}

impl AudioPlayback for CpalPlayback {
    fn write(&mut self, buf: &[u8]) -> Result<usize, AudioError> {
        let mut buffer = self.buffer.lock();
        let mut written = 0;
        for chunk in buf.chunks_exact(2) {
            if buffer
                .try_push(i16::from_le_bytes([chunk[0], chunk[1]]))
                .is_err()
            {
                // Voll: Rest verwerfen, Latenz bleibt begrenzt
                break;
            }
            written += 2;
        }
        Ok(written)
    }

    fn release(&mut self) -> Result<(), AudioError> {
        if let Some(stream) = self.stream.take() {
            stream
                .pause()
                .map_err(|e| AudioError::Device(e.to_string()))?;
            tracing::info!("Audio playback stopped");
        }
        Ok(())
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Wählt die beste Konfiguration aus einer Liste
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
    sample_rate: u32,
) -> Result<StreamConfig, AudioError> {
    // Priorität: exakte Rate in F32 > beliebige F32; die Callbacks sind auf f32 typisiert
    let target_rate = cpal::SampleRate(sample_rate);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            let rate = if config.min_sample_rate() <= target_rate {
                target_rate.min(config.max_sample_rate())
            } else {
                config.min_sample_rate()
            };
            return Ok(config.with_sample_rate(rate).into());
        }
    }

    let formats: Vec<String> = configs
        .iter()
        .map(|config| format!("{:?}", config.sample_format()))
        .collect();
    Err(AudioError::UnsupportedConfig(format!(
        "No f32 audio configuration found (available: {})",
        if formats.is_empty() {
            "none".to_string()
        } else {
            formats.join(", ")
        }
    )))
}

/// Mittelt interleaved Kanäle zu Mono
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Einfaches lineares Resampling
fn resample(data: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || data.is_empty() || from_rate == 0 {
        return data.to_vec();
    }

    let ratio = to_rate as f32 / from_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        let format = AudioFormat::voice(16000, Duration::from_millis(20));
        assert_eq!(format.frame_samples(), 320);
        assert_eq!(format.frame_bytes(), 640);
    }

    #[test]
    fn test_downmix_stereo() {
        let stereo = [0.5, -0.5, 1.0, 0.0];
        assert_eq!(downmix(&stereo, 2), vec![0.0, 0.5]);
        assert_eq!(downmix(&stereo, 1), stereo.to_vec());
    }

    #[test]
    fn test_resample_48k_to_16k() {
        let input: Vec<f32> = (0..960).map(|i| i as f32 / 960.0).collect();
        let output = resample(&input, 48000, 16000);
        assert_eq!(output.len(), 320);
        assert!((output[1] - input[3]).abs() < 1e-6);
    }

    #[test]
    fn test_sample_conversion() {
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
        assert!((i16_to_f32(i16::MAX) - 1.0).abs() < 1e-6);
    }

    fn range(format: SampleFormat, min: u32, max: u32) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            2,
            cpal::SampleRate(min),
            cpal::SampleRate(max),
            cpal::SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_select_prefers_exact_f32_rate() {
        let configs = vec![
            range(SampleFormat::I16, 8000, 48000),
            range(SampleFormat::F32, 44100, 48000),
            range(SampleFormat::F32, 8000, 48000),
        ];

        let config = select_best_config(configs, 16000).unwrap();
        assert_eq!(config.sample_rate.0, 16000);
    }

    #[test]
    fn test_select_falls_back_to_nearest_f32_rate() {
        let configs = vec![
            range(SampleFormat::I16, 8000, 48000),
            range(SampleFormat::F32, 44100, 48000),
        ];

        let config = select_best_config(configs, 16000).unwrap();
        assert_eq!(config.sample_rate.0, 44100);
    }

    #[test]
    fn test_select_rejects_non_f32_devices() {
        let configs = vec![range(SampleFormat::I16, 8000, 48000)];

        assert!(matches!(
            select_best_config(configs, 16000),
            Err(AudioError::UnsupportedConfig(_))
        ));
        assert!(matches!(
            select_best_config(Vec::new(), 16000),
            Err(AudioError::UnsupportedConfig(_))
        ));
    }
}
