//! CPAL-based audio backend for desktop platforms (Linux, macOS, Windows)
//!
//! Device callbacks and worker threads communicate through `rtrb` SPSC ring
//! buffers: the input callback pushes mono samples, the capture thread pops
//! them; the render thread pushes output samples, the output callback pops
//! them and substitutes silence on underrun. Neither callback allocates or
//! locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ::cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::audio::clock::CancelToken;
use crate::error::AudioError;

use super::{InputProvider, InputRequest, InputSource, OutputProvider, OutputSink};

/// Seconds of input audio the ring buffer can hold before the callback drops
const INPUT_RING_SECONDS: u32 = 2;

/// Output ring size in frames; bounds how far rendering runs ahead of the DAC
const OUTPUT_RING_FRAMES: usize = 2048;

/// CPAL backend using the host's default input and output devices
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

fn default_input_device() -> Result<::cpal::Device, AudioError> {
    ::cpal::default_host()
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceUnavailable {
            device: "default input".to_string(),
            reason: "No default input device found".to_string(),
        })
}

fn default_output_device() -> Result<::cpal::Device, AudioError> {
    ::cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::DeviceUnavailable {
            device: "default output".to_string(),
            reason: "No default output device found".to_string(),
        })
}

/// Push the first channel of each interleaved frame into the ring
fn push_mono<T: Copy>(
    producer: &mut Producer<f32>,
    data: &[T],
    channels: usize,
    convert: impl Fn(T) -> f32,
) {
    for frame in data.chunks(channels.max(1)) {
        if let Some(&sample) = frame.first() {
            // Full ring: the reader fell behind, drop the newest samples
            if producer.push(convert(sample)).is_err() {
                break;
            }
        }
    }
}

struct CpalInput {
    _stream: ::cpal::Stream,
    consumer: Consumer<f32>,
    sample_rate: u32,
    failed: Arc<AtomicBool>,
}

impl CpalInput {
    fn build(
        device: &::cpal::Device,
        config: ::cpal::StreamConfig,
        format: ::cpal::SampleFormat,
    ) -> Result<Self, AudioError> {
        let sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;
        let (mut producer, consumer) =
            RingBuffer::<f32>::new((sample_rate * INPUT_RING_SECONDS) as usize);

        let failed = Arc::new(AtomicBool::new(false));
        let failed_cb = Arc::clone(&failed);
        let err_fn = move |err: ::cpal::StreamError| {
            tracing::error!("[CpalBackend] Input stream error: {}", err);
            failed_cb.store(true, Ordering::Release);
        };

        let stream = match format {
            ::cpal::SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &::cpal::InputCallbackInfo| {
                    push_mono(&mut producer, data, channels, |s| s);
                },
                err_fn,
                None,
            ),
            ::cpal::SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &::cpal::InputCallbackInfo| {
                    push_mono(&mut producer, data, channels, |s| s as f32 / 32768.0);
                },
                err_fn,
                None,
            ),
            other => {
                return Err(AudioError::InvalidSampleFormat {
                    format: format!("{:?}", other),
                })
            }
        }
        .map_err(|e| AudioError::StreamOpenFailed {
            reason: format!("{:?}", e),
        })?;

        stream.play().map_err(|e| AudioError::HardwareError {
            details: format!("Input start failed: {}", e),
        })?;

        Ok(Self {
            _stream: stream,
            consumer,
            sample_rate,
            failed,
        })
    }
}

impl InputSource for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [f32], timeout: Duration) -> Result<usize, AudioError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.failed.load(Ordering::Acquire) {
                return Err(AudioError::StreamFailure {
                    reason: "input stream reported an error".to_string(),
                });
            }

            let available = self.consumer.slots().min(buf.len());
            if available > 0 {
                if let Ok(chunk) = self.consumer.read_chunk(available) {
                    let (first, second) = chunk.as_slices();
                    buf[..first.len()].copy_from_slice(first);
                    buf[first.len()..first.len() + second.len()].copy_from_slice(second);
                    chunk.commit_all();
                }
                return Ok(available);
            }

            if Instant::now() >= deadline {
                return Ok(0);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

impl InputProvider for CpalBackend {
    fn open(&self, request: &InputRequest) -> Result<Box<dyn InputSource>, AudioError> {
        let device = default_input_device()?;

        let min_frames = device
            .default_input_config()
            .ok()
            .and_then(|c| match c.buffer_size() {
                ::cpal::SupportedBufferSize::Range { min, .. } => Some(*min),
                ::cpal::SupportedBufferSize::Unknown => None,
            })
            .unwrap_or(0);

        let config = ::cpal::StreamConfig {
            channels: request.channels,
            sample_rate: ::cpal::SampleRate(request.sample_rate),
            buffer_size: ::cpal::BufferSize::Fixed(request.buffer_frames.max(min_frames)),
        };

        tracing::info!(
            "[CpalBackend] Opening input: {} Hz, {} ch, buffer {:?}",
            request.sample_rate,
            request.channels,
            config.buffer_size
        );

        let input = CpalInput::build(&device, config, ::cpal::SampleFormat::F32)?;
        Ok(Box::new(input))
    }

    fn open_fallback(&self) -> Result<Box<dyn InputSource>, AudioError> {
        let device = default_input_device()?;
        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::StreamOpenFailed {
                reason: format!("Failed to get default input config: {:?}", e),
            })?;

        tracing::info!(
            "[CpalBackend] Opening input with device defaults: {:?}",
            supported
        );

        let format = supported.sample_format();
        let input = CpalInput::build(&device, supported.config(), format)?;
        Ok(Box::new(input))
    }
}

struct CpalOutput {
    _stream: ::cpal::Stream,
    producer: Producer<f32>,
    sample_rate: u32,
    failed: Arc<AtomicBool>,
}

impl OutputSink for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn write(&mut self, samples: &[f32], cancel: &CancelToken) -> Result<(), AudioError> {
        let mut written = 0;
        while written < samples.len() {
            if self.failed.load(Ordering::Acquire) {
                return Err(AudioError::StreamFailure {
                    reason: "output stream reported an error".to_string(),
                });
            }

            let free = self.producer.slots();
            if free == 0 {
                if cancel.wait_for(Duration::from_millis(2)) {
                    return Ok(());
                }
                continue;
            }

            let n = free.min(samples.len() - written);
            if let Ok(chunk) = self.producer.write_chunk_uninit(n) {
                chunk.fill_from_iter(samples[written..written + n].iter().copied());
            }
            written += n;
        }
        Ok(())
    }
}

impl OutputProvider for CpalBackend {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputSink>, AudioError> {
        let device = default_output_device()?;
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::StreamOpenFailed {
                reason: format!("Failed to get default output config: {:?}", e),
            })?;

        if supported.sample_format() != ::cpal::SampleFormat::F32 {
            return Err(AudioError::InvalidSampleFormat {
                format: format!("{:?}", supported.sample_format()),
            });
        }

        // Prefer the caller's rate; the device default is the fallback
        let mut config: ::cpal::StreamConfig = supported.config();
        let preferred = ::cpal::StreamConfig {
            sample_rate: ::cpal::SampleRate(sample_rate),
            ..config.clone()
        };

        let channels = config.channels as usize;
        let failed = Arc::new(AtomicBool::new(false));

        let build = |config: &::cpal::StreamConfig| {
            let (producer, mut consumer) = RingBuffer::<f32>::new(OUTPUT_RING_FRAMES);
            let failed_cb = Arc::clone(&failed);
            device
                .build_output_stream(
                    config,
                    move |data: &mut [f32], _: &::cpal::OutputCallbackInfo| {
                        for frame in data.chunks_mut(channels.max(1)) {
                            let value = consumer.pop().unwrap_or(0.0);
                            for sample in frame.iter_mut() {
                                *sample = value;
                            }
                        }
                    },
                    move |err| {
                        tracing::error!("[CpalBackend] Output stream error: {}", err);
                        failed_cb.store(true, Ordering::Release);
                    },
                    None,
                )
                .map(|stream| (stream, producer))
        };

        let (stream, producer) = match build(&preferred) {
            Ok(built) => {
                config = preferred;
                built
            }
            Err(err) => {
                tracing::warn!(
                    "[CpalBackend] Output at {} Hz unavailable ({:?}); using {} Hz",
                    sample_rate,
                    err,
                    config.sample_rate.0
                );
                build(&config).map_err(|e| AudioError::StreamOpenFailed {
                    reason: format!("{:?}", e),
                })?
            }
        };

        stream.play().map_err(|e| AudioError::HardwareError {
            details: format!("Output start failed: {}", e),
        })?;

        Ok(Box::new(CpalOutput {
            _stream: stream,
            producer,
            sample_rate: config.sample_rate.0,
            failed,
        }))
    }
}
