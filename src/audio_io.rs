// src/audio_io.rs

use crate::audio_engine::AudioEngine;
use crate::config::Config;
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleFormat, SampleRate, Stream, StreamConfig};

/// Channel count needed for the raw per-engine outputs on pairs 3-4/5-6/7-8.
const RAW_OUTPUT_CHANNELS: u16 = 8;

fn supports_f32(device: &Device, wanted: &StreamConfig) -> bool {
    let Ok(ranges) = device.supported_output_configs() else {
        return false;
    };
    for range in ranges {
        if range.sample_format() == SampleFormat::F32
            && range.channels() == wanted.channels
            && range.min_sample_rate() <= wanted.sample_rate
            && wanted.sample_rate <= range.max_sample_rate()
        {
            return true;
        }
    }
    false
}

/// Opens the default output device and starts the stream that drives the
/// mixer. The returned stream must be kept alive for the duration of the
/// session; dropping it stops the callback, which is the first step of the
/// ordered shutdown.
pub fn start_output(cfg: &Config, mut engine: AudioEngine) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("no default audio output device"))?;
    println!("Using output device: {}", device.name()?);

    let default_config = device
        .default_output_config()
        .context("querying default output config")?;
    if default_config.sample_format() != SampleFormat::F32 {
        return Err(anyhow!(
            "output device does not offer f32 samples (got {})",
            default_config.sample_format()
        ));
    }

    let device_channels = default_config.channels();
    let channels = if cfg.enable_raw_outputs && device_channels >= RAW_OUTPUT_CHANNELS {
        RAW_OUTPUT_CHANNELS
    } else {
        device_channels.min(2).max(1)
    };
    if cfg.enable_raw_outputs && device_channels < RAW_OUTPUT_CHANNELS {
        eprintln!(
            "raw outputs requested but the device has {} channels; raw taps disabled",
            device_channels
        );
    }

    let requested = StreamConfig {
        channels,
        sample_rate: SampleRate(cfg.sample_rate),
        buffer_size: BufferSize::Fixed(cfg.audio_buffer_size as u32),
    };

    // The exact rate/size combination is not available everywhere; fall back
    // to the device defaults rather than refusing to run.
    let stream_config = if supports_f32(&device, &requested) {
        println!(
            "Audio: {} Hz, {} frames, {} channels",
            cfg.sample_rate, cfg.audio_buffer_size, channels
        );
        requested
    } else {
        eprintln!(
            "requested stream config ({} Hz, {} ch) unavailable; using device defaults",
            cfg.sample_rate, channels
        );
        default_config.into()
    };

    let ch = stream_config.channels as usize;
    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                engine.process(data, ch);
            },
            |err| eprintln!("audio stream error: {}", err),
            None,
        )
        .context("opening output stream")?;

    stream.play().context("starting output stream")?;
    Ok(stream)
}
