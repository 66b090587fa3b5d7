//! Input device enumeration

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::AudioError;

/// Summary of an input device, as shown by the sender binary at startup.
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all available input devices
pub fn list_input_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let is_default = default_name.as_ref() == Some(&name);
                let (sample_rates, channels) = device_capabilities(&device);
                devices.push(AudioDeviceInfo {
                    name,
                    is_default,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

fn device_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();

    if let Ok(configs) = device.supported_input_configs() {
        for config in configs {
            for rate_val in [44100u32, 48000, 88200, 96000] {
                let rate = cpal::SampleRate(rate_val);
                if rate >= config.min_sample_rate()
                    && rate <= config.max_sample_rate()
                    && !sample_rates.contains(&rate_val)
                {
                    sample_rates.push(rate_val);
                }
            }
            let ch = config.channels();
            if !channels.contains(&ch) {
                channels.push(ch);
            }
        }
    }

    sample_rates.sort();
    channels.sort();
    (sample_rates, channels)
}

/// Get the default input device
pub fn default_input_device() -> Result<AudioDeviceInfo, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("no default input device".into()))?;
    let name = device
        .name()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
    let (sample_rates, channels) = device_capabilities(&device);
    Ok(AudioDeviceInfo {
        name,
        is_default: true,
        sample_rates,
        channels,
    })
}
