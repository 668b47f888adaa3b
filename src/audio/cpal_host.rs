//! [`AudioHost`] implementation on top of `cpal`.
//!
//! Every host API cpal was compiled with is enumerated (ALSA and JACK on
//! Linux, CoreAudio on macOS, WASAPI and ASIO on Windows).  Streams are
//! opened in the device's native sample format and converted to `f32` in
//! the callback through a scratch buffer that grows to the largest buffer
//! the driver has delivered and is then reused.
//!
//! The [`DeviceStream`] returned by the `open_*` methods owns the
//! `cpal::Stream`; dropping it stops the hardware stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};

use super::host::{
    AudioHost, CallbackFlow, DeviceDescriptor, DeviceError, DeviceStream, Direction,
    FaultCallback, InputCallback, OutputCallback, StreamFault, StreamSpec,
};

// ---------------------------------------------------------------------------
// CpalHost
// ---------------------------------------------------------------------------

/// Audio backend over every available cpal host API.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalHost;

impl CpalHost {
    pub fn new() -> Self {
        Self
    }

    fn host_by_name(name: &str) -> Result<cpal::Host, DeviceError> {
        let id = cpal::available_hosts()
            .into_iter()
            .find(|id| id.name() == name)
            .ok_or_else(|| DeviceError::Enumerate(format!("audio host `{name}` is not available")))?;
        cpal::host_from_id(id).map_err(|e| DeviceError::Enumerate(e.to_string()))
    }

    fn host_devices(
        host: &cpal::Host,
        direction: Direction,
    ) -> Result<Box<dyn Iterator<Item = cpal::Device>>, DeviceError> {
        let devices: Box<dyn Iterator<Item = cpal::Device>> = match direction {
            Direction::Input => Box::new(
                host.input_devices()
                    .map_err(|e| DeviceError::Enumerate(e.to_string()))?,
            ),
            Direction::Output => Box::new(
                host.output_devices()
                    .map_err(|e| DeviceError::Enumerate(e.to_string()))?,
            ),
        };
        Ok(devices)
    }

    /// Find the cpal device behind a descriptor produced by this host.
    fn device_for(&self, descriptor: &DeviceDescriptor) -> Result<cpal::Device, DeviceError> {
        let host = Self::host_by_name(&descriptor.host)?;
        Self::host_devices(&host, descriptor.direction)?
            .find(|d| d.name().map(|n| n == descriptor.name).unwrap_or(false))
            .ok_or_else(|| DeviceError::NotFound {
                direction: descriptor.direction,
                name: descriptor.name.clone(),
            })
    }

    fn default_config(
        device: &cpal::Device,
        name: &str,
        direction: Direction,
    ) -> Result<cpal::SupportedStreamConfig, DeviceError> {
        let config = match direction {
            Direction::Input => device.default_input_config(),
            Direction::Output => device.default_output_config(),
        };
        config.map_err(|e| DeviceError::Config {
            device: name.to_owned(),
            reason: e.to_string(),
        })
    }

    fn stream_config(spec: StreamSpec) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: spec.channels,
            sample_rate: cpal::SampleRate(spec.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }
}

impl AudioHost for CpalHost {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let mut out = Vec::new();
        for id in cpal::available_hosts() {
            let host = match cpal::host_from_id(id) {
                Ok(host) => host,
                Err(e) => {
                    log::debug!("devices: skipping host {}: {e}", id.name());
                    continue;
                }
            };
            for direction in [Direction::Input, Direction::Output] {
                let devices = match Self::host_devices(&host, direction) {
                    Ok(devices) => devices,
                    Err(e) => {
                        log::warn!("devices: {} {direction} enumeration failed: {e}", id.name());
                        continue;
                    }
                };
                for (index, device) in devices.enumerate() {
                    let Ok(name) = device.name() else {
                        log::debug!("devices: unnamed {direction} device #{index} skipped");
                        continue;
                    };
                    match Self::default_config(&device, &name, direction) {
                        Ok(config) => out.push(DeviceDescriptor {
                            index,
                            name,
                            host: id.name().to_owned(),
                            direction,
                            default_sample_rate: config.sample_rate().0,
                            channels: config.channels(),
                        }),
                        Err(e) => log::debug!("devices: {e}"),
                    }
                }
            }
        }
        Ok(out)
    }

    fn resolve(
        &self,
        direction: Direction,
        name: Option<&str>,
    ) -> Result<DeviceDescriptor, DeviceError> {
        let listed = self.devices()?;

        let wanted = match name {
            Some(name) => name.to_owned(),
            None => {
                let host = cpal::default_host();
                let device = match direction {
                    Direction::Input => host.default_input_device(),
                    Direction::Output => host.default_output_device(),
                }
                .ok_or(DeviceError::NoDefault(direction))?;
                let name = device
                    .name()
                    .map_err(|e| DeviceError::Enumerate(e.to_string()))?;

                let host_name = host.id().name();
                if let Some(found) = listed
                    .iter()
                    .find(|d| d.direction == direction && d.host == host_name && d.name == name)
                {
                    return Ok(found.clone());
                }
                let config = Self::default_config(&device, &name, direction)?;
                return Ok(DeviceDescriptor {
                    index: 0,
                    name,
                    host: host_name.to_owned(),
                    direction,
                    default_sample_rate: config.sample_rate().0,
                    channels: config.channels(),
                });
            }
        };

        listed
            .into_iter()
            .find(|d| d.direction == direction && d.name == wanted)
            .ok_or(DeviceError::NotFound {
                direction,
                name: wanted,
            })
    }

    fn open_input(
        &self,
        device: &DeviceDescriptor,
        spec: StreamSpec,
        on_data: InputCallback,
        on_fault: FaultCallback,
    ) -> Result<DeviceStream, DeviceError> {
        let cpal_device = self.device_for(device)?;
        let format = Self::default_config(&cpal_device, &device.name, Direction::Input)?
            .sample_format();
        let config = Self::stream_config(spec);
        let stopped = Arc::new(AtomicBool::new(false));

        let stream = match format {
            SampleFormat::F32 => {
                build_input::<f32>(&cpal_device, &config, on_data, on_fault, &stopped)
            }
            SampleFormat::I16 => {
                build_input::<i16>(&cpal_device, &config, on_data, on_fault, &stopped)
            }
            other => {
                return Err(DeviceError::UnsupportedFormat {
                    device: device.name.clone(),
                    format: format!("{other:?}"),
                })
            }
        }
        .map_err(|e| DeviceError::Rejected {
            device: device.name.clone(),
            reason: e.to_string(),
        })?;

        stream.play().map_err(|e| DeviceError::Start {
            device: device.name.clone(),
            reason: e.to_string(),
        })?;
        log::info!(
            "audio: input stream started on `{}` ({} Hz, {} ch, {format:?})",
            device.name,
            spec.sample_rate,
            spec.channels
        );
        Ok(DeviceStream::new(Box::new(stream), stopped))
    }

    fn open_output(
        &self,
        device: &DeviceDescriptor,
        spec: StreamSpec,
        on_data: OutputCallback,
        on_fault: FaultCallback,
    ) -> Result<DeviceStream, DeviceError> {
        let cpal_device = self.device_for(device)?;
        let format = Self::default_config(&cpal_device, &device.name, Direction::Output)?
            .sample_format();
        let config = Self::stream_config(spec);
        let stopped = Arc::new(AtomicBool::new(false));

        let stream = match format {
            SampleFormat::F32 => {
                build_output::<f32>(&cpal_device, &config, on_data, on_fault, &stopped)
            }
            SampleFormat::I16 => {
                build_output::<i16>(&cpal_device, &config, on_data, on_fault, &stopped)
            }
            other => {
                return Err(DeviceError::UnsupportedFormat {
                    device: device.name.clone(),
                    format: format!("{other:?}"),
                })
            }
        }
        .map_err(|e| DeviceError::Rejected {
            device: device.name.clone(),
            reason: e.to_string(),
        })?;

        stream.play().map_err(|e| DeviceError::Start {
            device: device.name.clone(),
            reason: e.to_string(),
        })?;
        log::debug!(
            "audio: output stream started on `{}` ({} Hz, {} ch, {format:?})",
            device.name,
            spec.sample_rate,
            spec.channels
        );
        Ok(DeviceStream::new(Box::new(stream), stopped))
    }
}

// ---------------------------------------------------------------------------
// Stream builders
// ---------------------------------------------------------------------------

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut on_data: InputCallback,
    on_fault: FaultCallback,
    stopped: &Arc<AtomicBool>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let stopped = Arc::clone(stopped);
    let mut scratch: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if stopped.load(Ordering::Relaxed) {
                return;
            }
            scratch.clear();
            scratch.extend(data.iter().map(|&s| <f32 as FromSample<T>>::from_sample_(s)));
            if on_data(&scratch) == CallbackFlow::Stop {
                stopped.store(true, Ordering::Release);
            }
        },
        fault_handler(on_fault),
        None,
    )
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut on_data: OutputCallback,
    on_fault: FaultCallback,
    stopped: &Arc<AtomicBool>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let stopped = Arc::clone(stopped);
    let mut scratch: Vec<f32> = Vec::new();
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            // cpal cannot stop a stream from inside its callback: after a
            // stop the worker drops the stream and we emit silence until then.
            if stopped.load(Ordering::Relaxed) {
                for out in data.iter_mut() {
                    *out = T::from_sample_(0.0);
                }
                return;
            }
            scratch.clear();
            scratch.resize(data.len(), 0.0);
            let flow = on_data(&mut scratch);
            for (out, &s) in data.iter_mut().zip(scratch.iter()) {
                *out = T::from_sample_(s);
            }
            if flow == CallbackFlow::Stop {
                stopped.store(true, Ordering::Release);
            }
        },
        fault_handler(on_fault),
        None,
    )
}

/// Maps cpal stream errors onto [`StreamFault`]: a vanished device is fatal,
/// anything else is reported and the stream keeps running.
fn fault_handler(mut on_fault: FaultCallback) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err: cpal::StreamError| {
        let fatal = matches!(err, cpal::StreamError::DeviceNotAvailable);
        on_fault(StreamFault {
            fatal,
            message: err.to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn stream_config_uses_requested_format() {
        let config = CpalHost::stream_config(StreamSpec {
            sample_rate: 44_100,
            channels: 2,
        });
        assert_eq!(config.sample_rate.0, 44_100);
        assert_eq!(config.channels, 2);
    }

    #[test]
    fn device_disappearance_is_fatal() {
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&faults);
        let mut handler = fault_handler(Box::new(move |f| sink.lock().unwrap().push(f)));

        handler(cpal::StreamError::DeviceNotAvailable);
        handler(cpal::StreamError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "xrun".into(),
            },
        });

        let faults = faults.lock().unwrap();
        assert_eq!(faults.len(), 2);
        assert!(faults[0].fatal);
        assert!(!faults[1].fatal);
        assert!(faults[1].message.contains("xrun"));
    }

    #[test]
    fn unknown_host_is_reported() {
        match CpalHost::host_by_name("NoSuchHostApi") {
            Err(err) => assert!(matches!(err, DeviceError::Enumerate(_))),
            Ok(_) => panic!("unknown host name must not resolve"),
        }
    }
}
