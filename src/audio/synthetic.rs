//! In-process [`AudioHost`] used by the pipeline tests.
//!
//! Input streams run a generator thread that delivers a deterministic ramp
//! in fixed-size chunks; output streams run a thread that keeps pulling
//! buffers from the callback and records everything "played".  No hardware
//! is touched.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::host::{
    AudioHost, CallbackFlow, DeviceDescriptor, DeviceError, DeviceStream, Direction,
    FaultCallback, InputCallback, OutputCallback, StreamFault, StreamSpec,
};

pub const INPUT_NAME: &str = "synthetic-in";
pub const OUTPUT_NAME: &str = "synthetic-out";

/// Value of frame `n` of the generated signal: a ramp that wraps every 100
/// frames, so continuity across segment files can be checked.
pub fn sample_at(frame: u64) -> f32 {
    (frame % 100) as f32 / 100.0
}

#[derive(Default)]
struct Shared {
    inputs_opened: AtomicUsize,
    outputs_opened: AtomicUsize,
    input_done: AtomicBool,
    played: Mutex<Vec<f32>>,
}

pub struct SyntheticHost {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames delivered by an input stream before it goes quiet.
    pub input_frames: u64,
    /// Frames per simulated driver callback.
    pub chunk_frames: usize,
    /// Sleep between callbacks; zero runs flat out.
    pub pace: Duration,
    /// Report a fatal fault once this many input frames were delivered.
    pub fail_input_after: Option<u64>,
    shared: Arc<Shared>,
}

impl SyntheticHost {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            input_frames: 0,
            chunk_frames: 256,
            pace: Duration::ZERO,
            fail_input_after: None,
            shared: Arc::new(Shared::default()),
        }
    }

    /// `true` once an input stream has delivered all of its frames.
    pub fn input_done(&self) -> bool {
        self.shared.input_done.load(Ordering::Acquire)
    }

    pub fn inputs_opened(&self) -> usize {
        self.shared.inputs_opened.load(Ordering::SeqCst)
    }

    pub fn outputs_opened(&self) -> usize {
        self.shared.outputs_opened.load(Ordering::SeqCst)
    }

    /// Every sample written by output callbacks so far.
    pub fn played(&self) -> Vec<f32> {
        self.shared.played.lock().unwrap().clone()
    }

    /// Cheap handle onto the same device state, for watcher threads.
    pub fn probe(&self) -> SyntheticProbe {
        SyntheticProbe {
            shared: Arc::clone(&self.shared),
        }
    }

    fn descriptor(&self, direction: Direction) -> DeviceDescriptor {
        DeviceDescriptor {
            index: 0,
            name: match direction {
                Direction::Input => INPUT_NAME.to_owned(),
                Direction::Output => OUTPUT_NAME.to_owned(),
            },
            host: "Synthetic".to_owned(),
            direction,
            default_sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }
}

/// Shares a [`SyntheticHost`]'s state with another thread.
#[derive(Clone)]
pub struct SyntheticProbe {
    shared: Arc<Shared>,
}

impl SyntheticProbe {
    pub fn input_done(&self) -> bool {
        self.shared.input_done.load(Ordering::Acquire)
    }

    /// Block until the input generator finished.
    pub fn wait_input_done(&self) {
        while !self.input_done() {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Stops and joins the driver thread.
struct Driver {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl AudioHost for SyntheticHost {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        Ok(vec![
            self.descriptor(Direction::Input),
            self.descriptor(Direction::Output),
        ])
    }

    fn resolve(
        &self,
        direction: Direction,
        name: Option<&str>,
    ) -> Result<DeviceDescriptor, DeviceError> {
        let device = self.descriptor(direction);
        match name {
            Some(name) if name != device.name => Err(DeviceError::NotFound {
                direction,
                name: name.to_owned(),
            }),
            _ => Ok(device),
        }
    }

    fn open_input(
        &self,
        _device: &DeviceDescriptor,
        spec: StreamSpec,
        mut on_data: InputCallback,
        mut on_fault: FaultCallback,
    ) -> Result<DeviceStream, DeviceError> {
        self.shared.inputs_opened.fetch_add(1, Ordering::SeqCst);
        self.shared.input_done.store(false, Ordering::Release);

        let stop = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let total = self.input_frames;
        let chunk = self.chunk_frames.max(1) as u64;
        let channels = spec.channels.max(1) as usize;
        let pace = self.pace;
        let fail_after = self.fail_input_after;
        let shared = Arc::clone(&self.shared);

        let thread = {
            let stop = Arc::clone(&stop);
            let stopped = Arc::clone(&stopped);
            thread::spawn(move || {
                let mut frame = 0u64;
                let mut buf = Vec::with_capacity(chunk as usize * channels);
                while !stop.load(Ordering::Acquire) && frame < total {
                    let n = chunk.min(total - frame);
                    buf.clear();
                    for f in frame..frame + n {
                        buf.extend(std::iter::repeat(sample_at(f)).take(channels));
                    }
                    frame += n;
                    if on_data(&buf) == CallbackFlow::Stop {
                        stopped.store(true, Ordering::Release);
                        break;
                    }
                    if fail_after.is_some_and(|at| frame >= at) {
                        on_fault(StreamFault {
                            fatal: true,
                            message: "device unplugged".into(),
                        });
                        break;
                    }
                    if !pace.is_zero() {
                        thread::sleep(pace);
                    }
                }
                shared.input_done.store(true, Ordering::Release);
            })
        };

        Ok(DeviceStream::new(
            Box::new(Driver {
                stop,
                thread: Some(thread),
            }),
            stopped,
        ))
    }

    fn open_output(
        &self,
        _device: &DeviceDescriptor,
        spec: StreamSpec,
        mut on_data: OutputCallback,
        _on_fault: FaultCallback,
    ) -> Result<DeviceStream, DeviceError> {
        self.shared.outputs_opened.fetch_add(1, Ordering::SeqCst);

        let stop = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let len = self.chunk_frames.max(1) * spec.channels.max(1) as usize;
        let pace = self.pace;
        let shared = Arc::clone(&self.shared);

        let thread = {
            let stop = Arc::clone(&stop);
            let stopped = Arc::clone(&stopped);
            thread::spawn(move || {
                // NaN marks samples the callback failed to write.
                let mut buf = vec![f32::NAN; len];
                while !stop.load(Ordering::Acquire) {
                    buf.fill(f32::NAN);
                    let flow = on_data(&mut buf);
                    shared.played.lock().unwrap().extend_from_slice(&buf);
                    if flow == CallbackFlow::Stop {
                        stopped.store(true, Ordering::Release);
                        break;
                    }
                    if !pace.is_zero() {
                        thread::sleep(pace);
                    }
                }
            })
        };

        Ok(DeviceStream::new(
            Box::new(Driver {
                stop,
                thread: Some(thread),
            }),
            stopped,
        ))
    }
}
