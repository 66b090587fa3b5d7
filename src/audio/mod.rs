//! Audio subsystem module

pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod source;

pub use buffer::{create_shared_buffer, AudioFrame, RingBuffer, SharedRingBuffer};
pub use device::{default_input_device, list_input_devices, AudioDeviceInfo};
pub use pipeline::AudioCapturePipeline;
pub use source::{CpalSource, SampleSource};
