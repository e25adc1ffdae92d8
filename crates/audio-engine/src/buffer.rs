//! Owned PCM buffer storage shaped by an [`AudioFormat`].
//!
//! One `Vec<u8>` per buffer (one for interleaved formats, one per channel
//! otherwise). Decoders, the ring buffer and render stages all work on these
//! bytes directly in the client format.

use crate::format::AudioFormat;

/// A set of equally sized byte buffers holding up to `capacity_frames` frames.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBufferList {
    buffers: Vec<Vec<u8>>,
    bytes_per_frame: usize,
    capacity_frames: usize,
}

impl AudioBufferList {
    pub fn new(buffer_count: usize, bytes_per_frame: usize, capacity_frames: usize) -> Self {
        Self {
            buffers: vec![vec![0u8; bytes_per_frame * capacity_frames]; buffer_count],
            bytes_per_frame,
            capacity_frames,
        }
    }

    pub fn for_format(format: &AudioFormat, capacity_frames: u32) -> Self {
        Self::new(
            format.buffer_count() as usize,
            format.bytes_per_frame() as usize,
            capacity_frames as usize,
        )
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    pub fn buffers(&self) -> &[Vec<u8>] {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.buffers
    }

    /// Borrowed views of every buffer, for the object-safe decoder interface.
    pub fn slices_mut(&mut self) -> Vec<&mut [u8]> {
        self.buffers.iter_mut().map(|b| b.as_mut_slice()).collect()
    }

    /// Zero the first `frames` frames of every buffer.
    pub fn silence(&mut self, frames: usize) {
        let len = (frames.min(self.capacity_frames)) * self.bytes_per_frame;
        for buf in &mut self.buffers {
            buf[..len].fill(0);
        }
    }

    /// Sample at `frame` for `channel`, converted to `f32`.
    pub fn sample(&self, format: &AudioFormat, frame: usize, channel: usize) -> f32 {
        let (buffer, offset) = locate(format, frame, channel);
        let bps = format.bytes_per_sample() as usize;
        read_sample(&self.buffers[buffer][offset..offset + bps], format)
    }

    pub fn set_sample(&mut self, format: &AudioFormat, frame: usize, channel: usize, value: f32) {
        let (buffer, offset) = locate(format, frame, channel);
        let bps = format.bytes_per_sample() as usize;
        write_sample(&mut self.buffers[buffer][offset..offset + bps], format, value);
    }
}

fn locate(format: &AudioFormat, frame: usize, channel: usize) -> (usize, usize) {
    let bpf = format.bytes_per_frame() as usize;
    if format.is_interleaved() {
        (0, frame * bpf + channel * format.bytes_per_sample() as usize)
    } else {
        (channel, frame * bpf)
    }
}

/// Decode one sample (`bytes.len() == bytes_per_sample`) to `f32` in `[-1, 1]`.
pub fn read_sample(bytes: &[u8], format: &AudioFormat) -> f32 {
    if format.is_float() {
        return match bytes.len() {
            8 => f64::from_ne_bytes(bytes.try_into().unwrap_or([0; 8])) as f32,
            _ => f32::from_ne_bytes(bytes.try_into().unwrap_or([0; 4])),
        };
    }
    match bytes.len() {
        1 => (bytes[0] as i8) as f32 / 128.0,
        2 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32_768.0,
        3 => {
            let v = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8;
            v as f32 / 8_388_608.0
        }
        4 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0,
        _ => 0.0,
    }
}

/// Encode `value` (clamped to `[-1, 1]` for integer formats) into one sample.
pub fn write_sample(bytes: &mut [u8], format: &AudioFormat, value: f32) {
    if format.is_float() {
        match bytes.len() {
            8 => bytes.copy_from_slice(&(value as f64).to_ne_bytes()),
            _ => bytes.copy_from_slice(&value.to_ne_bytes()),
        }
        return;
    }
    let v = value.clamp(-1.0, 1.0) as f64;
    match bytes.len() {
        1 => bytes[0] = ((v * 127.0).round() as i8) as u8,
        2 => bytes.copy_from_slice(&((v * 32_767.0).round() as i16).to_le_bytes()),
        3 => {
            let s = (v * 8_388_607.0).round() as i32;
            bytes.copy_from_slice(&s.to_le_bytes()[..3]);
        }
        4 => bytes.copy_from_slice(&((v * 2_147_483_647.0).round() as i32).to_le_bytes()),
        _ => {}
    }
}
