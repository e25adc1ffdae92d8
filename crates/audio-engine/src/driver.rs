//! Decode driver: the producer side of playback.
//!
//! Pulls frames from a [`Decoder`] in chunks and stores them at consecutive
//! absolute positions in a [`FrameSink`] (the player's ring buffer). The driver
//! never runs ahead of the reader by more than the sink allows, so a healthy
//! stream never overruns.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use crate::buffer::AudioBufferList;
use crate::decode::Decoder;
use crate::error::{DecoderError, PlayerError, RingBufferError};
use crate::format::AudioFormat;

/// How long the driver sleeps when the sink is full.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Destination for decoded frames.
pub trait FrameSink: Send + Sync {
    /// Frames that can be stored at `position` without passing the reader.
    fn writable_frames(&self, position: u64) -> u64;

    fn store(&self, data: &AudioBufferList, frames: u32, position: u64) -> Result<(), RingBufferError>;

    /// The decoder reached end of stream after `position` frames.
    fn finish(&self, position: u64);

    /// The decoder failed after `position` frames. Nothing more will be stored.
    fn fail(&self, position: u64);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpStatus {
    Stored(u32),
    /// The sink had no room; nothing was decoded.
    Full,
    EndOfStream,
}

/// How a driver thread ended.
#[derive(Debug)]
pub enum DriverOutcome {
    Finished { frames: u64 },
    Stopped { frames: u64 },
    Failed(PlayerError),
}

pub struct DecodeDriver {
    decoder: Box<dyn Decoder>,
    sink: Arc<dyn FrameSink>,
    scratch: AudioBufferList,
    chunk_frames: u32,
    position: u64,
}

impl DecodeDriver {
    /// `decoder` must be open.
    pub fn new(
        decoder: Box<dyn Decoder>,
        sink: Arc<dyn FrameSink>,
        chunk_frames: u32,
    ) -> Result<Self, PlayerError> {
        let format: AudioFormat = decoder.format().ok_or(DecoderError::NotOpen)?;
        let chunk_frames = chunk_frames.max(1);
        Ok(Self {
            decoder,
            sink,
            scratch: AudioBufferList::for_format(&format, chunk_frames),
            chunk_frames,
            position: 0,
        })
    }

    /// Frames stored so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn decoder(&self) -> &dyn Decoder {
        self.decoder.as_ref()
    }

    /// Decode and store at most one chunk.
    pub fn pump(&mut self) -> Result<PumpStatus, PlayerError> {
        let writable = self.sink.writable_frames(self.position);
        let frames = writable.min(self.chunk_frames as u64) as u32;
        if frames == 0 {
            return Ok(PumpStatus::Full);
        }

        let read = {
            let mut slices = self.scratch.slices_mut();
            self.decoder.read_audio(&mut slices, frames)?
        };
        if read == 0 {
            self.sink.finish(self.position);
            return Ok(PumpStatus::EndOfStream);
        }

        match self.sink.store(&self.scratch, read, self.position) {
            Ok(()) => {}
            Err(RingBufferError::Overrun { lost }) => {
                warn!(lost, position = self.position, "decode overran the reader");
            }
            Err(err) => return Err(err.into()),
        }
        self.position += read as u64;
        Ok(PumpStatus::Stored(read))
    }

    /// Pump until end of stream, failure, or a stop request.
    fn run(mut self, stop: Receiver<()>) -> DriverOutcome {
        loop {
            match stop.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => {
                    return DriverOutcome::Stopped {
                        frames: self.position,
                    };
                }
                Err(TryRecvError::Empty) => {}
            }

            match self.pump() {
                Ok(PumpStatus::Stored(_)) => {}
                Ok(PumpStatus::Full) => match stop.recv_timeout(IDLE_WAIT) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        return DriverOutcome::Stopped {
                            frames: self.position,
                        };
                    }
                },
                Ok(PumpStatus::EndOfStream) => {
                    info!(url = %self.decoder.url(), frames = self.position, "decode finished");
                    return DriverOutcome::Finished {
                        frames: self.position,
                    };
                }
                Err(err) => {
                    error!(url = %self.decoder.url(), error = %err, "decode failed");
                    self.sink.fail(self.position);
                    return DriverOutcome::Failed(err);
                }
            }
        }
    }

    /// Move the driver onto its own thread.
    pub fn spawn(self) -> Result<DriverHandle, PlayerError> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        debug!(url = %self.decoder.url(), chunk_frames = self.chunk_frames, "starting decode thread");
        let thread = thread::Builder::new()
            .name("decode".into())
            .spawn(move || self.run(stop_rx))
            .map_err(PlayerError::DriverSpawn)?;
        Ok(DriverHandle {
            stop_tx,
            thread: Some(thread),
        })
    }
}

/// Owner of a running decode thread. Dropping it stops and joins the thread.
pub struct DriverHandle {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<DriverOutcome>>,
}

impl DriverHandle {
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Ask the thread to stop and wait for it.
    pub fn stop(mut self) -> Result<DriverOutcome, PlayerError> {
        self.join()
    }

    fn join(&mut self) -> Result<DriverOutcome, PlayerError> {
        let _ = self.stop_tx.try_send(());
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| PlayerError::DriverPanicked),
            None => Ok(DriverOutcome::Stopped { frames: 0 }),
        }
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        if let Err(err) = self.join() {
            warn!(error = %err, "decode thread ended abnormally");
        }
    }
}
