//! Sub-range and looping playback over a seekable decoder.

use tracing::debug;

use super::{Decoder, InputSource};
use crate::error::{DecoderError, Rejected};
use crate::format::{AudioFormat, ChannelLayout};

/// How many extra passes a region plays after the first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepeatCount {
    Times(u32),
    Forever,
}

impl Default for RepeatCount {
    fn default() -> Self {
        RepeatCount::Times(0)
    }
}

/// A frame range of a stream. `frame_count: None` runs to the end of the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Region {
    pub start_frame: u64,
    pub frame_count: Option<u64>,
    pub repeat: RepeatCount,
}

impl Region {
    pub fn starting_at(start_frame: u64) -> Self {
        Self {
            start_frame,
            ..Self::default()
        }
    }

    pub fn new(start_frame: u64, frame_count: u64) -> Self {
        Self {
            start_frame,
            frame_count: Some(frame_count),
            repeat: RepeatCount::Times(0),
        }
    }

    pub fn repeating(mut self, repeat: RepeatCount) -> Self {
        self.repeat = repeat;
        self
    }
}

/// Decorator that plays `region` of an inner decoder, looping as requested.
///
/// Frame positions reported by this decoder are relative to the region and count
/// across passes.
pub struct RegionDecoder {
    inner: Box<dyn Decoder>,
    region: Region,
    /// Frames in one pass, once known.
    pass_len: Option<u64>,
    completed_passes: u32,
    pass_frame: u64,
    open: bool,
    /// A previous `open` failed; the decoder stays unusable.
    failed: bool,
}

impl std::fmt::Debug for RegionDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionDecoder")
            .field("url", &self.inner.url())
            .field("region", &self.region)
            .field("completed_passes", &self.completed_passes)
            .field("pass_frame", &self.pass_frame)
            .finish()
    }
}

impl RegionDecoder {
    /// Wrap `inner`. Fails, handing `inner` back, if it cannot seek or if the
    /// region does not fit an already-open stream.
    pub fn new(
        inner: Box<dyn Decoder>,
        region: Region,
    ) -> Result<Self, Rejected<Box<dyn Decoder>>> {
        if !inner.supports_seeking() {
            return Err(Rejected::new(inner, DecoderError::SeekingUnsupported));
        }
        let mut decoder = Self {
            inner,
            region,
            pass_len: None,
            completed_passes: 0,
            pass_frame: 0,
            open: false,
            failed: false,
        };
        if decoder.inner.is_open() {
            if let Err(err) = decoder.setup() {
                return Err(Rejected::new(decoder.inner, err));
            }
        }
        Ok(decoder)
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn inner(&self) -> &dyn Decoder {
        self.inner.as_ref()
    }

    /// Unwrap, returning the inner decoder at whatever position it reached.
    pub fn into_inner(self) -> Box<dyn Decoder> {
        self.inner
    }

    /// Passes fully played so far.
    pub fn completed_passes(&self) -> u32 {
        self.completed_passes
    }

    fn setup(&mut self) -> Result<(), DecoderError> {
        let Region {
            start_frame,
            frame_count,
            ..
        } = self.region;

        if frame_count == Some(0) {
            return Err(DecoderError::InvalidRegion("region is empty".into()));
        }
        self.pass_len = match (self.inner.total_frames(), frame_count) {
            (Some(total), Some(count)) => {
                if start_frame.checked_add(count).is_none_or(|end| end > total) {
                    return Err(DecoderError::InvalidRegion(format!(
                        "frames {start_frame}+{count} exceed stream length {total}"
                    )));
                }
                Some(count)
            }
            (Some(total), None) => {
                if start_frame >= total {
                    return Err(DecoderError::InvalidRegion(format!(
                        "start frame {start_frame} is past stream length {total}"
                    )));
                }
                Some(total - start_frame)
            }
            (None, count) => count,
        };

        self.inner.seek_to_frame(start_frame)?;
        self.completed_passes = 0;
        self.pass_frame = 0;
        self.open = true;
        Ok(())
    }

    fn passes_remaining(&self) -> bool {
        match self.region.repeat {
            RepeatCount::Forever => true,
            RepeatCount::Times(n) => self.completed_passes < n,
        }
    }

    /// Seek back to the region start for another pass, if one is allowed.
    fn next_pass(&mut self) -> Result<bool, DecoderError> {
        if self.pass_len.is_none() {
            // First pass ran to end of stream; its length is now known.
            self.pass_len = Some(self.pass_frame);
        }
        if !self.passes_remaining() {
            return Ok(false);
        }
        self.inner.seek_to_frame(self.region.start_frame)?;
        self.completed_passes += 1;
        self.pass_frame = 0;
        debug!(
            url = self.inner.url(),
            pass = self.completed_passes,
            "region restarted"
        );
        Ok(true)
    }
}

impl Decoder for RegionDecoder {
    fn input(&self) -> &dyn InputSource {
        self.inner.input()
    }

    fn open(&mut self) -> Result<(), DecoderError> {
        if self.failed {
            return Err(DecoderError::Unusable);
        }
        if self.open {
            return Err(DecoderError::AlreadyOpen);
        }
        let result = if self.inner.is_open() {
            self.setup()
        } else {
            self.inner.open().and_then(|()| self.setup())
        };
        self.failed = result.is_err();
        result
    }

    fn close(&mut self) -> Result<(), DecoderError> {
        self.open = false;
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        self.open && self.inner.is_open()
    }

    fn source_format(&self) -> Option<AudioFormat> {
        self.inner.source_format()
    }

    fn format(&self) -> Option<AudioFormat> {
        self.inner.format()
    }

    fn channel_layout(&self) -> Option<ChannelLayout> {
        self.inner.channel_layout()
    }

    fn total_frames(&self) -> Option<u64> {
        match self.region.repeat {
            RepeatCount::Forever => None,
            RepeatCount::Times(n) => self.pass_len.map(|len| len * (n as u64 + 1)),
        }
    }

    fn current_frame(&self) -> u64 {
        let len = self.pass_len.unwrap_or(0);
        len * self.completed_passes as u64 + self.pass_frame
    }

    fn supports_seeking(&self) -> bool {
        self.inner.supports_seeking()
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<u64, DecoderError> {
        if !self.is_open() {
            return Err(DecoderError::NotOpen);
        }
        let Some(len) = self.pass_len.filter(|len| *len > 0) else {
            return Err(DecoderError::Seek {
                frame,
                reason: "region length is not known yet".into(),
            });
        };
        if let Some(total) = self.total_frames() {
            if frame >= total {
                return Err(DecoderError::Seek {
                    frame,
                    reason: format!("region holds {total} frames"),
                });
            }
        }
        let pass = frame / len;
        let offset = frame % len;
        let pass = u32::try_from(pass).map_err(|_| DecoderError::Seek {
            frame,
            reason: "too many passes".into(),
        })?;
        self.inner.seek_to_frame(self.region.start_frame + offset)?;
        self.completed_passes = pass;
        self.pass_frame = offset;
        Ok(frame)
    }

    fn read_audio(&mut self, buffers: &mut [&mut [u8]], frames: u32) -> Result<u32, DecoderError> {
        if !self.is_open() {
            return Err(DecoderError::NotOpen);
        }
        let format = self.inner.format().ok_or(DecoderError::NotOpen)?;
        super::check_buffers(&format, buffers, frames)?;
        let bytes_per_frame = format.bytes_per_frame() as usize;

        let mut done = 0u32;
        while done < frames {
            let left_in_pass = self
                .pass_len
                .map_or(u64::MAX, |len| len.saturating_sub(self.pass_frame));
            if left_in_pass == 0 {
                if self.next_pass()? {
                    continue;
                }
                break;
            }

            let want = ((frames - done) as u64).min(left_in_pass) as u32;
            let offset = done as usize * bytes_per_frame;
            let mut views: Vec<&mut [u8]> = buffers.iter_mut().map(|b| &mut b[offset..]).collect();
            let n = self.inner.read_audio(&mut views, want)?;

            if n == 0 {
                // An empty pass can never make progress.
                if self.pass_frame == 0 || !self.next_pass()? {
                    break;
                }
                continue;
            }
            done += n;
            self.pass_frame += n as u64;
        }
        Ok(done)
    }

    fn into_input(self: Box<Self>) -> Box<dyn InputSource> {
        self.inner.into_input()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::{PatternKind, pattern_byte};

    fn open_pattern(frames: u64) -> Box<dyn Decoder> {
        let mut decoder = PatternKind::new("pattern").frames(frames).build("mem://a.pat");
        decoder.open().unwrap();
        decoder
    }

    fn read_all(decoder: &mut dyn Decoder, chunk: u32) -> Vec<u8> {
        let bpf = decoder.format().unwrap().bytes_per_frame() as usize;
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk as usize * bpf];
        loop {
            let n = decoder.read_audio(&mut [&mut buf[..]], chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize * bpf]);
        }
        out
    }

    fn expected(start: u64, len: u64, bpf: usize) -> Vec<u8> {
        (start..start + len)
            .flat_map(|f| (0..bpf).map(move |b| pattern_byte(f, 0, b)))
            .collect()
    }

    #[test]
    fn repeat_produces_identical_passes() {
        let mut region = RegionDecoder::new(
            open_pattern(1000),
            Region::new(100, 50).repeating(RepeatCount::Times(2)),
        )
        .unwrap();
        assert_eq!(region.total_frames(), Some(150));

        let bytes = read_all(&mut region, 64);
        let one_pass = expected(100, 50, 4);
        assert_eq!(bytes.len(), 3 * one_pass.len());
        for pass in bytes.chunks(one_pass.len()) {
            assert_eq!(pass, &one_pass[..]);
        }
        assert_eq!(region.completed_passes(), 2);
    }

    #[test]
    fn reads_fill_across_pass_boundaries() {
        let mut region = RegionDecoder::new(
            open_pattern(100),
            Region::new(10, 3).repeating(RepeatCount::Times(3)),
        )
        .unwrap();
        let mut buf = vec![0u8; 10 * 4];
        assert_eq!(region.read_audio(&mut [&mut buf[..]], 10).unwrap(), 10);
        assert_eq!(region.read_audio(&mut [&mut buf[..]], 10).unwrap(), 2);
        assert_eq!(region.read_audio(&mut [&mut buf[..]], 10).unwrap(), 0);
    }

    #[test]
    fn open_ended_region_runs_to_end_of_stream() {
        let mut region = RegionDecoder::new(open_pattern(40), Region::starting_at(30)).unwrap();
        assert_eq!(read_all(&mut region, 7), expected(30, 10, 4));
    }

    #[test]
    fn forever_keeps_delivering_full_reads() {
        let mut region = RegionDecoder::new(
            open_pattern(20),
            Region::new(0, 5).repeating(RepeatCount::Forever),
        )
        .unwrap();
        let mut buf = vec![0u8; 64 * 4];
        for _ in 0..10 {
            assert_eq!(region.read_audio(&mut [&mut buf[..]], 64).unwrap(), 64);
        }
        assert_eq!(region.total_frames(), None);
    }

    #[test]
    fn non_seekable_decoder_is_handed_back() {
        let mut inner = PatternKind::new("stream").non_seekable().build("mem://a.pat");
        inner.open().unwrap();
        let rejected = RegionDecoder::new(inner, Region::new(0, 10)).unwrap_err();
        assert!(matches!(rejected.error, DecoderError::SeekingUnsupported));
        assert!(rejected.resource.is_open());
        assert_eq!(rejected.resource.url(), "mem://a.pat");
    }

    #[test]
    fn region_past_end_is_rejected() {
        let rejected = RegionDecoder::new(open_pattern(100), Region::new(90, 20)).unwrap_err();
        assert!(matches!(rejected.error, DecoderError::InvalidRegion(_)));
    }

    #[test]
    fn closed_inner_is_validated_on_open() {
        let inner = PatternKind::new("pattern").frames(100).build("mem://a.pat");
        let mut region = RegionDecoder::new(inner, Region::new(10, 10)).unwrap();
        assert!(!region.is_open());
        region.open().unwrap();
        assert!(matches!(region.open(), Err(DecoderError::AlreadyOpen)));
        assert_eq!(read_all(&mut region, 4), expected(10, 10, 4));
    }

    #[test]
    fn failed_open_leaves_region_unusable() {
        let inner = PatternKind::new("pattern").frames(100).build("mem://a.pat");
        let mut region = RegionDecoder::new(inner, Region::new(90, 20)).unwrap();
        assert!(matches!(region.open(), Err(DecoderError::InvalidRegion(_))));
        assert!(!region.is_open());
        assert!(matches!(region.open(), Err(DecoderError::Unusable)));
        assert!(matches!(region.open(), Err(DecoderError::Unusable)));
        let mut buf = vec![0u8; 16];
        assert!(region.read_audio(&mut [&mut buf[..]], 4).is_err());
    }

    #[test]
    fn seek_maps_into_later_passes() {
        let mut region = RegionDecoder::new(
            open_pattern(100),
            Region::new(20, 10).repeating(RepeatCount::Times(1)),
        )
        .unwrap();
        assert_eq!(region.seek_to_frame(13).unwrap(), 13);
        assert_eq!(region.current_frame(), 13);
        assert_eq!(read_all(&mut region, 4), expected(23, 7, 4));
        assert!(region.seek_to_frame(20).is_err());
    }
}
