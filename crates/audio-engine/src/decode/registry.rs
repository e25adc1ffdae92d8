//! Catalog of decoder kinds and the decoder creation helpers.
//!
//! Resolution order for an input:
//! 1. With a MIME type, every kind is asked `handles_mime_type` in registration
//!    order and the first match wins.
//! 2. Only if no MIME type was given, none matched, or every match failed to
//!    open, the input's file extension is tried the same way.
//!
//! Helpers that take an input source or a decoder by value hand it back inside
//! [`Rejected`] on failure, closed again if the registry opened it. Helpers that
//! take a URL own what they create.

use std::io;

use tracing::{debug, warn};

use super::input::input_source_for_url;
use super::region::{Region, RegionDecoder};
use super::symphonia_decoder::SymphoniaKind;
use super::{Decoder, DecoderKind, InputSource};
use crate::error::{DecoderError, Rejected};

/// Explicit, ordered set of decoder kinds.
pub struct DecoderRegistry {
    kinds: Vec<Box<dyn DecoderKind>>,
    auto_open: bool,
}

pub struct DecoderRegistryBuilder {
    kinds: Vec<Box<dyn DecoderKind>>,
    auto_open: bool,
}

impl DecoderRegistryBuilder {
    /// Append a kind. Earlier registrations win shared extensions and MIME types.
    pub fn register(mut self, kind: impl DecoderKind + 'static) -> Self {
        self.kinds.push(Box::new(kind));
        self
    }

    /// Open decoders while creating them (default `true`).
    pub fn auto_open(mut self, enabled: bool) -> Self {
        self.auto_open = enabled;
        self
    }

    pub fn build(self) -> DecoderRegistry {
        DecoderRegistry {
            kinds: self.kinds,
            auto_open: self.auto_open,
        }
    }
}

impl Default for DecoderRegistry {
    /// The symphonia-backed kind, auto-opening.
    fn default() -> Self {
        Self::builder().register(SymphoniaKind::default()).build()
    }
}

enum Attempt {
    Built(Box<dyn Decoder>),
    /// Input handed back, with the last open error if a kind matched.
    Unmatched(Box<dyn InputSource>, Option<DecoderError>),
    /// The input can no longer be probed; no further kinds may be tried.
    Abandoned(Box<dyn InputSource>, DecoderError),
}

/// Put `input` back at its first byte so the next kind probes from the start.
fn rewind(input: &mut dyn InputSource) -> io::Result<()> {
    if input.supports_seeking() {
        input.seek_to_offset(0).map(|_| ())
    } else if input.offset() == 0 {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "input was read and cannot be rewound",
        ))
    }
}

impl DecoderRegistry {
    pub fn builder() -> DecoderRegistryBuilder {
        DecoderRegistryBuilder {
            kinds: Vec::new(),
            auto_open: true,
        }
    }

    pub fn auto_open(&self) -> bool {
        self.auto_open
    }

    pub fn kinds(&self) -> impl Iterator<Item = &dyn DecoderKind> {
        self.kinds.iter().map(|k| k.as_ref())
    }

    /// Every extension any kind handles, first occurrence order, no duplicates.
    pub fn supported_file_extensions(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = Vec::new();
        for ext in self.kinds.iter().flat_map(|k| k.supported_file_extensions()) {
            if !out.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
                out.push(*ext);
            }
        }
        out
    }

    pub fn supported_mime_types(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = Vec::new();
        for mime in self.kinds.iter().flat_map(|k| k.supported_mime_types()) {
            if !out.iter().any(|m| m.eq_ignore_ascii_case(mime)) {
                out.push(*mime);
            }
        }
        out
    }

    pub fn handles_file_extension(&self, extension: &str) -> bool {
        self.kinds.iter().any(|k| k.handles_file_extension(extension))
    }

    pub fn handles_mime_type(&self, mime_type: &str) -> bool {
        self.kinds.iter().any(|k| k.handles_mime_type(mime_type))
    }

    /// Build a decoder for `input`, preferring `mime_type` over the URL extension.
    ///
    /// On failure the input comes back in the open state it arrived in.
    pub fn create_decoder_for_input_source(
        &self,
        mut input: Box<dyn InputSource>,
        mime_type: Option<&str>,
    ) -> Result<Box<dyn Decoder>, Rejected<Box<dyn InputSource>>> {
        let opened_here = self.auto_open && !input.is_open();
        if opened_here {
            if let Err(source) = input.open() {
                let error = DecoderError::Input {
                    url: input.url().to_string(),
                    source,
                };
                return Err(Rejected::new(input, error));
            }
        }

        self.resolve(input, mime_type).map_err(|mut rejected| {
            if opened_here && rejected.resource.is_open() {
                if let Err(err) = rejected.resource.close() {
                    warn!(url = rejected.resource.url(), error = %err, "input did not close cleanly");
                }
            }
            rejected
        })
    }

    fn resolve(
        &self,
        mut input: Box<dyn InputSource>,
        mime_type: Option<&str>,
    ) -> Result<Box<dyn Decoder>, Rejected<Box<dyn InputSource>>> {
        let mut last_error = None;

        if let Some(mime) = mime_type {
            match self.try_kinds(input, |k| k.handles_mime_type(mime)) {
                Attempt::Built(decoder) => return Ok(decoder),
                Attempt::Unmatched(back, err) => {
                    input = back;
                    last_error = err;
                }
                Attempt::Abandoned(back, err) => return Err(Rejected::new(back, err)),
            }
        }

        let Some(extension) = input.file_extension().map(str::to_owned) else {
            let error = last_error.unwrap_or_else(|| DecoderError::UnknownFileType {
                url: input.url().to_string(),
            });
            return Err(Rejected::new(input, error));
        };

        match self.try_kinds(input, |k| k.handles_file_extension(&extension)) {
            Attempt::Built(decoder) => Ok(decoder),
            Attempt::Unmatched(input, err) => {
                let error = err.or(last_error).unwrap_or_else(|| {
                    DecoderError::NoDecoder(format!("extension '{extension}'"))
                });
                Err(Rejected::new(input, error))
            }
            Attempt::Abandoned(input, err) => Err(Rejected::new(input, err)),
        }
    }

    fn try_kinds(
        &self,
        mut input: Box<dyn InputSource>,
        matches: impl Fn(&dyn DecoderKind) -> bool,
    ) -> Attempt {
        let mut last_error = None;
        for kind in self.kinds.iter().filter(|k| matches(k.as_ref())) {
            let mut decoder = kind.create_decoder(input);
            if !self.auto_open {
                debug!(kind = kind.name(), url = decoder.url(), "decoder created");
                return Attempt::Built(decoder);
            }
            match decoder.open() {
                Ok(()) => {
                    debug!(kind = kind.name(), url = decoder.url(), "decoder opened");
                    return Attempt::Built(decoder);
                }
                Err(err) => {
                    warn!(kind = kind.name(), url = decoder.url(), error = %err, "decoder failed to open");
                    last_error = Some(err);
                    input = decoder.into_input();
                    // The failed decoder may have closed the input on its way out.
                    if !input.is_open() {
                        if let Err(source) = input.open() {
                            let url = input.url().to_string();
                            return Attempt::Abandoned(input, DecoderError::Input { url, source });
                        }
                    } else if let Err(source) = rewind(input.as_mut()) {
                        let url = input.url().to_string();
                        warn!(url = %url, error = %source, "input could not be rewound");
                        return Attempt::Abandoned(input, DecoderError::Input { url, source });
                    }
                }
            }
        }
        Attempt::Unmatched(input, last_error)
    }

    /// Build a decoder for a local path or `file://` URL.
    pub fn create_decoder_for_url(
        &self,
        url: &str,
        mime_type: Option<&str>,
    ) -> Result<Box<dyn Decoder>, DecoderError> {
        let input = input_source_for_url(url)?;
        self.create_decoder_for_input_source(input, mime_type)
            .map_err(|rejected| rejected.error)
    }

    /// Wrap an existing decoder in a region. Non-seekable decoders are handed back.
    pub fn create_decoder_for_decoder_region(
        &self,
        decoder: Box<dyn Decoder>,
        region: Region,
    ) -> Result<Box<dyn Decoder>, Rejected<Box<dyn Decoder>>> {
        let decoder = RegionDecoder::new(decoder, region)?;
        Ok(Box::new(decoder))
    }

    /// Build a region decoder over `input`. Non-seekable inputs are handed back.
    pub fn create_decoder_for_input_source_region(
        &self,
        input: Box<dyn InputSource>,
        region: Region,
        mime_type: Option<&str>,
    ) -> Result<Box<dyn Decoder>, Rejected<Box<dyn InputSource>>> {
        if !input.supports_seeking() {
            return Err(Rejected::new(input, DecoderError::SeekingUnsupported));
        }
        let was_open = input.is_open();
        let decoder = self.create_decoder_for_input_source(input, mime_type)?;
        self.create_decoder_for_decoder_region(decoder, region)
            .map_err(|rejected| {
                let (decoder, error) = rejected.into_parts();
                let mut input = decoder.into_input();
                if !was_open && input.is_open() {
                    if let Err(err) = input.close() {
                        warn!(url = input.url(), error = %err, "input did not close cleanly");
                    }
                }
                Rejected::new(input, error)
            })
    }

    pub fn create_decoder_for_url_region(
        &self,
        url: &str,
        region: Region,
        mime_type: Option<&str>,
    ) -> Result<Box<dyn Decoder>, DecoderError> {
        let input = input_source_for_url(url)?;
        self.create_decoder_for_input_source_region(input, region, mime_type)
            .map_err(|rejected| rejected.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::RepeatCount;
    use crate::decode::input::MemoryInputSource;
    use crate::decode::testing::PatternKind;

    fn input(url: &str) -> Box<dyn InputSource> {
        Box::new(MemoryInputSource::new(url, vec![0u8; 16]))
    }

    fn musepack_registry() -> DecoderRegistry {
        DecoderRegistry::builder()
            .register(PatternKind::new("by-extension").extensions(&["mpc"]))
            .register(
                PatternKind::new("by-mime")
                    .extensions(&[])
                    .mime_types(&["audio/musepack"])
                    .format(crate::format::AudioFormat::pcm(48_000.0, 1, 16, true).unwrap()),
            )
            .build()
    }

    #[test]
    fn mime_type_takes_precedence_over_extension() {
        let registry = musepack_registry();
        let decoder = registry
            .create_decoder_for_input_source(input("mem://song.mpc"), Some("audio/musepack"))
            .unwrap();
        assert!(decoder.is_open());
        assert_eq!(decoder.format().unwrap().sample_rate(), 48_000.0);
    }

    #[test]
    fn mime_type_resolves_inputs_without_extension() {
        let registry = musepack_registry();
        let decoder = registry
            .create_decoder_for_input_source(input("mem://stream"), Some("audio/musepack"))
            .unwrap();
        assert!(decoder.is_open());
        assert_eq!(decoder.format().unwrap().sample_rate(), 48_000.0);
        assert_eq!(decoder.format().unwrap().channels(), 1);
    }

    #[test]
    fn extension_is_used_without_mime_type() {
        let registry = musepack_registry();
        let decoder = registry
            .create_decoder_for_input_source(input("mem://song.MPC"), None)
            .unwrap();
        assert_eq!(decoder.format().unwrap().sample_rate(), 44_100.0);
    }

    #[test]
    fn unmatched_mime_type_falls_back_to_extension() {
        let registry = musepack_registry();
        let decoder = registry
            .create_decoder_for_input_source(input("mem://song.mpc"), Some("audio/x-unknown"))
            .unwrap();
        assert_eq!(decoder.format().unwrap().sample_rate(), 44_100.0);
    }

    #[test]
    fn failed_open_tries_next_matching_kind() {
        let registry = DecoderRegistry::builder()
            .register(PatternKind::new("broken").failing())
            .register(PatternKind::new("working").format(
                crate::format::AudioFormat::pcm(22_050.0, 1, 8, true).unwrap(),
            ))
            .build();
        let decoder = registry
            .create_decoder_for_input_source(input("mem://a.pat"), None)
            .unwrap();
        assert_eq!(decoder.format().unwrap().sample_rate(), 22_050.0);
    }

    #[test]
    fn all_kinds_failing_hands_input_back() {
        let registry = DecoderRegistry::builder()
            .register(PatternKind::new("broken").failing())
            .build();
        let rejected = registry
            .create_decoder_for_input_source(input("mem://a.pat"), None)
            .err().unwrap();
        assert!(matches!(rejected.error, DecoderError::Open { .. }));
        assert_eq!(rejected.resource.url(), "mem://a.pat");
        assert!(!rejected.resource.is_open());
    }

    #[test]
    fn caller_opened_input_stays_open_when_rejected() {
        let registry = DecoderRegistry::builder()
            .register(PatternKind::new("broken").failing())
            .build();
        let mut source = input("mem://a.pat");
        source.open().unwrap();
        let rejected = registry.create_decoder_for_input_source(source, None).err().unwrap();
        assert!(rejected.resource.is_open());
    }

    /// Seekable on paper, but every seek fails.
    struct NoRewind(MemoryInputSource);

    impl InputSource for NoRewind {
        fn url(&self) -> &str {
            self.0.url()
        }
        fn open(&mut self) -> io::Result<()> {
            self.0.open()
        }
        fn close(&mut self) -> io::Result<()> {
            self.0.close()
        }
        fn is_open(&self) -> bool {
            self.0.is_open()
        }
        fn supports_seeking(&self) -> bool {
            true
        }
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
        fn seek_to_offset(&mut self, _offset: u64) -> io::Result<u64> {
            Err(io::Error::other("device does not seek"))
        }
        fn offset(&self) -> u64 {
            self.0.offset()
        }
        fn length(&self) -> Option<u64> {
            self.0.length()
        }
    }

    #[test]
    fn failed_rewind_stops_trying_kinds() {
        let registry = DecoderRegistry::builder()
            .register(PatternKind::new("broken").failing())
            .register(PatternKind::new("working"))
            .build();
        let source = Box::new(NoRewind(MemoryInputSource::new("mem://a.pat", vec![0u8; 16])));
        let rejected = registry.create_decoder_for_input_source(source, None).err().unwrap();
        assert!(matches!(rejected.error, DecoderError::Input { .. }));
        assert_eq!(rejected.resource.url(), "mem://a.pat");
    }

    #[test]
    fn unknown_extension_is_unknown_file_type() {
        let registry = musepack_registry();
        let rejected = registry
            .create_decoder_for_input_source(input("mem://noextension"), None)
            .err().unwrap();
        assert!(matches!(rejected.error, DecoderError::UnknownFileType { .. }));

        let rejected = registry
            .create_decoder_for_input_source(input("mem://a.xyz"), None)
            .err().unwrap();
        assert!(matches!(rejected.error, DecoderError::NoDecoder(_)));
    }

    #[test]
    fn auto_open_disabled_returns_closed_decoder() {
        let registry = DecoderRegistry::builder()
            .register(PatternKind::new("pattern"))
            .auto_open(false)
            .build();
        let decoder = registry
            .create_decoder_for_input_source(input("mem://a.pat"), None)
            .unwrap();
        assert!(!decoder.is_open());
        assert!(!decoder.input().is_open());
    }

    #[test]
    fn first_registration_wins_shared_extensions() {
        let registry = DecoderRegistry::builder()
            .register(PatternKind::new("first"))
            .register(PatternKind::new("second").format(
                crate::format::AudioFormat::pcm(8_000.0, 1, 16, true).unwrap(),
            ))
            .build();
        let decoder = registry
            .create_decoder_for_input_source(input("mem://a.pat"), None)
            .unwrap();
        assert_eq!(decoder.format().unwrap().sample_rate(), 44_100.0);
        assert_eq!(registry.supported_file_extensions(), vec!["pat"]);
    }

    #[test]
    fn aggregate_queries_cover_all_kinds() {
        let registry = musepack_registry();
        assert_eq!(registry.supported_file_extensions(), vec!["mpc"]);
        assert_eq!(registry.supported_mime_types(), vec!["audio/musepack"]);
        assert!(registry.handles_file_extension("MPC"));
        assert!(registry.handles_mime_type("audio/musepack"));
        assert!(!registry.handles_mime_type("audio/flac"));
    }

    #[test]
    fn non_seekable_decoder_region_is_rejected_not_wrapped() {
        let registry = DecoderRegistry::builder()
            .register(PatternKind::new("stream").non_seekable())
            .build();
        let decoder = registry
            .create_decoder_for_input_source(input("mem://a.pat"), None)
            .unwrap();
        let rejected = registry
            .create_decoder_for_decoder_region(decoder, Region::new(0, 10))
            .err().unwrap();
        assert!(matches!(rejected.error, DecoderError::SeekingUnsupported));
        let decoder = rejected.resource;
        assert!(decoder.is_open());
        assert_eq!(decoder.current_frame(), 0);
    }

    #[test]
    fn input_region_rejects_non_seekable_input() {
        let registry = musepack_registry();
        let stream = Box::new(MemoryInputSource::new("mem://a.mpc", vec![0u8; 4]).non_seekable());
        let rejected = registry
            .create_decoder_for_input_source_region(stream, Region::new(0, 10), None)
            .err().unwrap();
        assert!(matches!(rejected.error, DecoderError::SeekingUnsupported));
        assert!(!rejected.resource.is_open());
    }

    #[test]
    fn input_region_closes_input_when_decoder_cannot_seek() {
        let registry = DecoderRegistry::builder()
            .register(PatternKind::new("stream").non_seekable())
            .build();
        let rejected = registry
            .create_decoder_for_input_source_region(input("mem://a.pat"), Region::new(0, 10), None)
            .err().unwrap();
        assert!(matches!(rejected.error, DecoderError::SeekingUnsupported));
        assert!(!rejected.resource.is_open());
    }

    #[test]
    fn input_region_builds_looping_decoder() {
        let registry = musepack_registry();
        let mut decoder = registry
            .create_decoder_for_input_source_region(
                input("mem://a.mpc"),
                Region::new(0, 8).repeating(RepeatCount::Times(1)),
                None,
            )
            .unwrap();
        assert_eq!(decoder.total_frames(), Some(16));
        let mut buf = vec![0u8; 32 * 4];
        assert_eq!(decoder.read_audio(&mut [&mut buf[..]], 32).unwrap(), 16);
    }

    #[test]
    fn url_helpers_reject_missing_files() {
        let registry = DecoderRegistry::default();
        assert!(matches!(
            registry.create_decoder_for_url("/no/such/file.flac", None),
            Err(DecoderError::Input { .. })
        ));
        assert!(registry
            .create_decoder_for_url_region("http://host/a.flac", Region::new(0, 1), None)
            .is_err());
    }
}
