extern crate ffmpeg_next;

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// A fixed-length window of mono audio, analyzed as one unit by a classifier.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioSegment {
    /// Start time of the window, in seconds from the start of the stream.
    pub start: f64,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

/// A source of audio segments, scanned once in chronological order.
pub trait SegmentSource: Send {
    /// Calls `on_segment` with each segment in order. The first error returned by
    /// `on_segment` stops the scan and is returned.
    fn scan(&mut self, on_segment: &mut dyn FnMut(AudioSegment) -> Result<()>) -> Result<()>;
}

impl SegmentSource for Vec<AudioSegment> {
    fn scan(&mut self, on_segment: &mut dyn FnMut(AudioSegment) -> Result<()>) -> Result<()> {
        for segment in self.drain(..) {
            on_segment(segment)?;
        }
        Ok(())
    }
}

/// Slices a continuous sample stream into overlapping fixed-length windows.
#[derive(Debug)]
pub(crate) struct Segmenter {
    sample_rate: u32,
    window_len: usize,
    hop_len: usize,
    buf: Vec<f32>,
    // Absolute index of `buf[0]` in the stream.
    offset: u64,
    // Absolute index one past the last sample covered by an emitted window.
    covered: u64,
}

impl Segmenter {
    pub(crate) fn new(sample_rate: u32, window: f64, overlap: f64) -> Result<Self> {
        if sample_rate == 0 || !(window > 0.0) || !(0.0..1.0).contains(&overlap) {
            return Err(Error::InvalidConfig(format!(
                "invalid segmentation: sample_rate={} window={} overlap={}",
                sample_rate, window, overlap
            )));
        }
        let window_len = ((window * sample_rate as f64).round() as usize).max(1);
        let hop_len = ((window_len as f64 * (1.0 - overlap)).round() as usize).clamp(1, window_len);
        Ok(Self {
            sample_rate,
            window_len,
            hop_len,
            buf: Vec::with_capacity(window_len * 2),
            offset: 0,
            covered: 0,
        })
    }

    fn start_time(&self) -> f64 {
        self.offset as f64 / self.sample_rate as f64
    }

    pub(crate) fn push(
        &mut self,
        samples: &[f32],
        on_segment: &mut dyn FnMut(AudioSegment) -> Result<()>,
    ) -> Result<()> {
        self.buf.extend_from_slice(samples);
        while self.buf.len() >= self.window_len {
            let segment = AudioSegment {
                start: self.start_time(),
                sample_rate: self.sample_rate,
                samples: self.buf[..self.window_len].to_vec(),
            };
            self.covered = self.offset + self.window_len as u64;
            self.buf.drain(..self.hop_len);
            self.offset += self.hop_len as u64;
            on_segment(segment)?;
        }
        Ok(())
    }

    /// Emits a final zero-padded window if some trailing samples were never covered.
    pub(crate) fn finish(
        mut self,
        on_segment: &mut dyn FnMut(AudioSegment) -> Result<()>,
    ) -> Result<()> {
        let end = self.offset + self.buf.len() as u64;
        if self.buf.is_empty() || end <= self.covered {
            return Ok(());
        }
        self.buf.resize(self.window_len, 0.0);
        let segment = AudioSegment {
            start: self.start_time(),
            sample_rate: self.sample_rate,
            samples: std::mem::take(&mut self.buf),
        };
        on_segment(segment)
    }
}

/// Thin wrapper around the native `FFmpeg` audio decoder.
struct Decoder {
    decoder: ffmpeg_next::codec::decoder::Audio,
}

impl Decoder {
    fn build_threading_config() -> ffmpeg_next::codec::threading::Config {
        let mut config = ffmpeg_next::codec::threading::Config::default();
        config.count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        config.kind = ffmpeg_next::codec::threading::Type::Frame;
        config
    }

    fn from_parameters(parameters: ffmpeg_next::codec::Parameters, threaded: bool) -> Result<Self> {
        let ctx = ffmpeg_next::codec::context::Context::from_parameters(parameters)?;
        let mut decoder = ctx.decoder();

        if threaded {
            decoder.set_threading(Self::build_threading_config());
        }

        let decoder = decoder.audio()?;

        Ok(Self { decoder })
    }

    fn send_packet(&mut self, packet: &ffmpeg_next::packet::Packet) -> Result<()> {
        Ok(self.decoder.send_packet(packet)?)
    }

    fn send_eof(&mut self) -> Result<()> {
        Ok(self.decoder.send_eof()?)
    }

    fn receive_frame(&mut self, frame: &mut ffmpeg_next::frame::Audio) -> Result<()> {
        Ok(self.decoder.receive_frame(frame)?)
    }
}

/// Decodes the best audio stream of a media file into [AudioSegment]s.
///
/// Audio is resampled to mono `f32` at the requested sample rate, then cut into windows of
/// `window` seconds that overlap by the `overlap` fraction. The trailing partial window is
/// zero-padded so that even a very short clip yields one segment.
#[derive(Clone, Debug)]
pub struct FfmpegSegmentSource {
    path: PathBuf,
    sample_rate: u32,
    window: f64,
    overlap: f64,
    threaded_decoding: bool,
}

impl FfmpegSegmentSource {
    pub fn new(path: impl AsRef<Path>, sample_rate: u32, window: f64, overlap: f64) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            sample_rate,
            window,
            overlap,
            threaded_decoding: false,
        }
    }

    /// Builds a source that produces segments in the shape the classifier expects.
    pub fn for_classifier(path: impl AsRef<Path>, classifier: &dyn super::SoundClassifier) -> Self {
        Self::new(
            path,
            classifier.sample_rate(),
            classifier.window_duration(),
            classifier.overlap(),
        )
    }

    /// Returns a new [FfmpegSegmentSource] with `threaded_decoding` set to the provided value.
    pub fn with_threaded_decoding(mut self, threaded_decoding: bool) -> Self {
        self.threaded_decoding = threaded_decoding;
        self
    }

    fn resampler(
        &self,
        frame: &ffmpeg_next::frame::Audio,
    ) -> Result<ffmpeg_next::software::resampling::context::Context> {
        Ok(frame.resampler(
            ffmpeg_next::format::Sample::F32(ffmpeg_next::format::sample::Type::Packed),
            ffmpeg_next::ChannelLayout::MONO,
            self.sample_rate,
        )?)
    }

    // Resamples one decoded frame to mono F32 and feeds it to the segmenter.
    fn resample_frame(
        &self,
        resampler: &mut ffmpeg_next::software::resampling::context::Context,
        frame: &ffmpeg_next::frame::Audio,
        frame_resampled: &mut ffmpeg_next::frame::Audio,
        segmenter: &mut Segmenter,
        on_segment: &mut dyn FnMut(AudioSegment) -> Result<()>,
    ) -> Result<()> {
        let mut delay = match resampler.run(frame, frame_resampled) {
            Ok(v) => v,
            // If resampling fails due to changed input, construct a new resampler for this
            // frame and swap out the old one.
            Err(ffmpeg_next::Error::InputChanged) => {
                let mut local_resampler = self.resampler(frame)?;
                let delay = local_resampler.run(frame, frame_resampled)?;
                *resampler = local_resampler;
                delay
            }
            Err(e) => return Err(e.into()),
        };

        loop {
            // Obtain a slice of raw bytes. There is a single channel, so every 4 bytes form
            // one sample.
            //
            // Note that `data` is a fixed-size buffer. To get the _actual_ sample bytes, we need
            // to use the sample count and the number of bytes per F32 sample.
            let raw_samples = &frame_resampled.data(0)[..frame_resampled.samples() * 4];

            // SAFETY: The buffer contains f32 samples because we explicitly told the resampler
            // to return packed F32 samples (see above).
            let (_, samples, _) = unsafe { raw_samples.align_to::<f32>() };
            segmenter.push(samples, on_segment)?;

            if delay.is_none() {
                break;
            }
            delay = resampler.flush(frame_resampled)?;
        }

        Ok(())
    }
}

impl SegmentSource for FfmpegSegmentSource {
    fn scan(&mut self, on_segment: &mut dyn FnMut(AudioSegment) -> Result<()>) -> Result<()> {
        let span = tracing::span!(tracing::Level::TRACE, "scan");
        let _enter = span.enter();

        let mut ctx = ffmpeg_next::format::input(&self.path)?;
        let (stream_idx, parameters) = {
            let stream = ctx
                .streams()
                .best(ffmpeg_next::media::Type::Audio)
                .ok_or_else(|| Error::MissingAudioTrack(self.path.clone()))?;
            (stream.index(), stream.parameters())
        };
        let mut decoder = Decoder::from_parameters(parameters, self.threaded_decoding)?;
        let mut segmenter = Segmenter::new(self.sample_rate, self.window, self.overlap)?;

        let mut resampler = decoder.decoder.resampler(
            ffmpeg_next::format::Sample::F32(ffmpeg_next::format::sample::Type::Packed),
            ffmpeg_next::ChannelLayout::MONO,
            self.sample_rate,
        )?;
        let mut frame = ffmpeg_next::frame::Audio::empty();
        let mut frame_resampled = ffmpeg_next::frame::Audio::empty();

        tracing::debug!("starting audio scan for {}", self.path.display());

        for (stream, packet) in ctx.packets() {
            if stream.index() != stream_idx {
                continue;
            }
            if packet.pts().map_or(false, |pts| pts < 0) {
                // Skip packets with an invalid PTS. This can happen if, e.g., the
                // video was trimmed.
                // See: https://stackoverflow.com/a/41032346/845275
                continue;
            }

            decoder.send_packet(&packet)?;
            while decoder.receive_frame(&mut frame).is_ok() {
                self.resample_frame(
                    &mut resampler,
                    &frame,
                    &mut frame_resampled,
                    &mut segmenter,
                    on_segment,
                )?;
            }
        }

        decoder.send_eof()?;
        while decoder.receive_frame(&mut frame).is_ok() {
            self.resample_frame(
                &mut resampler,
                &frame,
                &mut frame_resampled,
                &mut segmenter,
                on_segment,
            )?;
        }

        segmenter.finish(on_segment)?;
        tracing::debug!("completed audio scan for {}", self.path.display());

        Ok(())
    }
}
