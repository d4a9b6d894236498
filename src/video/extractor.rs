extern crate ffmpeg_next;

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// A decoded frame and the sample timestamp (seconds) it was extracted for.
#[derive(Clone, Debug)]
pub struct Frame {
    pub timestamp: f64,
    pub image: image::RgbImage,
}

/// Extracts a single frame from a video at a given time.
///
/// `Ok(None)` means no usable frame exists at that time (e.g., past the last frame).
pub trait FrameExtractor: Send + Sync {
    fn extract(&self, at: f64) -> Result<Option<Frame>>;
}

/// Thin wrapper around the native `FFmpeg` video decoder.
struct VideoDecoder {
    decoder: ffmpeg_next::codec::decoder::Video,
}

impl VideoDecoder {
    fn from_parameters(parameters: ffmpeg_next::codec::Parameters) -> Result<Self> {
        let ctx = ffmpeg_next::codec::context::Context::from_parameters(parameters)?;
        Ok(Self {
            decoder: ctx.decoder().video()?,
        })
    }

    fn send_packet(&mut self, packet: &ffmpeg_next::packet::Packet) -> Result<()> {
        Ok(self.decoder.send_packet(packet)?)
    }

    fn send_eof(&mut self) -> Result<()> {
        Ok(self.decoder.send_eof()?)
    }

    fn receive_frame(&mut self, frame: &mut ffmpeg_next::frame::Video) -> Result<()> {
        Ok(self.decoder.receive_frame(frame)?)
    }
}

/// Extracts frames with `FFmpeg`, scaling each one down to fit a bounded square.
///
/// Every call opens its own input context, so extractions can run on separate threads.
#[derive(Clone, Debug)]
pub struct FfmpegFrameExtractor {
    path: PathBuf,
    max_dimension: u32,
}

impl FfmpegFrameExtractor {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            max_dimension: super::DEFAULT_MAX_FRAME_DIMENSION,
        }
    }

    /// Returns a new [FfmpegFrameExtractor] with the provided `max_dimension`.
    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension.max(1);
        self
    }

    // Returns true once the decoder has produced the frame that is displayed at `at`.
    fn reached(frame: &ffmpeg_next::frame::Video, time_base: f64, at: f64) -> bool {
        // Allow for the rounding of `at` into time base units.
        const EPSILON: f64 = 1e-3;
        match frame.timestamp().or_else(|| frame.pts()) {
            Some(pts) => pts as f64 * time_base + EPSILON >= at,
            None => true,
        }
    }

    // Converts the frame to packed RGB, scaled to fit within `max_dimension`.
    fn to_image(&self, frame: &ffmpeg_next::frame::Video) -> Result<Option<image::RgbImage>> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(None);
        }

        let (width, height) = fit_within(frame.width(), frame.height(), self.max_dimension);
        let mut scaler = ffmpeg_next::software::scaling::context::Context::get(
            frame.format(),
            frame.width(),
            frame.height(),
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
            ffmpeg_next::software::scaling::flag::Flags::BILINEAR,
        )?;
        let mut rgb = ffmpeg_next::frame::Video::empty();
        scaler.run(frame, &mut rgb)?;

        // Rows in the FFmpeg buffer are padded out to the stride, so copy them one by one.
        let stride = rgb.stride(0);
        let row_len = width as usize * 3;
        let data = rgb.data(0);
        let mut buf = Vec::with_capacity(row_len * height as usize);
        for row in data.chunks(stride).take(height as usize) {
            if row.len() < row_len {
                return Ok(None);
            }
            buf.extend_from_slice(&row[..row_len]);
        }

        Ok(image::RgbImage::from_raw(width, height, buf))
    }

    fn decode_at(&self, at: f64) -> Result<Option<image::RgbImage>> {
        let mut ctx = ffmpeg_next::format::input(&self.path)?;
        let (stream_idx, time_base, parameters) = {
            let stream = ctx
                .streams()
                .best(ffmpeg_next::media::Type::Video)
                .ok_or_else(|| Error::MissingVideoTrack(self.path.clone()))?;
            (stream.index(), f64::from(stream.time_base()), stream.parameters())
        };
        let mut decoder = VideoDecoder::from_parameters(parameters)?;

        // Seek to the closest keyframe at or before the requested time, then decode
        // forward from there.
        let timestamp = crate::util::to_av_time_base(at);
        ctx.seek(timestamp, i64::MIN..timestamp)?;

        let mut frame = ffmpeg_next::frame::Video::empty();
        for (stream, packet) in ctx.packets() {
            if stream.index() != stream_idx {
                continue;
            }
            decoder.send_packet(&packet)?;
            while decoder.receive_frame(&mut frame).is_ok() {
                if Self::reached(&frame, time_base, at) {
                    return self.to_image(&frame);
                }
            }
        }

        // Drain any frames still buffered in the decoder.
        decoder.send_eof()?;
        while decoder.receive_frame(&mut frame).is_ok() {
            if Self::reached(&frame, time_base, at) {
                return self.to_image(&frame);
            }
        }

        Ok(None)
    }
}

impl FrameExtractor for FfmpegFrameExtractor {
    fn extract(&self, at: f64) -> Result<Option<Frame>> {
        let _g = tracing::span!(tracing::Level::TRACE, "extract", at).entered();

        let image = self.decode_at(at).map_err(|e| Error::FrameExtraction {
            at,
            reason: e.to_string(),
        })?;
        Ok(image.map(|image| Frame {
            timestamp: at,
            image,
        }))
    }
}

// Scales `(width, height)` down, keeping the aspect ratio, so that neither side exceeds `max`.
fn fit_within(width: u32, height: u32, max: u32) -> (u32, u32) {
    if width <= max && height <= max {
        return (width, height);
    }
    let scale = max as f64 / width.max(height) as f64;
    let scaled = |v: u32| ((v as f64 * scale).round() as u32).clamp(1, max);
    (scaled(width), scaled(height))
}
