use std::io::Read;
use std::path::Path;

use crate::session::MediaInfo;
use crate::{Error, Result};

/// `FFmpeg`'s internal time base (microseconds), used for container-level durations and seeks.
const AV_TIME_BASE: f64 = 1_000_000.0;

/// Number of leading bytes read when sniffing or hashing a file header.
const HEADER_LEN: usize = 8192;

/// Formats a time in seconds as "MM:SS.mmm".
pub fn format_time(seconds: f64) -> String {
    let millis = (seconds.max(0.0) * 1000.0).round() as u64;
    format!(
        "{:02}:{:02}.{:03}",
        millis / 60_000,
        (millis / 1000) % 60,
        millis % 1000
    )
}

/// Converts seconds into `FFmpeg`'s internal time base.
pub(crate) fn to_av_time_base(seconds: f64) -> i64 {
    (seconds * AV_TIME_BASE).round() as i64
}

fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    std::fs::File::open(path)?
        .take(HEADER_LEN as u64)
        .read_to_end(&mut buf)?;
    Ok(buf)
}

/// Checks if the given path points to a valid video file.
///
/// If `full` is set to **false**, only the file header will be checked. This is a very cheap
/// operation, but it does not guarantee validity. If set to **true**, FFmpeg will be used to
/// check that the file contains at least one video stream and at least one audio stream.
pub fn is_valid_video_file(path: impl AsRef<Path>, full: bool) -> bool {
    if !full {
        return read_header(path.as_ref())
            .map(|buf| infer::is_video(&buf))
            .unwrap_or(false);
    }

    probe_media(path)
        .map(|info| info.video_tracks > 0 && info.audio_tracks > 0)
        .unwrap_or(false)
}

/// Computes the MD5 of the first few KB of a file. This identifies a source cheaply.
pub fn compute_header_md5sum(path: impl AsRef<Path>) -> Result<String> {
    let buf = read_header(path.as_ref())?;
    Ok(format!("{:x}", md5::compute(&buf)))
}

/// Loads the track layout and duration of a media file.
///
/// The duration is taken from the best video stream, falling back to the container. A file
/// without a positive duration fails with [Error::DurationUnavailable].
pub fn probe_media(path: impl AsRef<Path>) -> Result<MediaInfo> {
    let path = path.as_ref();
    ffmpeg_next::init()?;

    let ctx = ffmpeg_next::format::input(&path)?;
    let count = |medium: ffmpeg_next::media::Type| {
        ctx.streams()
            .filter(|s| s.parameters().medium() == medium)
            .count()
    };
    let video_tracks = count(ffmpeg_next::media::Type::Video);
    let audio_tracks = count(ffmpeg_next::media::Type::Audio);

    let stream_duration = ctx
        .streams()
        .best(ffmpeg_next::media::Type::Video)
        .filter(|s| s.duration() > 0)
        .map(|s| s.duration() as f64 * f64::from(s.time_base()));
    let duration = stream_duration
        .or_else(|| (ctx.duration() > 0).then(|| ctx.duration() as f64 / AV_TIME_BASE))
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| Error::DurationUnavailable(path.to_owned()))?;

    tracing::debug!(
        duration,
        video_tracks,
        audio_tracks,
        "probed {}",
        path.display()
    );

    Ok(MediaInfo {
        duration,
        audio_tracks,
        video_tracks,
    })
}

/// Returns the underlying FFmpeg version integer.
pub fn ffmpeg_version() -> u32 {
    ffmpeg_next::util::version()
}

/// Returns the underlying FFmpeg version string.
pub fn ffmpeg_version_string() -> String {
    let version_int = ffmpeg_version();

    // Reference: https://github.com/FFmpeg/FFmpeg/blob/130d19bf2044ac76372d1b97ab87ab283c8b37f8/libavutil/version.h#L64
    format!(
        "{}.{}.{}",
        version_int >> 16,             // MAJOR
        (version_int & 0x00FF00) >> 8, // MINOR
        version_int & 0xFF             // MICRO
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0.0), "00:00.000");
        assert_eq!(format_time(1.05), "00:01.050");
        assert_eq!(format_time(75.5), "01:15.500");
        assert_eq!(format_time(-3.0), "00:00.000");
    }

    #[test]
    fn test_to_av_time_base() {
        assert_eq!(to_av_time_base(0.0), 0);
        assert_eq!(to_av_time_base(1.5), 1_500_000);
        assert_eq!(to_av_time_base(0.1), 100_000);
    }

    #[test]
    fn test_header_md5sum() {
        let path = std::env::temp_dir().join(format!("rapport-md5-{}.bin", std::process::id()));
        std::fs::write(&path, b"hello").unwrap();
        let hash = compute_header_md5sum(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(hash, "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_missing_files() {
        assert!(!is_valid_video_file("/nonexistent/video.mp4", false));
        assert!(!is_valid_video_file("/nonexistent/video.mp4", true));
        assert!(compute_header_md5sum("/nonexistent/video.mp4").is_err());
        assert!(probe_media("/nonexistent/video.mp4").is_err());
    }
}
