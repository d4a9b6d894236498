use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, CommandFactory, ErrorKind, Parser, Subcommand};

use rapport::audio::CentroidModel;
use rapport::session::{AnalysisObserver, AnalysisReport, AnalysisSession};
use rapport::sync::PlaybackState;
use rapport::timeline::{EmotionEvent, EyeContactTimeline};
use rapport::util::format_time;
use rapport::video::{self, GazeThresholds, SidecarLandmarkDetector};

#[derive(Debug, Subcommand)]
enum Commands {
    #[clap(after_help = "Displays info about rapport and its dependencies.")]
    Info,

    #[clap(
        arg_required_else_help = true,
        after_help = "Analyze a video into two timelines: emotion labels classified from its audio track, and the times at which the speaker makes eye contact with the camera. The timelines are then replayed at a fixed cadence, the way a player would poll them during playback."
    )]
    Analyze {
        #[clap(
            required = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Video file to analyze. It must contain at least one audio track and one video track."
        )]
        video: PathBuf,

        #[clap(
            long,
            required = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Path to the pretrained emotion model (JSON)."
        )]
        model: PathBuf,

        #[clap(
            long,
            value_parser = clap::value_parser!(PathBuf),
            help = "Path to precomputed face landmarks (JSON). Defaults to the .landmarks.json file stored alongside the video."
        )]
        landmarks: Option<PathBuf>,

        #[clap(
            long,
            value_parser = clap::value_parser!(PathBuf),
            help = "Path to a JSON file overriding the eye-contact thresholds (yaw_threshold, vertical_band_low, vertical_band_high, horizontal_deviation_max)."
        )]
        thresholds: Option<PathBuf>,

        #[clap(
            long,
            default_value_t = rapport::DEFAULT_SAMPLE_INTERVAL,
            value_parser = clap::value_parser!(f64),
            help = "Time between sampled video frames, in seconds. Lower values give a denser eye-contact timeline at the cost of more decoding."
        )]
        interval: f64,

        #[clap(
            long,
            default_value_t = rapport::DEFAULT_EYE_CONTACT_WINDOW,
            value_parser = clap::value_parser!(f64),
            help = "Playback is in eye contact if a detection lies strictly within this many seconds of the playback time."
        )]
        window: f64,

        #[clap(
            long,
            default_value_t = video::DEFAULT_MAX_CONCURRENT_FRAMES,
            value_parser = clap::value_parser!(usize),
            help = "Maximum number of frames decoded and classified at the same time."
        )]
        max_concurrent_frames: usize,

        #[clap(
            long,
            default_value_t = video::DEFAULT_MAX_FRAME_DIMENSION,
            value_parser = clap::value_parser!(u32),
            help = "Frames are scaled down to fit within a square of this size (pixels) before landmark detection."
        )]
        max_frame_size: u32,

        #[clap(
            long,
            default_value_t = video::DEFAULT_FRAME_TIMEOUT,
            value_parser = clap::value_parser!(f64),
            help = "Maximum time spent on a single frame, in seconds. A frame that takes longer counts as having no eye contact. Set to 0 to disable."
        )]
        frame_timeout: f64,

        #[clap(
            long,
            default_value_t = rapport::DEFAULT_PLAYBACK_CADENCE,
            value_parser = clap::value_parser!(f64),
            help = "Cadence at which the playback state is polled, in seconds."
        )]
        playback_cadence: f64,

        #[clap(
            long,
            value_parser = clap::value_parser!(f64),
            help = "Resolve the playback state at this time (seconds). Can be repeated."
        )]
        at: Vec<f64>,

        #[clap(
            long,
            value_parser = clap::value_parser!(PathBuf),
            help = "Write the analysis report to this path as JSON."
        )]
        output: Option<PathBuf>,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Enable multi-threaded decoding in FFmpeg."
        )]
        threaded_decoding: bool,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Do not display the timelines and playback transitions in stdout."
        )]
        no_display: bool,
    },
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        long,
        global = true,
        default_value = "false",
        action(ArgAction::SetTrue),
        help = "By default, the video file is validated using FFmpeg, which is extremely accurate. Setting this flag will switch to just checking the file header."
    )]
    file_headers_only: bool,

    #[clap(
        short,
        long,
        global = true,
        default_value = "false",
        action(ArgAction::SetTrue),
        help = "Enable debug logging."
    )]
    verbose: bool,
}

impl Cli {
    fn validate(&self) {
        let mut cmd = Cli::command();
        match self.command {
            Commands::Info => (),
            Commands::Analyze {
                ref video,
                interval,
                window,
                max_concurrent_frames,
                max_frame_size,
                frame_timeout,
                playback_cadence,
                ref at,
                ..
            } => {
                if !(interval > 0.0) {
                    cmd.error(ErrorKind::InvalidValue, "interval must be a positive number")
                        .exit();
                }
                if !(window > 0.0) {
                    cmd.error(ErrorKind::InvalidValue, "window must be a positive number")
                        .exit();
                }
                if !(playback_cadence > 0.0) {
                    cmd.error(
                        ErrorKind::InvalidValue,
                        "playback_cadence must be a positive number",
                    )
                    .exit();
                }
                if max_concurrent_frames == 0 {
                    cmd.error(
                        ErrorKind::InvalidValue,
                        "max_concurrent_frames must be at least 1",
                    )
                    .exit();
                }
                if max_frame_size == 0 {
                    cmd.error(ErrorKind::InvalidValue, "max_frame_size must be at least 1")
                        .exit();
                }
                if !(frame_timeout >= 0.0) || !frame_timeout.is_finite() {
                    cmd.error(
                        ErrorKind::InvalidValue,
                        "frame_timeout must be a non-negative number",
                    )
                    .exit();
                }
                if at.iter().any(|t| !t.is_finite()) {
                    cmd.error(ErrorKind::InvalidValue, "at must be a finite number")
                        .exit();
                }
                if !rapport::util::is_valid_video_file(video, !self.file_headers_only) {
                    cmd.error(
                        ErrorKind::InvalidValue,
                        format!(
                            "{} is not a valid video file with audio and video tracks",
                            video.display()
                        ),
                    )
                    .exit();
                }
            }
        }
    }
}

// Prints results as they arrive.
struct Printer {
    enabled: bool,
}

impl AnalysisObserver for Printer {
    fn on_emotion_event(&self, event: &EmotionEvent) {
        if self.enabled {
            println!("[{}] emotion: {}", format_time(event.time()), event.label());
        }
    }

    fn on_eye_contact_result(&self, timeline: &EyeContactTimeline) {
        if self.enabled {
            println!("eye contact detected in {} sampled frame(s)", timeline.len());
        }
    }
}

fn display_state(state: &PlaybackState) {
    println!(
        "[{}] emotion: {:<10} eye contact: {}",
        format_time(state.current_time),
        state.current_emotion.as_deref().unwrap_or("-"),
        if state.current_eye_contact { "yes" } else { "no" }
    );
}

// Prints the playback states at which the resolved state changes.
fn display_playback(
    report: &AnalysisReport,
    window: f64,
    cadence: f64,
    at: &[f64],
) -> rapport::Result<()> {
    let sync = report.synchronizer(window);

    println!("\nPlayback ({}s cadence):", cadence);
    let mut previous: Option<(Option<String>, bool)> = None;
    for state in sync.poll(report.duration, cadence)? {
        let current = (state.current_emotion.clone(), state.current_eye_contact);
        if previous.as_ref() != Some(&current) {
            display_state(&state);
            previous = Some(current);
        }
    }

    if !at.is_empty() {
        println!();
        for t in at {
            display_state(&sync.resolve(*t));
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn analyze(
    video: PathBuf,
    model: PathBuf,
    landmarks: Option<PathBuf>,
    thresholds: Option<PathBuf>,
    session: AnalysisSession,
    window: f64,
    playback_cadence: f64,
    at: &[f64],
    output: Option<PathBuf>,
    display: bool,
) -> rapport::Result<()> {
    // Fatal before anything is analyzed.
    let classifier = CentroidModel::load(&model)?;
    let detector = match landmarks {
        Some(path) => SidecarLandmarkDetector::from_path(path)?,
        None => SidecarLandmarkDetector::from_video(&video)?,
    }
    .with_sampling_interval(session.interval());
    let thresholds = match thresholds {
        Some(path) => GazeThresholds::from_path(path)?,
        None => GazeThresholds::default(),
    };

    let session = Arc::new(session.with_thresholds(thresholds));
    let canceller = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling analysis");
            canceller.cancel();
        }
    });

    let printer = Printer { enabled: display };
    let report = session
        .run(&video, classifier, Arc::new(detector), &printer)
        .await?;

    if display {
        let timestamps: Vec<String> = report
            .eye_contact
            .timestamps()
            .iter()
            .map(|t| format_time(*t))
            .collect();
        println!("\nEye contact at: {}", timestamps.join(", "));
        display_playback(&report, window, playback_cadence, at)?;
    }

    if let Some(output) = output {
        let f = std::fs::File::create(&output)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(f), &report)?;
        tracing::info!("wrote report to {}", output.display());
    }

    Ok(())
}

#[tokio::main]
async fn main() -> rapport::Result<()> {
    let args = Cli::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {}", e);
    }

    ffmpeg_next::init()?;

    args.validate();

    match args.command {
        Commands::Analyze {
            video,
            model,
            landmarks,
            thresholds,
            interval,
            window,
            max_concurrent_frames,
            max_frame_size,
            frame_timeout,
            playback_cadence,
            at,
            output,
            threaded_decoding,
            no_display,
        } => {
            let frame_timeout =
                (frame_timeout > 0.0).then(|| Duration::from_secs_f64(frame_timeout));
            let session = AnalysisSession::new()
                .with_interval(interval)
                .with_max_concurrent_frames(max_concurrent_frames)
                .with_max_frame_dimension(max_frame_size)
                .with_frame_timeout(frame_timeout)
                .with_threaded_decoding(threaded_decoding);
            analyze(
                video,
                model,
                landmarks,
                thresholds,
                session,
                window,
                playback_cadence,
                &at,
                output,
                !no_display,
            )
            .await?;
        }
        Commands::Info => {
            println!("FFmpeg version: {}", rapport::util::ffmpeg_version_string());
        }
    }

    Ok(())
}
