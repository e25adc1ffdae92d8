use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "engine-play", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// TOML engine config; flags below override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Ring buffer capacity in frames (rounded up to a power of two)
    #[arg(long)]
    pub ring_buffer_frames: Option<u32>,

    /// Frames decoded per producer iteration
    #[arg(long)]
    pub decode_chunk_frames: Option<u32>,

    /// Output volume, 0.0 to 1.0
    #[arg(long)]
    pub volume: Option<f32>,

    /// Limiter pre-gain in dB (0 disables the limiter)
    #[arg(long, allow_hyphen_values = true)]
    pub pre_gain: Option<f32>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a local file until it ends or Ctrl-C
    Play {
        /// Path or file:// URL of the audio file
        path: String,

        /// MIME type hint; takes precedence over the file extension
        #[arg(long)]
        mime: Option<String>,

        /// First frame of a region to play
        #[arg(long)]
        start: Option<u64>,

        /// Region length in frames (default: to the end)
        #[arg(long, requires = "start")]
        frames: Option<u64>,

        /// Extra passes over the region
        #[arg(long, requires = "start", conflicts_with = "forever")]
        repeat: Option<u32>,

        /// Loop the region until interrupted
        #[arg(long, requires = "start")]
        forever: bool,

        /// Seconds between status lines
        #[arg(long, default_value_t = 2.0)]
        status_interval: f32,

        /// Print the final status as JSON
        #[arg(long)]
        json: bool,
    },

    /// List output devices and exit
    Devices,

    /// List the file extensions and MIME types the decoders handle
    Formats,
}
