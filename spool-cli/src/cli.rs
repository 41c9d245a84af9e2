use clap::Parser;
use std::path::PathBuf;
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "spool",
    author,
    version,
    about = "Download a streamed audiobook from its web page",
    long_about = "Renders the page in a headless browser to capture its signed playlist, \
                  then downloads, decrypts and reassembles every segment in order."
)]
pub struct Args {
    /// Page URL that plays the stream
    pub url: Url,

    /// Download directory [default: <title>]
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Overwrite existing files without a prompt
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Merge all segments into one file
    #[arg(short = '1', long = "one-file")]
    pub one_file: bool,

    /// Number of segments downloaded in parallel
    #[arg(short = 'j', long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Chromium or Chrome executable
    #[arg(long, value_name = "PATH", env = "SPOOL_BROWSER")]
    pub browser: Option<PathBuf>,

    /// Show the browser window instead of running headless
    #[arg(long)]
    pub show_browser: bool,

    /// ffmpeg executable used to convert the merged file
    #[arg(long, value_name = "PATH", env = "SPOOL_FFMPEG")]
    pub ffmpeg: Option<PathBuf>,

    /// Keep the merged file as downloaded
    #[arg(long)]
    pub no_transcode: bool,

    /// Configuration file [default: <config dir>/spool/config.toml]
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Only print errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}
