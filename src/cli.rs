use adsynq::creative::{CreativeKind, Stage};
use adsynq::ui::OutputFormat;
use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};
use std::path::PathBuf;

/// Ad creative pipeline: image, narration and video with attempt tracking
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Show debug events, including muxing tool output
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Event output format
    #[arg(long, value_enum, default_value_t = OutputArg::Text, global = true)]
    pub output: OutputArg,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Use an alternate config file
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputArg {
    Text,
    Json,
}

impl From<OutputArg> for OutputFormat {
    fn from(arg: OutputArg) -> Self {
        match arg {
            OutputArg::Text => OutputFormat::Text,
            OutputArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run image, voice and video generation for one campaign
    Generate(GenerateArgs),
    /// Generate only the campaign image
    Image(ImageArgs),
    /// Generate only the campaign narration
    Voice(VoiceArgs),
    /// Compose a video from existing image and audio artifacts
    Compose(ComposeArgs),
    /// Mark a campaign final; later generation attempts are rejected
    Finalize(KeyArgs),
    /// Show attempt counters and remaining quota for a campaign
    Status(KeyArgs),
    /// Inspect and export recorded attempts
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },
    /// Browse every stored artifact version
    Assets {
        #[command(subcommand)]
        command: AssetCommands,
    },
    /// Print the caption timing for a prompt without generating anything
    SyncMap(SyncMapArgs),
    /// Show or create the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    /// Account the creative belongs to
    #[arg(short, long)]
    pub subject: String,

    /// Campaign name
    #[arg(short, long)]
    pub campaign: String,
}

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    #[command(flatten)]
    pub key: KeyArgs,

    /// Ad brief used for the image, the narration and the captions
    #[arg(short, long)]
    pub prompt: String,

    /// Style hint for the image
    #[arg(long)]
    pub image_style: Option<String>,

    /// Voice to narrate with
    #[arg(long)]
    pub voice_style: Option<String>,

    /// Requested creative kind; only video and composite run the full chain
    #[arg(long, default_value = "video")]
    pub kind: CreativeKind,
}

#[derive(Args, Debug, Clone)]
pub struct ImageArgs {
    #[command(flatten)]
    pub key: KeyArgs,

    #[arg(short, long)]
    pub prompt: String,

    #[arg(long)]
    pub style: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct VoiceArgs {
    #[command(flatten)]
    pub key: KeyArgs,

    /// Narration text
    #[arg(short, long)]
    pub text: String,

    /// Provider voice id
    #[arg(long)]
    pub voice: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ComposeArgs {
    #[command(flatten)]
    pub key: KeyArgs,

    /// Prompt the captions are derived from
    #[arg(short, long)]
    pub prompt: String,

    /// Image artifact reference, relative to the output directory
    #[arg(long)]
    pub image: String,

    /// Audio artifact reference, relative to the output directory
    #[arg(long)]
    pub audio: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum HistoryCommands {
    /// List recorded campaigns, newest first
    List {
        #[arg(short, long)]
        subject: Option<String>,
    },
    /// Show the newest campaign whose name contains the given text
    Show {
        #[arg(short, long)]
        campaign: String,

        #[arg(short, long)]
        subject: Option<String>,
    },
    /// Export records as JSON or CSV
    Export {
        #[arg(short, long)]
        subject: Option<String>,

        #[arg(short, long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,

        /// Write to a file instead of stdout
        #[arg(short, long, value_hint = ValueHint::FilePath)]
        out: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Subcommand, Debug, Clone)]
pub enum AssetCommands {
    /// List cataloged artifacts, newest first
    List(AssetListArgs),
}

#[derive(Args, Debug, Clone)]
pub struct AssetListArgs {
    #[arg(short, long)]
    pub subject: Option<String>,

    /// Stage that produced the artifact (image, voice/audio, video)
    #[arg(short, long)]
    pub kind: Option<Stage>,

    /// Exact campaign name
    #[arg(short, long)]
    pub campaign: Option<String>,

    /// Case-insensitive text to look for in the prompt
    #[arg(long)]
    pub search: Option<String>,

    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..=500))]
    pub limit: u32,

    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub page: u32,
}

#[derive(Args, Debug, Clone)]
pub struct SyncMapArgs {
    #[arg(short, long)]
    pub prompt: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration (API keys redacted)
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
