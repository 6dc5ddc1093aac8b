use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::Path;

use adsynq::common::{AppConfig, paths};
use adsynq::creative::record::normalize_subject;
use adsynq::creative::segment::{build_sync_map, total_duration};
use adsynq::creative::{
    ArtifactRef, AssetPage, AssetQuery, AttemptRecord, ComposeRequest, CompositeRequest,
    CreativeKey, CreativeKind, ImageRequest, Pipeline, PipelineFailure, PipelineStage, Stage,
    StageError, VoiceRequest,
};
use adsynq::ui::prelude::{Level, OutputFormat, emit, get_output_format};
use adsynq::ui::is_debug_enabled;

use crate::cli::{
    AssetCommands, AssetListArgs, Cli, Commands, ComposeArgs, ConfigCommands, ExportFormat,
    GenerateArgs, HistoryCommands, ImageArgs, KeyArgs, VoiceArgs,
};

/// Process exit status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Success,
    Failed,
    /// The requested transition had already happened.
    Conflict,
}

impl Exit {
    pub fn code(self) -> i32 {
        match self {
            Exit::Success => 0,
            Exit::Failed => 1,
            Exit::Conflict => 2,
        }
    }
}

pub async fn dispatch(cli: Cli) -> Result<Exit> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => paths::config_file_path()?,
    };

    match cli.command {
        Commands::SyncMap(args) => Ok(handle_sync_map(&args.prompt)),
        Commands::Config { command } => handle_config(command, &config_path),
        command => {
            let config = AppConfig::load_with_env(&config_path)?;
            let pipeline = Pipeline::from_config(&config, is_debug_enabled())?;
            run_with_pipeline(command, &pipeline).await
        }
    }
}

async fn run_with_pipeline(command: Commands, pipeline: &Pipeline) -> Result<Exit> {
    match command {
        Commands::Generate(args) => Ok(handle_generate(args, pipeline).await),
        Commands::Image(args) => Ok(handle_image(args, pipeline).await),
        Commands::Voice(args) => Ok(handle_voice(args, pipeline).await),
        Commands::Compose(args) => Ok(handle_compose(args, pipeline).await),
        Commands::Finalize(args) => Ok(handle_finalize(&args, pipeline)),
        Commands::Status(args) => Ok(handle_status(&args, pipeline)),
        Commands::History { command } => handle_history(command, pipeline),
        Commands::Assets {
            command: AssetCommands::List(args),
        } => handle_assets(&args, pipeline),
        Commands::SyncMap(_) | Commands::Config { .. } => Ok(Exit::Success),
    }
}

fn report_failure(failure: &PipelineFailure) -> Exit {
    emit(
        Level::Error,
        "creative.failed",
        &failure.to_string(),
        serde_json::to_value(failure.report()).ok(),
    );
    Exit::Failed
}

fn report_result<T: Serialize>(code: &str, message: &str, result: &T) {
    emit(Level::Success, code, message, serde_json::to_value(result).ok());
}

async fn handle_generate(args: GenerateArgs, pipeline: &Pipeline) -> Exit {
    let request = CompositeRequest {
        subject: args.key.subject,
        campaign: args.key.campaign,
        prompt: args.prompt,
        image_style: args.image_style,
        voice_style: args.voice_style,
        kind: args.kind,
    };

    match pipeline.generate(&request).await {
        Ok(ad) => {
            report_result(
                "creative.generate.result",
                &format!(
                    "image: {}\naudio: {}\nvideo: {}\nattempt {} ({} caption segments)",
                    ad.image_url,
                    ad.audio_url,
                    ad.video_url,
                    ad.total_attempts,
                    ad.sync_map.len()
                ),
                &ad,
            );
            Exit::Success
        }
        // The pipeline already emitted the failure event
        Err(_) => Exit::Failed,
    }
}

async fn handle_image(args: ImageArgs, pipeline: &Pipeline) -> Exit {
    if let Err(e) = pipeline.throttle(&args.key.subject, Stage::Image).await {
        return report_failure(&PipelineFailure::at(Stage::Image, e));
    }
    let request = ImageRequest {
        subject: args.key.subject,
        campaign: args.key.campaign,
        prompt: args.prompt,
        style: args.style,
    };
    match pipeline.image().generate(&request).await {
        Ok(artifact) => {
            report_result("creative.image.result", &artifact.url, &artifact);
            Exit::Success
        }
        Err(e) => report_failure(&PipelineFailure::at(Stage::Image, e)),
    }
}

async fn handle_voice(args: VoiceArgs, pipeline: &Pipeline) -> Exit {
    if let Err(e) = pipeline.throttle(&args.key.subject, Stage::Voice).await {
        return report_failure(&PipelineFailure::at(Stage::Voice, e));
    }
    let request = VoiceRequest {
        subject: args.key.subject,
        campaign: args.key.campaign,
        text: args.text,
        voice: args.voice,
    };
    match pipeline.voice().generate(&request).await {
        Ok(artifact) => {
            report_result("creative.voice.result", &artifact.url, &artifact);
            Exit::Success
        }
        Err(e) => report_failure(&PipelineFailure::at(Stage::Voice, e)),
    }
}

async fn handle_compose(args: ComposeArgs, pipeline: &Pipeline) -> Exit {
    if let Err(e) = pipeline.throttle(&args.key.subject, Stage::Video).await {
        return report_failure(&PipelineFailure::at(Stage::Video, e));
    }
    let request = ComposeRequest {
        subject: args.key.subject,
        campaign: args.key.campaign,
        prompt: args.prompt,
        image: ArtifactRef::new(args.image),
        audio: ArtifactRef::new(args.audio),
    };
    match pipeline.composer().compose(&request).await {
        Ok(composition) => {
            report_result("creative.video.result", &composition.url, &composition);
            Exit::Success
        }
        Err(e) => report_failure(&PipelineFailure::at(Stage::Video, e)),
    }
}

fn handle_finalize(args: &KeyArgs, pipeline: &Pipeline) -> Exit {
    match pipeline.finalize(&args.subject, &args.campaign) {
        Ok(report) if report.conflict => {
            emit(
                Level::Warn,
                "creative.finalize.result",
                "Already finalized; nothing changed",
                serde_json::to_value(&report).ok(),
            );
            Exit::Conflict
        }
        Ok(report) => {
            let when = report
                .finalized_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            report_result("creative.finalize.result", &format!("Finalized at {when}"), &report);
            Exit::Success
        }
        Err(e) => report_failure(&PipelineFailure::at(PipelineStage::Request, e)),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport<'a> {
    #[serde(flatten)]
    record: &'a AttemptRecord,
    remaining: Remaining,
}

#[derive(Serialize)]
struct Remaining {
    image: Option<u32>,
    audio: Option<u32>,
    video: Option<u32>,
}

fn handle_status(args: &KeyArgs, pipeline: &Pipeline) -> Exit {
    let lookup = CreativeKey::new(&args.subject, &args.campaign).and_then(|key| {
        match pipeline.ledger().get(&key) {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(StageError::NotFound {
                subject: key.subject().to_string(),
                campaign: key.campaign().to_string(),
            }),
            Err(e) => Err(StageError::from_ledger(e, None)),
        }
    });
    let record = match lookup {
        Ok(record) => record,
        Err(e) => return report_failure(&PipelineFailure::at(PipelineStage::Request, e)),
    };

    let quota = pipeline.quota();
    let remaining = Remaining {
        image: quota.remaining(Stage::Image, &record.stage_counts),
        audio: quota.remaining(Stage::Voice, &record.stage_counts),
        video: quota.remaining(Stage::Video, &record.stage_counts),
    };
    let limit = |left: Option<u32>| left.map_or_else(|| "unlimited".to_string(), |n| n.to_string());
    let message = format!(
        "{}/{} [{}]{}\nattempts: {}\nimage: {} used, {} left\naudio: {} used, {} left\nvideo: {} used, {} left",
        record.subject,
        record.campaign,
        record.kind,
        if record.is_final { " (final)" } else { "" },
        record.total_attempts,
        record.stage_counts.image,
        limit(remaining.image),
        record.stage_counts.audio,
        limit(remaining.audio),
        record.stage_counts.video,
        limit(remaining.video),
    );
    report_result(
        "creative.status",
        &message,
        &StatusReport {
            record: &record,
            remaining,
        },
    );
    Exit::Success
}

fn handle_history(command: HistoryCommands, pipeline: &Pipeline) -> Result<Exit> {
    let ledger = pipeline.ledger();
    match command {
        HistoryCommands::List { subject } => {
            let subject = subject.as_deref().map(normalize_subject);
            let records = ledger.list(subject.as_deref())?;
            if get_output_format() == OutputFormat::Json {
                emit(
                    Level::Info,
                    "creative.history.list",
                    &format!("{} records", records.len()),
                    Some(json!(records)),
                );
            } else if records.is_empty() {
                emit(Level::Info, "creative.history.list", "No attempts recorded", None);
            } else {
                println!("{}", history_table(&records));
            }
            Ok(Exit::Success)
        }
        HistoryCommands::Show { campaign, subject } => {
            let subject = subject.as_deref().map(normalize_subject);
            match ledger.find_campaign(&campaign, subject.as_deref())? {
                Some(record) => {
                    let message = serde_json::to_string_pretty(&record)?;
                    report_result("creative.history.show", &message, &record);
                    Ok(Exit::Success)
                }
                None => {
                    emit(
                        Level::Error,
                        "creative.history.not_found",
                        &format!("No campaign matching '{campaign}'"),
                        None,
                    );
                    Ok(Exit::Failed)
                }
            }
        }
        HistoryCommands::Export {
            subject,
            format,
            out,
        } => {
            let subject = subject.as_deref().map(normalize_subject);
            let records = ledger.list(subject.as_deref())?;
            let body = match format {
                ExportFormat::Json => {
                    serde_json::to_string_pretty(&records).context("serializing history")?
                }
                ExportFormat::Csv => history_csv(&records)?,
            };
            match out {
                Some(path) => {
                    write_export(&path, &body)?;
                    emit(
                        Level::Success,
                        "creative.history.export",
                        &format!("Exported {} records to {}", records.len(), path.display()),
                        Some(json!({ "path": path, "records": records.len() })),
                    );
                }
                None => println!("{body}"),
            }
            Ok(Exit::Success)
        }
    }
}

fn history_table(records: &[AttemptRecord]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Subject", "Campaign", "Kind", "Image", "Audio", "Video", "Attempts", "Final", "Created",
        ]);
    for record in records {
        table.add_row(vec![
            record.subject.clone(),
            record.campaign.clone(),
            record.kind.to_string(),
            record.stage_counts.image.to_string(),
            record.stage_counts.audio.to_string(),
            record.stage_counts.video.to_string(),
            record.total_attempts.to_string(),
            if record.is_final { "yes" } else { "no" }.to_string(),
            record.created_at.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }
    table
}

const EXPORT_FIELDS: [&str; 10] = [
    "userId",
    "promoName",
    "type",
    "attemptCount",
    "isFinal",
    "imagePath",
    "audioPath",
    "videoPath",
    "finalizedAt",
    "createdAt",
];

/// One CSV line per record, in `EXPORT_FIELDS` order.
#[derive(Serialize)]
struct ExportRow<'a> {
    subject: &'a str,
    campaign: &'a str,
    kind: CreativeKind,
    total_attempts: u32,
    is_final: bool,
    image_ref: Option<&'a str>,
    audio_ref: Option<&'a str>,
    video_ref: Option<&'a str>,
    finalized_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl<'a> From<&'a AttemptRecord> for ExportRow<'a> {
    fn from(record: &'a AttemptRecord) -> Self {
        Self {
            subject: &record.subject,
            campaign: &record.campaign,
            kind: record.kind,
            total_attempts: record.total_attempts,
            is_final: record.is_final,
            image_ref: record.image_ref.as_deref(),
            audio_ref: record.audio_ref.as_deref(),
            video_ref: record.video_ref.as_deref(),
            finalized_at: record.finalized_at,
            created_at: record.created_at,
        }
    }
}

fn history_csv(records: &[AttemptRecord]) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(EXPORT_FIELDS)?;
    for record in records {
        writer.serialize(ExportRow::from(record))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow!("finishing CSV export: {}", e.error()))?;
    String::from_utf8(bytes).context("CSV export is not valid UTF-8")
}

fn handle_assets(args: &AssetListArgs, pipeline: &Pipeline) -> Result<Exit> {
    let query = AssetQuery {
        subject: args.subject.clone(),
        stage: args.kind,
        campaign: args.campaign.clone(),
        search: args.search.clone(),
        page: args.page,
        limit: args.limit,
    };
    let page = pipeline.ledger().assets(&query)?;
    let summary = format!(
        "page {} of {} ({} assets)",
        page.page,
        page.pages.max(1),
        page.total
    );

    if get_output_format() == OutputFormat::Json {
        emit(Level::Info, "creative.assets.list", &summary, Some(json!(page)));
    } else if page.assets.is_empty() {
        emit(Level::Info, "creative.assets.list", "No assets found", None);
    } else {
        println!("{}", asset_table(&page, pipeline));
        emit(Level::Info, "creative.assets.list", &summary, None);
    }
    Ok(Exit::Success)
}

fn asset_table(page: &AssetPage, pipeline: &Pipeline) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Subject", "Campaign", "Stage", "Version", "Prompt", "URL", "Created",
        ]);
    for asset in &page.assets {
        table.add_row(vec![
            asset.subject.clone(),
            asset.campaign.clone(),
            asset.stage.to_string(),
            format!("v{}", asset.version),
            asset.prompt.clone(),
            pipeline
                .artifacts()
                .public_url(&ArtifactRef::new(asset.reference.clone())),
            asset.created_at.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }
    table
}

fn write_export(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating export directory {}", parent.display()))?;
    }
    fs::write(path, body).with_context(|| format!("writing export to {}", path.display()))
}

fn handle_sync_map(prompt: &str) -> Exit {
    let segments = build_sync_map(prompt);
    let mut message = segments
        .iter()
        .map(|s| format!("{:>2}  {:>6.2}s  +{:.2}s  {}", s.index, s.start_time, s.duration, s.text))
        .collect::<Vec<_>>()
        .join("\n");
    if segments.is_empty() {
        message = "Prompt has no sentences".to_string();
    }
    emit(
        Level::Info,
        "creative.sync_map",
        &format!("{message}\ntotal: {:.2}s", total_duration(&segments)),
        Some(json!(segments)),
    );
    Exit::Success
}

fn handle_config(command: ConfigCommands, path: &Path) -> Result<Exit> {
    match command {
        ConfigCommands::Show => {
            let config = AppConfig::load_with_env(path)?;
            let mut shown = config.clone();
            redact(&mut shown.openai.api_key);
            redact(&mut shown.elevenlabs.api_key);
            let body = toml::to_string_pretty(&shown).context("serializing config")?;
            emit(
                Level::Info,
                "config.show",
                &format!("# {}\n{}", path.display(), body),
                Some(json!({ "path": path, "config": shown })),
            );
            Ok(Exit::Success)
        }
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                emit(
                    Level::Warn,
                    "config.init.exists",
                    &format!("{} already exists; pass --force to overwrite", path.display()),
                    None,
                );
                return Ok(Exit::Conflict);
            }
            AppConfig::default().save_to_path(path)?;
            emit(
                Level::Success,
                "config.init",
                &format!("Wrote default config to {}", path.display()),
                None,
            );
            Ok(Exit::Success)
        }
    }
}

fn redact(key: &mut Option<String>) {
    if key.is_some() {
        *key = Some("********".to_string());
    }
}
