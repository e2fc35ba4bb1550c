use anyhow::Context;
use calendaryo::calendar::google::GoogleCalendarClient;
use calendaryo::sync::{self, RunOutcome};
use calendaryo::{schedule, AppConfig};
use chrono::{Datelike, Utc};
use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the service account key file
    #[arg(long, value_name = "FILE", env = "GOOGLE_API_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Directory scanned recursively for schedule files
    #[arg(
        long,
        value_name = "DIR",
        env = "CONFERENCES_PATH",
        default_value = "conferencias"
    )]
    conferences_path: PathBuf,

    /// Year to synchronize instead of the current one
    #[arg(long, value_name = "YYYY")]
    year: Option<i32>,

    /// Print the events that would be created without touching the calendar
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    // Progress lines are part of the console output, so they go to stdout.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load().context("failed to load configuration")?;

    let year = cli
        .year
        .unwrap_or_else(|| Utc::now().with_timezone(&config.calendar.time_zone).year());

    log::info!("loading schedule from {}", cli.conferences_path.display());
    let slots = schedule::load_slots(&cli.conferences_path).with_context(|| {
        format!("failed to load schedule from {}", cli.conferences_path.display())
    })?;

    let connect = || GoogleCalendarClient::new(&config.google, cli.credentials.as_deref());
    let outcome = sync::run(connect, &config.calendar, &slots, year, cli.dry_run)
        .await
        .context("calendar synchronization failed")?;

    let RunOutcome::Synced(report) = outcome else {
        return Ok(());
    };

    log::info!(
        "created {} events, removed {} old events, skipped {} slots of other years and {} slots \
         ending out of range",
        report.events_created,
        report.events_deleted,
        report.slots_other_years,
        report.slots_out_of_range
    );

    println!("Calendar ID: {}", report.calendar_id);
    println!("Embed URL: {}", sync::embed_url(&report.calendar_id)?);

    Ok(())
}
