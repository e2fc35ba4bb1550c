use chrono_tz::Tz;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub mod calendar;
pub mod schedule;
pub mod sync;

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by all fallible operations within this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("schedule directory `{}` does not exist or is not a directory", .0.display())]
    ScheduleRoot(PathBuf),
    #[error("failed to read `{}`: {source}", path.display())]
    ReadSchedule {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse `{}`: {source}", path.display())]
    ParseSchedule {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("calendar client error: {0}")]
    Client(#[from] calendar::google::ClientError),
}

/// Calendar and event presentation settings.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct CalendarConfig {
    /// Name of the target calendar. `{year}` is replaced with the synced year.
    pub name_template: String,
    /// Time zone attached to every event and to newly created calendars.
    pub time_zone: Tz,
    /// Display name of the event creator. `{year}` is replaced with the synced year.
    pub creator_name_template: String,
    /// Email of the event creator.
    pub creator_email: String,
    /// Speaker photo URL used when a slot has none. `{slug}` is replaced with the author slug.
    pub photo_url_template: String,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        CalendarConfig {
            name_template: "Python Brasil {year} - Grade".into(),
            time_zone: chrono_tz::America::Sao_Paulo,
            creator_name_template: "Python Brasil {year}".into(),
            creator_email: "eventos@python.org.br".into(),
            photo_url_template: "https://2019.pythonbrasil.org.br/assets/images/fotos/{slug}.jpeg"
                .into(),
        }
    }
}

impl CalendarConfig {
    /// Returns the calendar name for `year`.
    pub fn calendar_name(&self, year: i32) -> String {
        self.name_template.replace("{year}", &year.to_string())
    }

    /// Returns the creator display name for `year`.
    pub fn creator_name(&self, year: i32) -> String {
        self.creator_name_template.replace("{year}", &year.to_string())
    }

    /// Returns the photo URL for an author slug.
    pub fn photo_url(&self, slug: &str) -> String {
        self.photo_url_template.replace("{slug}", slug)
    }
}

/// Google Calendar API settings.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct GoogleConfig {
    /// Root of the Google APIs, e.g. `https://www.googleapis.com/`.
    pub api_base_url: String,
    /// Maximum number of sub-requests sent in one batch call.
    pub batch_size: usize,
    /// Number of results requested per listing page; the service default when unset.
    pub page_size: Option<u32>,
    /// Timeout for every HTTP request, in seconds.
    pub timeout_secs: u64,
}

/// Google rejects batch calls with more sub-requests than this.
pub const MAX_BATCH_SIZE: usize = 1000;

impl Default for GoogleConfig {
    fn default() -> Self {
        GoogleConfig {
            api_base_url: "https://www.googleapis.com/".into(),
            batch_size: MAX_BATCH_SIZE,
            page_size: None,
            timeout_secs: 30,
        }
    }
}

// `CALENDARYO_GOOGLE__BATCH_SIZE` sets `google.batch_size`.
fn environment() -> Environment {
    Environment::with_prefix("CALENDARYO")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// Global application configuration.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Calendar configuration section.
    pub calendar: CalendarConfig,
    /// Google API configuration section.
    pub google: GoogleConfig,
}

impl AppConfig {
    /// Loads the application configuration from files in the `config/` directory and environment
    /// variables. Every source is optional; missing values fall back to the built-in defaults.
    pub fn load() -> Result<AppConfig> {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".into());

        log::debug!("loading configuration using {} environment", app_env);

        let builder = Config::builder()
            // Configuration defaults from `config/default.toml`.
            .add_source(File::with_name("config/default").required(false))
            // Optional environment specific config overrides, e.g. `config/production.toml`.
            .add_source(File::with_name(&format!("config/{}", app_env)).required(false))
            // Optional local config overrides from `config/local.toml` (on .gitignore).
            .add_source(File::with_name("config/local").required(false))
            // Config from environment variables prefixed with `CALENDARYO_`.
            .add_source(environment());

        AppConfig::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<AppConfig> {
        let config: AppConfig = builder.build()?.try_deserialize()?;

        config.validate()?;

        log::debug!("loaded configuration: {:?}", config);

        Ok(config)
    }

    /// Checks values that deserialize fine but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.google.batch_size) {
            return Err(ConfigError::Message(format!(
                "google.batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.google.batch_size
            )));
        }

        if self.google.page_size == Some(0) {
            return Err(ConfigError::Message(
                "google.page_size must be greater than zero".into(),
            ));
        }

        if self.google.timeout_secs == 0 {
            return Err(ConfigError::Message(
                "google.timeout_secs must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
