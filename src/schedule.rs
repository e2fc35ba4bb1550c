//! Schedule files.
//!
//! A schedule is a directory tree of TOML files. Every file may hold any number of `[[slot]]`
//! tables, each describing one talk or activity:
//!
//! ```toml
//! [[slot]]
//! start_at = 2019-10-23T09:00:00
//! duration = 45
//! name = "Keynote"
//! author = "Ana Paula"
//! room = "Auditório"
//! ```

use crate::{Error, Result};
use chrono::{Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use toml::value::{Datetime, Offset};

/// Extension of schedule files.
pub const SCHEDULE_EXTENSION: &str = "toml";

/// Start of a slot: a wall-clock date and time, with the UTC offset if the file states one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTime {
    local: NaiveDateTime,
    offset: Option<FixedOffset>,
}

impl SlotTime {
    /// A wall-clock time to be read in the calendar's time zone.
    pub fn local(local: NaiveDateTime) -> SlotTime {
        SlotTime {
            local,
            offset: None,
        }
    }

    /// A wall-clock time at a fixed UTC offset.
    pub fn with_offset(local: NaiveDateTime, offset: FixedOffset) -> SlotTime {
        SlotTime {
            local,
            offset: Some(offset),
        }
    }

    pub fn naive(&self) -> NaiveDateTime {
        self.local
    }

    pub fn offset(&self) -> Option<FixedOffset> {
        self.offset
    }

    /// Year of the wall-clock date as written in the schedule.
    pub fn year(&self) -> i32 {
        self.local.year()
    }

    /// Returns this time moved forward by `minutes`, keeping the offset.
    pub fn plus_minutes(&self, minutes: u32) -> Option<SlotTime> {
        let local = self
            .local
            .checked_add_signed(Duration::minutes(i64::from(minutes)))?;

        Some(SlotTime { local, ..*self })
    }
}

impl fmt::Display for SlotTime {
    /// RFC 3339 date-time. The offset is omitted for local times.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.offset {
            Some(offset) => {
                let time = self.local.and_local_timezone(offset).single().ok_or(fmt::Error)?;
                write!(f, "{}", time.format("%Y-%m-%dT%H:%M:%S%:z"))
            }
            None => write!(f, "{}", self.local.format("%Y-%m-%dT%H:%M:%S")),
        }
    }
}

impl TryFrom<Datetime> for SlotTime {
    type Error = String;

    fn try_from(datetime: Datetime) -> Result<Self, Self::Error> {
        let (Some(date), Some(time)) = (datetime.date, datetime.time) else {
            return Err(format!("`{datetime}` must have both a date and a time"));
        };

        let date = NaiveDate::from_ymd_opt(
            i32::from(date.year),
            u32::from(date.month),
            u32::from(date.day),
        )
        .ok_or_else(|| format!("`{datetime}` is not a valid date"))?;
        let time = NaiveTime::from_hms_nano_opt(
            u32::from(time.hour),
            u32::from(time.minute),
            u32::from(time.second),
            time.nanosecond,
        )
        .ok_or_else(|| format!("`{datetime}` is not a valid time"))?;
        let local = NaiveDateTime::new(date, time);

        let offset_seconds = match datetime.offset {
            None => return Ok(SlotTime::local(local)),
            Some(Offset::Z) => 0,
            Some(Offset::Custom { minutes }) => i32::from(minutes) * 60,
        };

        FixedOffset::east_opt(offset_seconds)
            .map(|offset| SlotTime::with_offset(local, offset))
            .ok_or_else(|| format!("`{datetime}` has an invalid offset"))
    }
}

impl<'de> Deserialize<'de> for SlotTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let datetime = Datetime::deserialize(deserializer)?;
        SlotTime::try_from(datetime).map_err(serde::de::Error::custom)
    }
}

/// A scheduled talk or activity.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub start_at: SlotTime,
    /// Length in minutes.
    pub duration: u32,
    pub name: String,
    #[serde(default, deserialize_with = "non_empty")]
    pub author: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub photo_url: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub room: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "non_empty")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "string_or_integer")]
    pub discord_channel: Option<String>,
    #[serde(default, deserialize_with = "string_or_integer")]
    pub youtube_channel: Option<String>,
}

impl Slot {
    /// Returns the end of the slot, `None` if it falls outside the supported date range.
    pub fn end_at(&self) -> Option<SlotTime> {
        self.start_at.plus_minutes(self.duration)
    }
}

#[derive(Deserialize, Debug, Default)]
struct ScheduleFile {
    #[serde(default)]
    slot: Vec<Slot>,
}

fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|value| !value.is_empty()))
}

// Channel ids are often written as bare numbers.
fn string_or_integer<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Channel {
        Text(String),
        Number(i64),
    }

    let value = Option::<Channel>::deserialize(deserializer)?.map(|channel| match channel {
        Channel::Text(text) => text,
        Channel::Number(number) => number.to_string(),
    });

    Ok(value.filter(|value| !value.is_empty()))
}

/// Parses the slots of one schedule file. `path` is only used in errors.
pub fn parse_slots(path: &Path, content: &str) -> Result<Vec<Slot>> {
    let file: ScheduleFile = toml::from_str(content).map_err(|source| Error::ParseSchedule {
        path: path.to_owned(),
        source,
    })?;

    Ok(file.slot)
}

/// Finds all schedule files below `root`.
///
/// Files of a directory come first, sorted by name, followed by its subdirectories, sorted by
/// name and visited recursively. Symlinked directories are not followed.
pub fn discover_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(Error::ScheduleRoot(root.to_owned()));
    }

    let mut files = Vec::new();
    collect_files(root, &mut files)?;
    Ok(files)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut subdirs = Vec::new();

    for entry in entries {
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            subdirs.push(path);
        } else if path.is_file()
            && path.extension().and_then(|ext| ext.to_str()) == Some(SCHEDULE_EXTENSION)
        {
            files.push(path);
        }
    }

    for subdir in subdirs {
        collect_files(&subdir, files)?;
    }

    Ok(())
}

/// Reads the slots of every schedule file below `root`, in discovery order.
pub fn load_slots(root: &Path) -> Result<Vec<Slot>> {
    let mut slots = Vec::new();

    for path in discover_files(root)? {
        log::info!("reading schedule file {}", path.display());

        let content = fs::read_to_string(&path).map_err(|source| Error::ReadSchedule {
            path: path.clone(),
            source,
        })?;

        slots.extend(parse_slots(&path, &content)?);
    }

    log::info!("found {} slots", slots.len());

    Ok(slots)
}
