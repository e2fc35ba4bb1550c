//! Replaces the events of a yearly calendar with the slots of a schedule.
//!
//! Every step talks to the service through [`CalendarService`] and completes before the next one
//! starts, so the purge is always finished before the first event is created.

use crate::calendar::google::models::{
    AclRule, Calendar, Creator, EventDateTime, ExtendedProperties, NewEvent,
};
use crate::calendar::{collect_pages, paginate, CalendarService};
use crate::schedule::Slot;
use crate::{CalendarConfig, Error, Result};
use futures::TryStreamExt;
use indexmap::IndexMap;
use std::future::Future;
use url::Url;

/// Page embedding a public Google calendar.
pub const EMBED_URL: &str = "https://calendar.google.com/calendar/embed";

/// What a run will do to the calendar of `year`, computed without contacting the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub year: i32,
    /// Name of the calendar to fill.
    pub calendar_name: String,
    /// Number of slots found in the schedule.
    pub slots_read: usize,
    /// Slots starting in another year.
    pub slots_other_years: usize,
    /// Slots of `year` whose end time cannot be represented.
    pub slots_out_of_range: usize,
    /// One event per remaining slot, in schedule order.
    pub events: Vec<NewEvent>,
}

/// Result of [`run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing was sent; the plan was only logged.
    DryRun(SyncPlan),
    Synced(SyncReport),
}

/// Outcome of a synchronization run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Id of the synchronized calendar.
    pub calendar_id: String,
    /// Whether the calendar had to be created.
    pub calendar_created: bool,
    /// Id of the public read rule, as returned by the service.
    pub acl_rule_id: Option<String>,
    /// Number of events removed before recreating them.
    pub events_deleted: usize,
    /// Number of slots found in the schedule.
    pub slots_read: usize,
    /// Slots starting in another year.
    pub slots_other_years: usize,
    /// Slots of the year whose end time cannot be represented.
    pub slots_out_of_range: usize,
    /// Number of events created.
    pub events_created: usize,
}

/// Link to the public page of a calendar. The id is percent-encoded.
pub fn embed_url(calendar_id: &str) -> Result<Url, url::ParseError> {
    Url::parse_with_params(EMBED_URL, &[("src", calendar_id)])
}

/// A calendar looked up by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCalendar {
    pub calendar: Calendar,
    /// `true` if no calendar had the name and a new one was created.
    pub created: bool,
}

/// Returns the first accessible calendar named exactly `name`. Stops listing at the first match.
pub async fn find_calendar<S>(service: &S, name: &str) -> Result<Option<Calendar>>
where
    S: CalendarService + ?Sized,
{
    let calendars = paginate(|page_token| service.list_calendars(page_token));
    let mut calendars = std::pin::pin!(calendars);

    while let Some(calendar) = calendars.try_next().await? {
        if calendar.summary == name {
            return Ok(Some(calendar));
        }
    }

    Ok(None)
}

/// Finds the calendar of `year`, creating it if there is none.
pub async fn resolve_calendar<S>(
    service: &S,
    config: &CalendarConfig,
    year: i32,
) -> Result<ResolvedCalendar>
where
    S: CalendarService + ?Sized,
{
    let name = config.calendar_name(year);

    if let Some(calendar) = find_calendar(service, &name).await? {
        log::info!("found calendar {:?}", name);
        return Ok(ResolvedCalendar {
            calendar,
            created: false,
        });
    }

    log::info!("calendar {:?} not found, creating it", name);
    let calendar = service
        .create_calendar(&name, config.time_zone.name())
        .await?;

    Ok(ResolvedCalendar {
        calendar,
        created: true,
    })
}

/// Lets anyone read the calendar. The rule is inserted on every call.
pub async fn grant_public_read<S>(service: &S, calendar_id: &str) -> Result<AclRule>
where
    S: CalendarService + ?Sized,
{
    let rule = service
        .insert_acl_rule(calendar_id, &AclRule::public_reader())
        .await?;

    log::info!(
        "public read access granted, rule id: {}",
        rule.id.as_deref().unwrap_or("<none>")
    );

    Ok(rule)
}

/// Deletes every event of the calendar. Returns the number of deleted events.
pub async fn purge_events<S>(service: &S, calendar_id: &str) -> Result<usize>
where
    S: CalendarService + ?Sized,
{
    let events = collect_pages(|page_token| service.list_events(calendar_id, page_token)).await?;

    if events.is_empty() {
        log::info!("calendar has no events to remove");
        return Ok(0);
    }

    log::info!("resetting calendar, removing {} events", events.len());

    let event_ids: Vec<String> = events.into_iter().map(|event| event.id).collect();
    service.delete_events(calendar_id, &event_ids).await?;

    Ok(event_ids.len())
}

/// Slug of an author name as used in photo file names: `"Ana Paula"` becomes `"ana_paula"`.
pub fn author_slug(author: &str) -> String {
    slug::slugify(author).replace('-', "_")
}

/// The slot's photo URL, or one derived from its author, or an empty string.
pub fn photo_url(slot: &Slot, config: &CalendarConfig) -> String {
    if let Some(photo_url) = &slot.photo_url {
        return photo_url.clone();
    }

    match slot.author.as_deref().map(author_slug) {
        Some(slug) if !slug.is_empty() => config.photo_url(&slug),
        _ => String::new(),
    }
}

/// Turns a slot into an event. Returns `None` if the end of the slot cannot be represented.
pub fn build_event(slot: &Slot, config: &CalendarConfig, year: i32) -> Option<NewEvent> {
    let end_at = slot.end_at()?;
    let photo_url = photo_url(slot, config);
    let text = |value: &Option<String>| value.clone().unwrap_or_default();

    // Consumed by the other event tools; calendar UIs don't show these.
    let private = IndexMap::from([
        ("title".to_owned(), slot.name.clone()),
        ("author".to_owned(), text(&slot.author)),
        ("category".to_owned(), text(&slot.category)),
        ("type".to_owned(), text(&slot.kind)),
        ("photo_url".to_owned(), photo_url),
        ("discord_channel".to_owned(), text(&slot.discord_channel)),
        ("youtube_channel".to_owned(), text(&slot.youtube_channel)),
    ]);

    Some(NewEvent {
        summary: slot.name.clone(),
        description: text(&slot.description),
        start: EventDateTime {
            date_time: slot.start_at.to_string(),
            time_zone: config.time_zone,
        },
        end: EventDateTime {
            date_time: end_at.to_string(),
            time_zone: config.time_zone,
        },
        location: text(&slot.room),
        creator: Creator {
            display_name: config.creator_name(year),
            email: config.creator_email.clone(),
        },
        extended_properties: ExtendedProperties { private },
    })
}

/// Builds the events of the slots starting in `year`, keeping the order of `slots`.
pub fn plan(slots: &[Slot], config: &CalendarConfig, year: i32) -> SyncPlan {
    let mut slots_other_years = 0;
    let mut slots_out_of_range = 0;
    let mut events = Vec::new();

    for slot in slots {
        if slot.start_at.year() != year {
            slots_other_years += 1;
            continue;
        }

        match build_event(slot, config, year) {
            Some(event) => events.push(event),
            None => {
                log::warn!("skipping {:?}: end time out of range", slot.name);
                slots_out_of_range += 1;
            }
        }
    }

    log::info!("{} of {} slots are scheduled for {}", events.len(), slots.len(), year);

    SyncPlan {
        year,
        calendar_name: config.calendar_name(year),
        slots_read: slots.len(),
        slots_other_years,
        slots_out_of_range,
        events,
    }
}

/// Logs the payload of every planned event.
pub fn log_plan(plan: &SyncPlan) -> Result<()> {
    log::info!(
        "dry run: would replace the events of {:?} with {} events",
        plan.calendar_name,
        plan.events.len()
    );

    for event in &plan.events {
        log::info!("{}", serde_json::to_string_pretty(event)?);
    }

    Ok(())
}

/// Creates `events` in the calendar. Returns the number of created events.
pub async fn create_events<S>(service: &S, calendar_id: &str, events: &[NewEvent]) -> Result<usize>
where
    S: CalendarService + ?Sized,
{
    if events.is_empty() {
        log::info!("no events to create");
        return Ok(0);
    }

    for event in events {
        log::info!("creating event {:?}", event.summary);
    }

    service.insert_events(calendar_id, events).await?;

    Ok(events.len())
}

/// Makes the planned calendar hold exactly the planned events.
pub async fn apply<S>(service: &S, config: &CalendarConfig, plan: &SyncPlan) -> Result<SyncReport>
where
    S: CalendarService + ?Sized,
{
    let resolved = resolve_calendar(service, config, plan.year).await?;
    let calendar_id = resolved.calendar.id;
    log::info!("calendar id: {}", calendar_id);

    let rule = grant_public_read(service, &calendar_id).await?;
    let events_deleted = purge_events(service, &calendar_id).await?;
    let events_created = create_events(service, &calendar_id, &plan.events).await?;

    Ok(SyncReport {
        calendar_id,
        calendar_created: resolved.created,
        acl_rule_id: rule.id,
        events_deleted,
        slots_read: plan.slots_read,
        slots_other_years: plan.slots_other_years,
        slots_out_of_range: plan.slots_out_of_range,
        events_created,
    })
}

/// Makes the calendar of `year` hold exactly one event per slot of that year.
pub async fn sync<S>(
    service: &S,
    config: &CalendarConfig,
    slots: &[Slot],
    year: i32,
) -> Result<SyncReport>
where
    S: CalendarService + ?Sized,
{
    apply(service, config, &plan(slots, config, year)).await
}

/// Plans the run for `year` and applies it to the service returned by `connect`.
///
/// With `dry_run` set, the plan is only logged and `connect` is never called.
pub async fn run<S, F, Fut, E>(
    connect: F,
    config: &CalendarConfig,
    slots: &[Slot],
    year: i32,
    dry_run: bool,
) -> Result<RunOutcome>
where
    S: CalendarService,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<S, E>>,
    Error: From<E>,
{
    let plan = plan(slots, config, year);

    if dry_run {
        log_plan(&plan)?;
        return Ok(RunOutcome::DryRun(plan));
    }

    let service = connect().await?;
    let report = apply(&service, config, &plan).await?;

    Ok(RunOutcome::Synced(report))
}
