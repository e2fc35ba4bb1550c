pub mod google;

use crate::Result;
use async_trait::async_trait;
use futures::stream::{self, Stream, TryStreamExt};
use google::GoogleCalendarClient;
use google::models::{AclRule, Calendar, Event, NewEvent};
use std::future::Future;

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Items of this page.
    pub items: Vec<T>,
    /// Continuation token for the next page, `None` on the last page.
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    /// Creates a new `Page`. An empty continuation token marks the last page, same as none.
    pub fn new(items: Vec<T>, next_page_token: Option<String>) -> Page<T> {
        Page {
            items,
            next_page_token: next_page_token.filter(|token| !token.is_empty()),
        }
    }
}

/// Lazily yields the items of every page produced by `fetch`.
///
/// `fetch` is first called without a token, then with each continuation token returned. The
/// stream ends after the first page without a continuation token, or at the first error.
pub fn paginate<'a, T, E, F, Fut>(fetch: F) -> impl Stream<Item = Result<T, E>> + 'a
where
    T: 'a,
    E: 'a,
    F: FnMut(Option<String>) -> Fut + 'a,
    Fut: Future<Output = Result<Page<T>, E>> + 'a,
{
    // `Some(token)` while there is a page left to fetch.
    let start: Option<Option<String>> = Some(None);

    stream::try_unfold((fetch, start), |(mut fetch, next)| async move {
        let Some(page_token) = next else {
            return Ok(None);
        };

        fetch(page_token).await.map(|page| {
            let next = page.next_page_token.map(Some);
            let items = stream::iter(page.items.into_iter().map(Ok));
            Some((items, (fetch, next)))
        })
    })
    .try_flatten()
}

/// Collects the items of all pages produced by `fetch`, in order.
pub async fn collect_pages<T, E, F, Fut>(fetch: F) -> Result<Vec<T>, E>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    paginate(fetch).try_collect().await
}

/// The operations of a remote calendar service needed to synchronize a calendar.
#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Fetches one page of the calendars accessible to the credential.
    async fn list_calendars(&self, page_token: Option<String>) -> Result<Page<Calendar>>;

    /// Creates a new calendar.
    async fn create_calendar(&self, summary: &str, time_zone: &str) -> Result<Calendar>;

    /// Adds an access control rule to a calendar and returns the stored rule.
    async fn insert_acl_rule(&self, calendar_id: &str, rule: &AclRule) -> Result<AclRule>;

    /// Fetches one page of the events of a calendar.
    async fn list_events(
        &self,
        calendar_id: &str,
        page_token: Option<String>,
    ) -> Result<Page<Event>>;

    /// Deletes events in bulk.
    async fn delete_events(&self, calendar_id: &str, event_ids: &[String]) -> Result<()>;

    /// Creates events in bulk.
    async fn insert_events(&self, calendar_id: &str, events: &[NewEvent]) -> Result<()>;
}

#[async_trait]
impl CalendarService for GoogleCalendarClient {
    async fn list_calendars(&self, page_token: Option<String>) -> Result<Page<Calendar>> {
        Ok(GoogleCalendarClient::list_calendars(self, page_token).await?)
    }

    async fn create_calendar(&self, summary: &str, time_zone: &str) -> Result<Calendar> {
        Ok(GoogleCalendarClient::create_calendar(self, summary, time_zone).await?)
    }

    async fn insert_acl_rule(&self, calendar_id: &str, rule: &AclRule) -> Result<AclRule> {
        Ok(GoogleCalendarClient::insert_acl_rule(self, calendar_id, rule).await?)
    }

    async fn list_events(
        &self,
        calendar_id: &str,
        page_token: Option<String>,
    ) -> Result<Page<Event>> {
        Ok(GoogleCalendarClient::list_events(self, calendar_id, page_token).await?)
    }

    async fn delete_events(&self, calendar_id: &str, event_ids: &[String]) -> Result<()> {
        Ok(GoogleCalendarClient::delete_events(self, calendar_id, event_ids).await?)
    }

    async fn insert_events(&self, calendar_id: &str, events: &[NewEvent]) -> Result<()> {
        Ok(GoogleCalendarClient::insert_events(self, calendar_id, events).await?)
    }
}
