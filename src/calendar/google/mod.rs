mod batch;
pub mod models;

use self::batch::{BatchPart, BatchRequest};
use super::Page;
use crate::GoogleConfig;
use async_trait::async_trait;
use google_cloud_auth::credentials::CredentialsFile;
use google_cloud_auth::token::DefaultTokenSourceProvider;
use google_cloud_token::{TokenSource, TokenSourceProvider};
use http::Extensions;
use indexmap::IndexMap;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Request, Response, StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// OAuth scope granting read/write access to calendars, ACLs and events.
pub const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Error while authenticating with google.
    #[error("failed to authenticate: {0}")]
    GCloudAuth(#[from] google_cloud_auth::error::Error),

    /// Error while making a http request.
    #[error("failure requesting remote resource: {0}")]
    Request(#[from] reqwest::Error),

    /// Error while executing some middleware code.
    #[error("request middleware failed with: {0}")]
    RequestMiddleware(#[from] reqwest_middleware::Error),

    /// Error while building http headers.
    #[error("encountered invalid HTTP header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    /// Error while parsing a JSON response.
    #[error("failed to parse response as JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Error while obtaining an authentication token.
    #[error("failed to obtain authentication token: {0}")]
    Token(String),

    /// The configured API base URL cannot be used.
    #[error("invalid API base URL `{0}`")]
    Url(String),

    /// The API answered with a non-success status.
    #[error("calendar API responded with {status}: {message}")]
    Api { status: StatusCode, message: String },

    /// Some requests of a batch were rejected.
    #[error("{failed} of {total} batched requests failed, first error: {message}")]
    Batch {
        failed: usize,
        total: usize,
        message: String,
    },

    /// The batch response could not be matched with the request.
    #[error("malformed batch response: {0}")]
    MalformedBatch(String),
}

impl From<ClientError> for reqwest_middleware::Error {
    fn from(err: ClientError) -> Self {
        reqwest_middleware::Error::Middleware(anyhow::Error::new(err))
    }
}

struct AuthMiddleware {
    token_source: Arc<dyn TokenSource>,
}

impl AuthMiddleware {
    fn new(token_source: Arc<dyn TokenSource>) -> AuthMiddleware {
        AuthMiddleware { token_source }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let token = self
            .token_source
            .token()
            .await
            .map_err(|err| ClientError::Token(err.to_string()))?;

        let mut header = HeaderValue::try_from(token).map_err(ClientError::from)?;
        header.set_sensitive(true);
        req.headers_mut().insert(AUTHORIZATION, header);
        next.run(req, extensions).await
    }
}

/// Google calendar client for making requests to the google calendar api
#[derive(Debug)]
pub struct GoogleCalendarClient {
    client: ClientWithMiddleware,
    base_url: Url,
    batch_size: usize,
    page_size: Option<u32>,
}

impl GoogleCalendarClient {
    /// Creates a new google calendar client authenticated as a service account.
    ///
    /// With `credentials` set, the service account key is read from that JSON key file.
    /// Otherwise the credentials are looked up the default way: the
    /// GOOGLE_APPLICATION_CREDENTIALS variable pointing to the key file generated in the google
    /// cloud console, or the GOOGLE_APPLICATION_CREDENTIALS_JSON variable containing the content
    /// of said file.
    pub async fn new(
        config: &GoogleConfig,
        credentials: Option<&Path>,
    ) -> Result<GoogleCalendarClient, ClientError> {
        let scopes = [CALENDAR_SCOPE];
        let auth_config = google_cloud_auth::project::Config::default().with_scopes(&scopes);

        let provider = match credentials {
            Some(path) => {
                log::debug!("reading service account key from {}", path.display());
                let file = CredentialsFile::new_from_file(path.to_string_lossy().into_owned())
                    .await?;
                DefaultTokenSourceProvider::new_with_credentials(auth_config, Box::new(file))
                    .await?
            }
            None => DefaultTokenSourceProvider::new(auth_config).await?,
        };

        GoogleCalendarClient::with_token_source(config, provider.token_source())
    }

    /// Creates a client that authorizes every request with tokens from `token_source`.
    pub fn with_token_source(
        config: &GoogleConfig,
        token_source: Arc<dyn TokenSource>,
    ) -> Result<GoogleCalendarClient, ClientError> {
        let base_url = Url::parse(&config.api_base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| ClientError::Url(config.api_base_url.clone()))?;

        let client = ClientBuilder::new(
            reqwest::Client::builder()
                .gzip(true)
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        )
        .with(AuthMiddleware::new(token_source))
        .build();

        Ok(GoogleCalendarClient {
            client,
            base_url,
            batch_size: config.batch_size.max(1),
            page_size: config.page_size,
        })
    }

    /// Builds an endpoint URL from raw path segments. Segments are percent-encoded, so calendar
    /// ids like `abc@group.calendar.google.com` are safe to pass.
    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn events_url(&self, calendar_id: &str) -> Result<Url, ClientError> {
        self.url(&["calendar", "v3", "calendars", calendar_id, "events"])
    }

    /// Sends `parts` in batches of at most `batch_size` requests. Every embedded response is
    /// checked; responses with a status in `tolerated` count as success.
    async fn execute_batches(
        &self,
        parts: Vec<BatchPart>,
        tolerated: &[StatusCode],
    ) -> Result<(), ClientError> {
        let total = parts.len();
        let mut failed = 0;
        let mut first_error = None;

        for (chunk_index, chunk) in parts.chunks(self.batch_size).enumerate() {
            let offset = chunk_index * self.batch_size;
            let request = BatchRequest::new(chunk.to_vec());

            let response = self
                .client
                .post(self.url(&["batch", "calendar", "v3"])?)
                .header(CONTENT_TYPE, request.content_type())
                .body(request.body())
                .send()
                .await?;
            let response = error_for_status(response).await?;

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_owned();
            let body = response.text().await?;

            for item in batch::parse_response(&content_type, &body, request.len())? {
                let tolerated = tolerated.iter().any(|status| status.as_u16() == item.status);
                if item.is_success() || tolerated {
                    continue;
                }

                let message = format!("{} ({})", api_error_message(&item.body), item.status);
                log::warn!("batched request #{} failed: {message}", offset + item.index);
                failed += 1;
                first_error.get_or_insert(message);
            }

            log::debug!("executed batch of {} requests", request.len());
        }

        match first_error {
            Some(message) => Err(ClientError::Batch {
                failed,
                total,
                message,
            }),
            None => Ok(()),
        }
    }
}

impl GoogleCalendarClient {
    /// Fetches one page of the calendars the credential has access to.
    pub async fn list_calendars(
        &self,
        page_token: Option<String>,
    ) -> Result<Page<models::Calendar>, ClientError> {
        let query = build_query_parameters(&self.page_size, &page_token);

        let response = self
            .client
            .get(self.url(&["calendar", "v3", "users", "me", "calendarList"])?)
            .query(&query)
            .send()
            .await?;

        let calendars = error_for_status(response)
            .await?
            .json::<models::CalendarList>()
            .await?;

        log::debug!("fetched {} calendars", calendars.items.len());

        Ok(Page::new(calendars.items, calendars.next_page_token))
    }

    pub async fn create_calendar(
        &self,
        summary: &str,
        time_zone: &str,
    ) -> Result<models::Calendar, ClientError> {
        let response = self
            .client
            .post(self.url(&["calendar", "v3", "calendars"])?)
            .json(&models::NewCalendar { summary, time_zone })
            .send()
            .await?;

        Ok(error_for_status(response).await?.json().await?)
    }

    pub async fn insert_acl_rule(
        &self,
        calendar_id: &str,
        rule: &models::AclRule,
    ) -> Result<models::AclRule, ClientError> {
        let response = self
            .client
            .post(self.url(&["calendar", "v3", "calendars", calendar_id, "acl"])?)
            .json(rule)
            .send()
            .await?;

        Ok(error_for_status(response).await?.json().await?)
    }

    pub async fn list_events(
        &self,
        calendar_id: &str,
        page_token: Option<String>,
    ) -> Result<Page<models::Event>, ClientError> {
        let query = build_query_parameters(&self.page_size, &page_token);

        let response = self
            .client
            .get(self.events_url(calendar_id)?)
            .query(&query)
            .send()
            .await?;

        let events = error_for_status(response)
            .await?
            .json::<models::Events>()
            .await?;

        log::debug!("fetched {} events from Google Calendar", events.items.len());

        Ok(Page::new(events.items, events.next_page_token))
    }

    /// Deletes events by id, notifying their attendees.
    pub async fn delete_events(
        &self,
        calendar_id: &str,
        event_ids: &[String],
    ) -> Result<(), ClientError> {
        let mut parts = Vec::with_capacity(event_ids.len());

        for event_id in event_ids {
            let mut url = self.events_url(calendar_id)?;
            url.path_segments_mut()
                .map_err(|_| ClientError::Url(self.base_url.to_string()))?
                .push(event_id);
            // Notify attendees about the removal.
            url.query_pairs_mut().append_pair("sendUpdates", "all");

            parts.push(BatchPart::new(Method::DELETE, path_and_query(&url)));
        }

        // An event that is already gone needs no deleting.
        self.execute_batches(parts, &[StatusCode::GONE]).await
    }

    pub async fn insert_events(
        &self,
        calendar_id: &str,
        events: &[models::NewEvent],
    ) -> Result<(), ClientError> {
        let path = path_and_query(&self.events_url(calendar_id)?);

        let parts = events
            .iter()
            .map(|event| -> Result<BatchPart, ClientError> {
                Ok(BatchPart::new(Method::POST, path.clone())
                    .with_json_body(serde_json::to_string(event)?))
            })
            .collect::<Result<Vec<_>, ClientError>>()?;

        self.execute_batches(parts, &[]).await
    }
}

fn build_query_parameters(
    event_count: &Option<u32>,
    next_page_token: &Option<String>,
) -> IndexMap<&'static str, String> {
    // see: https://developers.google.com/calendar/api/v3/reference/events/list

    let mut query_parameters: IndexMap<&'static str, String> = IndexMap::new();

    if let Some(count) = event_count {
        // limit the number of results per page to a specific count
        query_parameters.insert("maxResults", count.to_string());
    }

    if let Some(token) = next_page_token {
        // page token returned by previous request to fetch the next page
        query_parameters.insert("pageToken", token.clone());
    }

    query_parameters
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_owned(),
    }
}

async fn error_for_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();

    Err(ClientError::Api {
        status,
        message: api_error_message(&body),
    })
}

// Google wraps errors as `{"error": {"code": 404, "message": "Not Found", ...}}`.
fn api_error_message(body: &str) -> String {
    match serde_json::from_str::<models::ApiErrorBody>(body) {
        Ok(error) => error.error.message,
        Err(_) if body.trim().is_empty() => "empty response body".to_owned(),
        Err(_) => body.trim().to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::collect_pages;
    use crate::sync::find_calendar;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug)]
    struct StaticToken;

    #[async_trait]
    impl TokenSource for StaticToken {
        async fn token(&self) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
            Ok("Bearer test-token".to_owned())
        }
    }

    fn client(server: &MockServer, batch_size: usize) -> GoogleCalendarClient {
        let config = GoogleConfig {
            api_base_url: format!("{}/", server.uri()),
            batch_size,
            page_size: None,
            timeout_secs: 5,
        };

        GoogleCalendarClient::with_token_source(&config, Arc::new(StaticToken)).unwrap()
    }

    fn batch_response(statuses: &[u16]) -> ResponseTemplate {
        let mut body = String::new();
        for (index, status) in statuses.iter().enumerate() {
            body.push_str(&format!(
                "--batch_resp\r\n\
                 Content-Type: application/http\r\n\
                 Content-ID: <response-item-{index}>\r\n\r\n\
                 HTTP/1.1 {status} Status\r\n\
                 Content-Type: application/json\r\n\r\n\
                 {{\"error\": {{\"message\": \"status {status}\"}}}}\r\n"
            ));
        }
        body.push_str("--batch_resp--\r\n");

        ResponseTemplate::new(200).set_body_raw(body, "multipart/mixed; boundary=batch_resp")
    }

    #[test]
    fn build_query_parameters_without_parameters() {
        let query_parameters = build_query_parameters(&None, &None);

        assert!(query_parameters.is_empty());
    }

    #[test]
    fn build_query_parameters_with_event_count_and_page_token() {
        let query_parameters = build_query_parameters(&Some(30), &Some("abcd".to_owned()));

        let expected_parameters = IndexMap::from([
            ("maxResults", "30".to_owned()),
            ("pageToken", "abcd".to_owned()),
        ]);

        assert_eq!(expected_parameters, query_parameters);
    }

    #[test]
    fn extracts_google_error_messages() {
        assert_eq!(
            api_error_message(r#"{"error": {"code": 403, "message": "Forbidden"}}"#),
            "Forbidden"
        );
        assert_eq!(api_error_message("  upstream timeout \n"), "upstream timeout");
        assert_eq!(api_error_message(""), "empty response body");
    }

    #[tokio::test]
    async fn rejects_unusable_base_url() {
        let config = GoogleConfig {
            api_base_url: "mailto:someone@example.com".into(),
            ..GoogleConfig::default()
        };

        assert!(matches!(
            GoogleCalendarClient::with_token_source(&config, Arc::new(StaticToken)),
            Err(ClientError::Url(_))
        ));
    }

    #[tokio::test]
    async fn lists_calendars_across_pages_with_token() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/calendar/v3/users/me/calendarList"))
            .and(query_param("pageToken", "page-2"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": "c2", "summary": "Python Brasil 2019 - Grade"}]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/calendar/v3/users/me/calendarList"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": "c1", "summary": "Feriados"}],
                "nextPageToken": "page-2"
            })))
            .mount(&server)
            .await;

        let client = client(&server, 50);
        let calendars = collect_pages(|token| client.list_calendars(token))
            .await
            .unwrap();

        let ids: Vec<_> = calendars.iter().map(|calendar| calendar.id.as_str()).collect();
        assert_eq!(ids, ["c1", "c2"]);

        let found = find_calendar(&client, "Python Brasil 2019 - Grade")
            .await
            .unwrap();
        assert_eq!(found.map(|calendar| calendar.id), Some("c2".to_owned()));
    }

    #[tokio::test]
    async fn creates_calendar_and_acl_rule() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/calendar/v3/calendars"))
            .and(body_string_contains("\"summary\":\"Python Brasil 2019 - Grade\""))
            .and(body_string_contains("\"timeZone\":\"America/Sao_Paulo\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "abc@group.calendar.google.com",
                "summary": "Python Brasil 2019 - Grade"
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/calendar/v3/calendars/abc@group.calendar.google.com/acl"))
            .and(body_string_contains("\"type\":\"default\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "default",
                "scope": {"type": "default"},
                "role": "reader"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, 50);

        let calendar = client
            .create_calendar("Python Brasil 2019 - Grade", "America/Sao_Paulo")
            .await
            .unwrap();
        assert_eq!(calendar.id, "abc@group.calendar.google.com");

        let rule = client
            .insert_acl_rule(&calendar.id, &models::AclRule::public_reader())
            .await
            .unwrap();
        assert_eq!(rule.id.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn surfaces_api_errors() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/calendar/v3/calendars/missing/events"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": 404, "message": "Not Found"}
            })))
            .mount(&server)
            .await;

        let err = client(&server, 50)
            .list_events("missing", None)
            .await
            .unwrap_err();

        match err {
            ClientError::Api { status, message } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(message, "Not Found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn deletes_events_in_chunks() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/batch/calendar/v3"))
            .and(body_string_contains("events/e3?sendUpdates=all"))
            .respond_with(batch_response(&[204]))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/batch/calendar/v3"))
            .and(body_string_contains(
                "DELETE /calendar/v3/calendars/cal/events/e1?sendUpdates=all HTTP/1.1",
            ))
            .and(body_string_contains("events/e2?sendUpdates=all"))
            .respond_with(batch_response(&[204, 410]))
            .expect(1)
            .mount(&server)
            .await;

        let ids = ["e1", "e2", "e3"].map(String::from);

        client(&server, 2).delete_events("cal", &ids).await.unwrap();
    }

    #[tokio::test]
    async fn reports_failed_inserts_after_whole_batch() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/batch/calendar/v3"))
            .and(body_string_contains("POST /calendar/v3/calendars/cal/events HTTP/1.1"))
            .respond_with(batch_response(&[200, 400, 200]))
            .expect(1)
            .mount(&server)
            .await;

        let event = models::NewEvent {
            summary: "Keynote".into(),
            description: String::new(),
            start: models::EventDateTime {
                date_time: "2019-10-23T09:00:00".into(),
                time_zone: chrono_tz::America::Sao_Paulo,
            },
            end: models::EventDateTime {
                date_time: "2019-10-23T09:45:00".into(),
                time_zone: chrono_tz::America::Sao_Paulo,
            },
            location: String::new(),
            creator: models::Creator {
                display_name: "Python Brasil 2019".into(),
                email: "eventos@python.org.br".into(),
            },
            extended_properties: models::ExtendedProperties {
                private: IndexMap::new(),
            },
        };

        let err = client(&server, 50)
            .insert_events("cal", &[event.clone(), event.clone(), event])
            .await
            .unwrap_err();

        match err {
            ClientError::Batch {
                failed,
                total,
                message,
            } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
                assert_eq!(message, "status 400 (400)");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
