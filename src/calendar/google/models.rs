use chrono_tz::Tz;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A calendar as returned by `calendarList.list` or `calendars.insert`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Calendar {
    pub id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
pub struct CalendarList {
    #[serde(default)]
    pub items: Vec<Calendar>,
    pub next_page_token: Option<String>,
}

/// Request body of `calendars.insert`.
#[derive(Debug, Serialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct NewCalendar<'a> {
    pub summary: &'a str,
    pub time_zone: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AclScope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// An access control rule of a calendar.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AclRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub scope: AclScope,
    pub role: String,
}

impl AclRule {
    /// Rule granting read access to everyone, including anonymous users.
    pub fn public_reader() -> AclRule {
        AclRule {
            id: None,
            scope: AclScope {
                kind: "default".into(),
                value: None,
            },
            role: "reader".into(),
        }
    }
}

/// The parts of an existing event needed to delete it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
pub struct Event {
    pub id: String,
    pub summary: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
pub struct Events {
    #[serde(default)]
    pub items: Vec<Event>,
    pub next_page_token: Option<String>,
}

/// Start or end of an event. `date_time` carries no offset when the wall-clock time is meant
/// to be read in `time_zone`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct EventDateTime {
    pub date_time: String,
    pub time_zone: Tz,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct Creator {
    pub display_name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtendedProperties {
    pub private: IndexMap<String, String>,
}

/// Request body of `events.insert`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct NewEvent {
    pub summary: String,
    pub description: String,
    pub start: EventDateTime,
    pub end: EventDateTime,
    pub location: String,
    pub creator: Creator,
    pub extended_properties: ExtendedProperties,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorDetail {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn public_reader_rule_serializes_without_id() {
        assert_eq!(
            serde_json::to_value(AclRule::public_reader()).unwrap(),
            json!({"scope": {"type": "default"}, "role": "reader"})
        );
    }

    #[test]
    fn events_page_tolerates_missing_items() {
        let events: Events = serde_json::from_value(json!({
            "kind": "calendar#events",
            "summary": "Python Brasil 2019 - Grade",
            "nextPageToken": "abcd"
        }))
        .unwrap();

        assert!(events.items.is_empty());
        assert_eq!(events.next_page_token.as_deref(), Some("abcd"));
    }

    #[test]
    fn new_event_uses_api_field_names() {
        let event = NewEvent {
            summary: "Keynote".into(),
            description: String::new(),
            start: EventDateTime {
                date_time: "2019-10-23T09:00:00".into(),
                time_zone: chrono_tz::America::Sao_Paulo,
            },
            end: EventDateTime {
                date_time: "2019-10-23T09:45:00".into(),
                time_zone: chrono_tz::America::Sao_Paulo,
            },
            location: "Auditório".into(),
            creator: Creator {
                display_name: "Python Brasil 2019".into(),
                email: "eventos@python.org.br".into(),
            },
            extended_properties: ExtendedProperties {
                private: IndexMap::from([("title".to_owned(), "Keynote".to_owned())]),
            },
        };

        let value = serde_json::to_value(event).unwrap();

        assert_eq!(
            value["start"],
            json!({"dateTime": "2019-10-23T09:00:00", "timeZone": "America/Sao_Paulo"})
        );
        assert_eq!(value["creator"]["displayName"], "Python Brasil 2019");
        assert_eq!(value["extendedProperties"]["private"]["title"], "Keynote");
    }
}
