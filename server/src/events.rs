//! Event records and their store.
//!
//! Only an event's owner may update or delete it. Joining is an add-to-set
//! on the attendee list, done under the store's write lock so concurrent
//! joins never lose an update and a repeated join changes nothing.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::users::OwnerSummary;

/// Errors returned by the event store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event not found")]
    NotFound,

    #[error("caller does not own this event")]
    Forbidden,

    #[error("{message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl EventError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// A stored event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub date: DateTime<Utc>,
    pub attendees: Vec<Uuid>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn attendee_count(&self) -> usize {
        self.attendees.len()
    }

    pub fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.created_by == user_id
    }

    /// Combines the event with its owner's public details.
    pub fn into_view(self, owner: Option<OwnerSummary>) -> EventView {
        EventView {
            attendee_count: self.attendee_count(),
            id: self.id,
            name: self.name,
            description: self.description,
            date: self.date,
            attendees: self.attendees,
            created_by: owner.map(CreatedBy::User).unwrap_or(CreatedBy::Id(self.created_by)),
            created_at: self.created_at,
        }
    }
}

/// Owner reference in an [`EventView`]: the user's details when the owner
/// still exists, otherwise the bare id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CreatedBy {
    User(OwnerSummary),
    Id(Uuid),
}

/// Event as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventView {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub date: DateTime<Utc>,
    pub attendees: Vec<Uuid>,
    pub attendee_count: usize,
    pub created_by: CreatedBy,
    pub created_at: DateTime<Utc>,
}

/// Client-supplied event fields. Used for both create and update; on update
/// absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFields {
    pub name: Option<String>,
    pub description: Option<String>,
    pub date: Option<String>,
}

/// Outcome of [`EventStore::add_attendee`].
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub event: Event,
    /// False when the user was already attending.
    pub added: bool,
}

/// Parses an event date: RFC 3339, or `YYYY-MM-DD` taken as midnight UTC.
pub fn parse_event_date(raw: &str) -> Result<DateTime<Utc>, EventError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(EventError::invalid("date", "date is required"));
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| {
            EventError::invalid("date", "date must be an RFC 3339 timestamp or YYYY-MM-DD")
        })
}

fn parse_name(raw: &str) -> Result<String, EventError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(EventError::invalid("name", "name is required"));
    }
    Ok(name.to_string())
}

fn normalize_description(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Validated create input.
struct NewEvent {
    name: String,
    description: Option<String>,
    date: DateTime<Utc>,
}

impl TryFrom<EventFields> for NewEvent {
    type Error = EventError;

    fn try_from(fields: EventFields) -> Result<Self, Self::Error> {
        let name = parse_name(fields.name.as_deref().unwrap_or_default())?;
        let date = parse_event_date(fields.date.as_deref().unwrap_or_default())?;
        Ok(Self {
            name,
            description: fields.description.and_then(normalize_description),
            date,
        })
    }
}

/// Validated patch. `description: Some(None)` clears the description.
struct EventPatch {
    name: Option<String>,
    description: Option<Option<String>>,
    date: Option<DateTime<Utc>>,
}

impl TryFrom<EventFields> for EventPatch {
    type Error = EventError;

    fn try_from(fields: EventFields) -> Result<Self, Self::Error> {
        Ok(Self {
            name: fields.name.as_deref().map(parse_name).transpose()?,
            description: fields.description.map(normalize_description),
            date: fields.date.as_deref().map(parse_event_date).transpose()?,
        })
    }
}

impl EventPatch {
    fn apply(self, event: &mut Event) {
        if let Some(name) = self.name {
            event.name = name;
        }
        if let Some(description) = self.description {
            event.description = description;
        }
        if let Some(date) = self.date {
            event.date = date;
        }
    }
}

#[derive(Default)]
struct EventIndex {
    events: HashMap<Uuid, Event>,
    /// Ids in creation order.
    order: Vec<Uuid>,
}

/// Thread-safe in-memory event store.
#[derive(Default)]
pub struct EventStore {
    inner: RwLock<EventIndex>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an event owned by `owner_id`.
    pub fn create(&self, owner_id: Uuid, fields: EventFields) -> Result<Event, EventError> {
        let input = NewEvent::try_from(fields)?;
        let event = Event {
            id: Uuid::new_v4(),
            name: input.name,
            description: input.description,
            date: input.date,
            attendees: Vec::new(),
            created_by: owner_id,
            created_at: Utc::now(),
        };

        let mut index = self.inner.write().unwrap();
        index.order.push(event.id);
        index.events.insert(event.id, event.clone());

        info!(event_id = %event.id, owner_id = %owner_id, "Event created");
        Ok(event)
    }

    /// All events in creation order.
    pub fn list(&self) -> Vec<Event> {
        let index = self.inner.read().unwrap();
        index
            .order
            .iter()
            .filter_map(|id| index.events.get(id))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: Uuid) -> Result<Event, EventError> {
        self.inner
            .read()
            .unwrap()
            .events
            .get(&id)
            .cloned()
            .ok_or(EventError::NotFound)
    }

    /// Applies `fields` to an event owned by `owner_id`.
    ///
    /// Checks run in order: existence, ownership, then field validation. A
    /// failed check leaves the event untouched.
    pub fn update(
        &self,
        id: Uuid,
        owner_id: Uuid,
        fields: EventFields,
    ) -> Result<Event, EventError> {
        let patch = EventPatch::try_from(fields);

        let mut index = self.inner.write().unwrap();
        let event = index.events.get_mut(&id).ok_or(EventError::NotFound)?;
        if !event.is_owned_by(owner_id) {
            debug!(event_id = %id, caller = %owner_id, "Rejected update by non-owner");
            return Err(EventError::Forbidden);
        }

        patch?.apply(event);

        info!(event_id = %id, "Event updated");
        Ok(event.clone())
    }

    /// Deletes an event owned by `owner_id` and returns it.
    pub fn delete(&self, id: Uuid, owner_id: Uuid) -> Result<Event, EventError> {
        let mut index = self.inner.write().unwrap();
        let event = index.events.get(&id).ok_or(EventError::NotFound)?;
        if !event.is_owned_by(owner_id) {
            debug!(event_id = %id, caller = %owner_id, "Rejected delete by non-owner");
            return Err(EventError::Forbidden);
        }

        index.order.retain(|existing| *existing != id);
        let removed = index.events.remove(&id).ok_or(EventError::NotFound)?;

        info!(event_id = %id, "Event deleted");
        Ok(removed)
    }

    /// Adds `user_id` to the attendees if not already present.
    pub fn add_attendee(&self, id: Uuid, user_id: Uuid) -> Result<JoinOutcome, EventError> {
        let mut index = self.inner.write().unwrap();
        let event = index.events.get_mut(&id).ok_or(EventError::NotFound)?;

        let added = !event.attendees.contains(&user_id);
        if added {
            event.attendees.push(user_id);
            debug!(
                event_id = %id,
                user_id = %user_id,
                attendee_count = event.attendees.len(),
                "Attendee added"
            );
        }

        Ok(JoinOutcome {
            event: event.clone(),
            added,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.inner.read().map(|i| i.events.len()).unwrap_or(0);
        f.debug_struct("EventStore").field("event_count", &len).finish()
    }
}
