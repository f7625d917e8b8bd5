//! Event CRUD and attendance endpoints.

use axum::extract::{Path, State};
use tracing::info;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::events::{Event, EventFields, EventView};
use crate::response::ApiResponse;
use crate::routes::extract::{parse_id, JsonBody};
use crate::routes::AppState;

fn view(state: &AppState, event: Event) -> EventView {
    let owner = state.users.owner_summary(event.created_by);
    event.into_view(owner)
}

/// POST /events
pub async fn create_event(
    State(state): State<AppState>,
    auth: AuthUser,
    JsonBody(fields): JsonBody<EventFields>,
) -> ApiResult<ApiResponse<EventView>> {
    let event = state.events.create(auth.id(), fields)?;
    Ok(ApiResponse::created(
        view(&state, event),
        "Event created successfully",
    ))
}

/// GET /events
pub async fn list_events(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> ApiResponse<Vec<EventView>> {
    let events = state
        .events
        .list()
        .into_iter()
        .map(|event| view(&state, event))
        .collect();
    ApiResponse::ok(events, "Events fetched successfully")
}

/// GET /events/{id}
pub async fn get_event(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<ApiResponse<EventView>> {
    let event = state.events.get(parse_id(&id, "event")?)?;
    Ok(ApiResponse::ok(
        view(&state, event),
        "Event fetched successfully",
    ))
}

/// PUT /events/{id} - owner only.
pub async fn update_event(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    JsonBody(fields): JsonBody<EventFields>,
) -> ApiResult<ApiResponse<EventView>> {
    let event = state
        .events
        .update(parse_id(&id, "event")?, auth.id(), fields)?;
    Ok(ApiResponse::ok(
        view(&state, event),
        "Event updated successfully",
    ))
}

/// DELETE /events/{id} - owner only.
pub async fn delete_event(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<ApiResponse<EventView>> {
    let event = state.events.delete(parse_id(&id, "event")?, auth.id())?;
    Ok(ApiResponse::ok(
        view(&state, event),
        "Event deleted successfully",
    ))
}

/// POST /events/{id}/attend
///
/// Adds the caller to the attendees. A first join publishes the new count to
/// the event's room; a repeated join changes nothing and publishes nothing.
pub async fn attend_event(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<ApiResponse<EventView>> {
    let event_id = parse_id(&id, "event")?;
    let outcome = state.events.add_attendee(event_id, auth.id())?;

    let message = if outcome.added {
        let count = outcome.event.attendee_count();
        let receivers = state.rooms.publish_attendee_count(event_id, count);
        info!(
            event_id = %event_id,
            user_id = %auth.id(),
            attendee_count = count,
            receivers,
            "Attendee joined event"
        );
        "You have joined the event"
    } else {
        "You are already attending this event"
    };

    Ok(ApiResponse::ok(view(&state, outcome.event), message))
}
