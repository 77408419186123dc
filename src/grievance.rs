//! # Grievance Reducer
//!
//! Rebuilds the live grievance ticket from the ordered stream of inbound events.
//! The ticket is a derived, non-authoritative summary: the remote service owns
//! the real record, the client only shows what the conversation has revealed so far.
//!
//! ## Recognized Updates:
//! | category | label            | effect                                   |
//! |----------|------------------|------------------------------------------|
//! | entity   | `Citizen`        | replace `citizen_name`                   |
//! | entity   | `Location`       | replace `location`                       |
//! | action   | `Category`       | replace `issue_category`                 |
//! | action   | `Ticket Created` | replace `ticket_id`, stamp `timestamp`   |
//!
//! `memory_wipe_complete` does not clear anything here. It asks the session to
//! clear the ticket after the settle delay, see [`TicketChange::WipeRequested`].

use crate::protocol::{ChunkCategory, InboundEvent};
use chrono::{DateTime, Local};
use serde::Serialize;

/// Whether the ticket still reflects the live call or has been wiped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    #[default]
    Active,
    Wiped,
}

/// Structured grievance record derived from the conversation.
///
/// Every field except `status` starts empty and is replaced, never merged, by
/// the latest matching text chunk.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GrievanceTicket {
    pub ticket_id: Option<String>,
    pub issue_category: Option<String>,
    pub location: Option<String>,
    pub citizen_name: Option<String>,
    /// Wall-clock time the `Ticket Created` chunk was received
    pub timestamp: Option<DateTime<Local>>,
    pub status: TicketStatus,
}

impl GrievanceTicket {
    /// Fresh ticket for a new call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticket after the delayed wipe has run: every field empty, status `Wiped`.
    pub fn wiped() -> Self {
        Self {
            status: TicketStatus::Wiped,
            ..Self::default()
        }
    }

    pub fn is_wiped(&self) -> bool {
        self.status == TicketStatus::Wiped
    }

    /// True when no derived field has been populated yet.
    pub fn is_empty(&self) -> bool {
        self.ticket_id.is_none()
            && self.issue_category.is_none()
            && self.location.is_none()
            && self.citizen_name.is_none()
            && self.timestamp.is_none()
    }
}

/// One line of the chronological intelligence feed.
///
/// Built from every `text_chunk`, recognized or not. Append-only during a call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntelligenceLogEntry {
    pub category: ChunkCategory,
    pub label: String,
    pub text: String,
    pub timestamp: DateTime<Local>,
}

/// Result of feeding one event to the reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum TicketChange {
    /// The event did not concern the ticket (or the ticket is wiped)
    Unchanged,
    /// A field was replaced; this is the next snapshot
    Replaced(GrievanceTicket),
    /// The service finished wiping; clear the ticket once the settle delay passes
    WipeRequested,
}

/// Ticket fields a text chunk can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TicketField {
    CitizenName,
    Location,
    IssueCategory,
    TicketId,
}

fn target_field(category: ChunkCategory, label: &str) -> Option<TicketField> {
    match (category, label) {
        (ChunkCategory::Entity, "Citizen") => Some(TicketField::CitizenName),
        (ChunkCategory::Entity, "Location") => Some(TicketField::Location),
        (ChunkCategory::Action, "Category") => Some(TicketField::IssueCategory),
        (ChunkCategory::Action, "Ticket Created") => Some(TicketField::TicketId),
        _ => None,
    }
}

/// Whether a text chunk with this category/label updates the ticket.
pub fn is_recognized(category: ChunkCategory, label: &str) -> bool {
    target_field(category, label).is_some()
}

/// Pure reducer: `(current ticket, next event) -> change`.
///
/// `received_at` is the wall-clock time of receipt; it becomes the ticket
/// timestamp on `Ticket Created` and is ignored otherwise. A wiped ticket is
/// frozen until the session starts a new call and resets it.
pub fn reduce(
    ticket: &GrievanceTicket,
    event: &InboundEvent,
    received_at: DateTime<Local>,
) -> TicketChange {
    match event {
        InboundEvent::TextChunk { category, label, text } => {
            if ticket.is_wiped() {
                return TicketChange::Unchanged;
            }
            let Some(field) = target_field(*category, label) else {
                return TicketChange::Unchanged;
            };

            let mut next = ticket.clone();
            match field {
                TicketField::CitizenName => next.citizen_name = Some(text.clone()),
                TicketField::Location => next.location = Some(text.clone()),
                TicketField::IssueCategory => next.issue_category = Some(text.clone()),
                TicketField::TicketId => {
                    next.ticket_id = Some(text.clone());
                    next.timestamp = Some(received_at);
                }
            }
            TicketChange::Replaced(next)
        }
        InboundEvent::MemoryWipeComplete => TicketChange::WipeRequested,
        // Wipe start is only a UI signal; audio, counts and call_complete never touch the ticket.
        _ => TicketChange::Unchanged,
    }
}

/// Fold a whole event sequence into a ticket, ignoring wipe requests.
///
/// Handy for replaying a transcript; the live session applies wipes itself.
pub fn replay<'a, I>(events: I, received_at: DateTime<Local>) -> GrievanceTicket
where
    I: IntoIterator<Item = &'a InboundEvent>,
{
    events
        .into_iter()
        .fold(GrievanceTicket::new(), |ticket, event| match reduce(&ticket, event, received_at) {
            TicketChange::Replaced(next) => next,
            TicketChange::Unchanged | TicketChange::WipeRequested => ticket,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(category: ChunkCategory, label: &str, text: &str) -> InboundEvent {
        InboundEvent::TextChunk {
            category,
            label: label.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_category_then_ticket_created() {
        let now = Local::now();
        let events = vec![
            chunk(ChunkCategory::Action, "Category", "Pothole"),
            chunk(ChunkCategory::Action, "Ticket Created", "MCD-311-001"),
        ];

        let ticket = replay(&events, now);
        assert_eq!(ticket.issue_category.as_deref(), Some("Pothole"));
        assert_eq!(ticket.ticket_id.as_deref(), Some("MCD-311-001"));
        assert_eq!(ticket.timestamp, Some(now));
        assert_eq!(ticket.status, TicketStatus::Active);
        assert!(ticket.location.is_none());
    }

    #[test]
    fn test_latest_value_replaces_earlier_one() {
        let now = Local::now();
        let events = vec![
            chunk(ChunkCategory::Entity, "Location", "Lajpat Nagar"),
            chunk(ChunkCategory::Entity, "Citizen", "Amit Singh"),
            chunk(ChunkCategory::Entity, "Location", "Lajpat Nagar, Block C"),
        ];

        let ticket = replay(&events, now);
        assert_eq!(ticket.location.as_deref(), Some("Lajpat Nagar, Block C"));
        assert_eq!(ticket.citizen_name.as_deref(), Some("Amit Singh"));
    }

    #[test]
    fn test_fields_never_revert() {
        let now = Local::now();
        let events = vec![
            chunk(ChunkCategory::Action, "Category", "STREET_LIGHT"),
            chunk(ChunkCategory::Action, "Priority", "HIGH"),
            chunk(ChunkCategory::Intent, "Category", "ignored: wrong category"),
            InboundEvent::DataCount { count: 4 },
            InboundEvent::MemoryWipeStart,
            InboundEvent::CallComplete,
        ];

        let mut ticket = GrievanceTicket::new();
        let mut seen_category: Option<String> = None;
        for event in &events {
            if let TicketChange::Replaced(next) = reduce(&ticket, event, now) {
                ticket = next;
            }
            if ticket.issue_category.is_some() {
                seen_category = ticket.issue_category.clone();
            }
            assert_eq!(ticket.issue_category, seen_category);
        }
        assert_eq!(ticket.issue_category.as_deref(), Some("STREET_LIGHT"));
    }

    #[test]
    fn test_unrecognized_labels_leave_ticket_alone() {
        let ticket = GrievanceTicket::new();
        let now = Local::now();
        for event in [
            chunk(ChunkCategory::Action, "Verification", "[SUCCESS]"),
            chunk(ChunkCategory::Unknown, "Citizen", "Nobody"),
            chunk(ChunkCategory::Intent, "Call Type", "Grievance Registration"),
        ] {
            assert_eq!(reduce(&ticket, &event, now), TicketChange::Unchanged);
        }
        assert!(!is_recognized(ChunkCategory::Action, "Priority"));
        assert!(is_recognized(ChunkCategory::Action, "Ticket Created"));
    }

    #[test]
    fn test_wipe_complete_requests_delayed_clear() {
        let now = Local::now();
        let ticket = replay(&[chunk(ChunkCategory::Entity, "Citizen", "Amit")], now);

        assert_eq!(reduce(&ticket, &InboundEvent::MemoryWipeStart, now), TicketChange::Unchanged);
        assert_eq!(
            reduce(&ticket, &InboundEvent::MemoryWipeComplete, now),
            TicketChange::WipeRequested
        );
    }

    #[test]
    fn test_wiped_ticket_cannot_be_repopulated() {
        let wiped = GrievanceTicket::wiped();
        assert!(wiped.is_empty());

        let change = reduce(
            &wiped,
            &chunk(ChunkCategory::Action, "Ticket Created", "MCD-311-002"),
            Local::now(),
        );
        assert_eq!(change, TicketChange::Unchanged);
    }
}
