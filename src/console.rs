//! # Console Front End
//!
//! Line-oriented commands on stdin and a renderer that prints what changed in
//! each published [`SessionSnapshot`]. The renderer only reads snapshots; every
//! action goes through the session handle.
//!
//! ## Commands:
//! - `dial <number>`: place a call (only the hotline connects)
//! - `inbound`: simulate an incoming call
//! - `hangup`: end the current call
//! - `status`: print the current call view
//! - `config`: print the effective configuration
//! - `help`, `quit`

use crate::grievance::GrievanceTicket;
use crate::session::{CallState, SessionSnapshot, SovereigntyStatus};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Dial(String),
    Inbound,
    Hangup,
    Status,
    Config,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line. `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "dial" | "call" => match words.next() {
                Some(number) => ConsoleCommand::Dial(number.to_string()),
                None => return Err("Usage: dial <number>".to_string()),
            },
            "inbound" | "ring" => ConsoleCommand::Inbound,
            "hangup" | "end" => ConsoleCommand::Hangup,
            "status" => ConsoleCommand::Status,
            "config" => ConsoleCommand::Config,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => return Err(format!("Unknown command '{}', try 'help'", other)),
        };
        Ok(Some(command))
    }
}

pub fn help_text(hotline: &str) -> String {
    format!(
        "Commands:\n  dial {}   place a call\n  inbound    simulate an incoming call\n  hangup     end the call\n  status     show the call view\n  config     show configuration\n  quit       hang up and exit",
        hotline
    )
}

fn sovereignty_label(status: SovereigntyStatus) -> &'static str {
    match status {
        SovereigntyStatus::Sovereign => "SOVEREIGN",
        SovereigntyStatus::Processing => "PROCESSING",
        SovereigntyStatus::Wiping => "WIPING",
    }
}

fn ticket_line(ticket: &GrievanceTicket) -> String {
    if ticket.is_wiped() {
        return "Ticket: [wiped]".to_string();
    }
    let field = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "Ticket: id={} category={} location={} citizen={}",
        field(&ticket.ticket_id),
        field(&ticket.issue_category),
        field(&ticket.location),
        field(&ticket.citizen_name),
    );
    if let Some(created) = ticket.timestamp {
        line.push_str(&format!(" created={}", created.format("%H:%M:%S")));
    }
    line
}

/// Lines describing what changed between two snapshots, in display order.
pub fn describe_changes(previous: &SessionSnapshot, next: &SessionSnapshot) -> Vec<String> {
    let mut lines = Vec::new();

    if next.state != previous.state {
        match next.state {
            CallState::Connecting => lines.push("Connecting...".to_string()),
            CallState::Active => lines.push("Call connected".to_string()),
            CallState::Ending => {}
            CallState::Idle => match &next.last_error {
                Some(err) => lines.push(format!("Call ended: {}", err)),
                None => lines.push("Call ended".to_string()),
            },
        }
    }

    let new_call = next.call_id.is_some() && next.call_id != previous.call_id;
    let first_new = if new_call || next.log.len() < previous.log.len() {
        0
    } else {
        previous.log.len()
    };
    for entry in &next.log[first_new..] {
        lines.push(format!(
            "[{}] {} {}: {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.category.as_str().to_uppercase(),
            entry.label,
            entry.text
        ));
    }

    if next.ticket != previous.ticket && !(next.ticket.is_empty() && !next.ticket.is_wiped()) {
        lines.push(ticket_line(&next.ticket));
    }

    if next.data_points_stored != previous.data_points_stored {
        lines.push(format!("Data points stored: {}", next.data_points_stored));
    }

    if next.sovereignty() != previous.sovereignty() {
        lines.push(format!("Sovereignty: {}", sovereignty_label(next.sovereignty())));
    }

    lines
}

/// Full view for the `status` command.
pub fn status_lines(snapshot: &SessionSnapshot) -> Vec<String> {
    let mut lines = vec![format!("State: {}", snapshot.state.as_str())];
    if let Some(call_id) = snapshot.call_id {
        lines.push(format!("Call: {}", call_id));
    }
    if let Some(started) = snapshot.started_at {
        lines.push(format!("Connected at: {}", started.format("%H:%M:%S")));
    }
    lines.push(ticket_line(&snapshot.ticket));
    lines.push(format!(
        "Data points stored: {} ({})",
        snapshot.data_points_stored,
        sovereignty_label(snapshot.sovereignty())
    ));
    lines.push(format!("Log entries: {}", snapshot.log.len()));
    if let Some(err) = &snapshot.last_error {
        lines.push(format!("Last error: {}", err));
    }
    lines
}

/// Print changes until the session goes away.
pub async fn render(mut snapshots: watch::Receiver<SessionSnapshot>) {
    let mut previous = snapshots.borrow_and_update().clone();
    while snapshots.changed().await.is_ok() {
        let next = snapshots.borrow_and_update().clone();
        for line in describe_changes(&previous, &next) {
            println!("{}", line);
        }
        previous = next;
    }
}
