//! Structured event recording for fan commands
//!
//! Controllers do not own a process-wide logger. Each one holds an
//! injected [`EventSink`] and reports connection outcomes, per-fan
//! command detail (register address, PWM, percent) and statistics
//! snapshots through it. The default sink forwards to `tracing`;
//! [`MemorySink`] captures events for inspection in tests.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::board::CommandStats;

/// Per-fan detail of one write command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FanCommand {
    pub fan_index: u16,
    pub register: u16,
    pub pwm: u16,
    pub percent: f64,
}

/// Event emitted by a board controller
#[derive(Debug, Clone, Serialize)]
pub enum BoardEvent {
    /// Controller constructed
    Init {
        board_id: usize,
        endpoint: String,
        fan_count: u16,
    },
    /// Connection attempt finished
    Connect {
        board_id: usize,
        endpoint: String,
        success: bool,
        detail: Option<String>,
    },
    /// Connection released
    Disconnect { board_id: usize },
    /// One wire command finished; `fans` lists every register written
    Command {
        board_id: usize,
        fans: Vec<FanCommand>,
        success: bool,
        detail: Option<String>,
    },
    /// On-demand statistics dump
    Statistics {
        board_id: usize,
        stats: CommandStats,
    },
}

/// Recording collaborator injected into controllers
pub trait EventSink: Send + Sync {
    fn record(&self, event: BoardEvent);
}

/// Default sink: structured `tracing` events
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: BoardEvent) {
        match event {
            BoardEvent::Init {
                board_id,
                endpoint,
                fan_count,
            } => {
                info!(board_id, %endpoint, fan_count, "board controller initialized");
            }
            BoardEvent::Connect {
                board_id,
                endpoint,
                success: true,
                ..
            } => {
                info!(board_id, %endpoint, "connected");
            }
            BoardEvent::Connect {
                board_id,
                endpoint,
                success: false,
                detail,
            } => {
                warn!(
                    board_id,
                    %endpoint,
                    detail = detail.as_deref().unwrap_or("unknown error"),
                    "connect failed"
                );
            }
            BoardEvent::Disconnect { board_id } => {
                debug!(board_id, "disconnected");
            }
            BoardEvent::Command {
                board_id,
                fans,
                success: true,
                ..
            } => {
                for fan in &fans {
                    debug!(
                        board_id,
                        fan = fan.fan_index,
                        register = format_args!("0x{:04X}", fan.register),
                        pwm = fan.pwm,
                        percent = fan.percent,
                        "register written"
                    );
                }
                info!(board_id, fans = fans.len(), "command ok");
            }
            BoardEvent::Command {
                board_id,
                fans,
                success: false,
                detail,
            } => {
                warn!(
                    board_id,
                    fans = fans.len(),
                    detail = detail.as_deref().unwrap_or("unknown error"),
                    "command failed"
                );
            }
            BoardEvent::Statistics { board_id, stats } => {
                info!(board_id, %stats, "statistics");
            }
        }
    }
}

/// In-memory sink for tests: stores timestamped events
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(DateTime<Utc>, BoardEvent)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events, oldest first
    pub fn events(&self) -> Vec<BoardEvent> {
        self.events
            .lock()
            .map(|guard| guard.iter().map(|(_, event)| event.clone()).collect())
            .unwrap_or_default()
    }

    /// Recorded `Command` events only
    pub fn commands(&self) -> Vec<BoardEvent> {
        self.events()
            .into_iter()
            .filter(|event| matches!(event, BoardEvent::Command { .. }))
            .collect()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: BoardEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((Utc::now(), event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_preserves_order() {
        let sink = MemorySink::new();
        sink.record(BoardEvent::Init {
            board_id: 1,
            endpoint: "192.168.2.1:8234".to_string(),
            fan_count: 16,
        });
        sink.record(BoardEvent::Disconnect { board_id: 1 });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], BoardEvent::Init { board_id: 1, .. }));
        assert!(matches!(events[1], BoardEvent::Disconnect { board_id: 1 }));
    }

    #[test]
    fn test_command_events_filter() {
        let sink = MemorySink::new();
        sink.record(BoardEvent::Disconnect { board_id: 2 });
        sink.record(BoardEvent::Command {
            board_id: 2,
            fans: vec![FanCommand {
                fan_index: 0,
                register: 0,
                pwm: 500,
                percent: 50.0,
            }],
            success: true,
            detail: None,
        });

        assert_eq!(sink.commands().len(), 1);
    }

    #[test]
    fn test_events_serialize_for_export() {
        let event = BoardEvent::Command {
            board_id: 3,
            fans: vec![FanCommand {
                fan_index: 4,
                register: 0x0004,
                pwm: 1000,
                percent: 100.0,
            }],
            success: true,
            detail: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"pwm\":1000"));
        assert!(json.contains("\"board_id\":3"));
    }
}
