//! Control-event handling on the event channel.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use lisan_core::error::Result;
use lisan_core::lesson::LessonScript;
use lisan_core::protocol::{ControlEvent, format_timestamp};

/// Stamps, serializes and parses control events, and decides when the
/// lesson script goes out.
#[derive(Debug, Clone)]
pub struct EventProtocolHandler {
    lesson: LessonScript,
    lesson_sent: bool,
}

impl EventProtocolHandler {
    pub fn new(lesson: LessonScript) -> Self {
        Self {
            lesson,
            lesson_sent: false,
        }
    }

    /// Fill in a missing `event_id` and send-time `timestamp`, then serialize.
    ///
    /// Returns the completed event together with its wire text.
    pub fn prepare_outbound(
        &self,
        mut event: ControlEvent,
        now: DateTime<Utc>,
    ) -> Result<(ControlEvent, String)> {
        ensure_identity(&mut event, now);
        let wire = event.to_wire()?;
        Ok((event, wire))
    }

    /// Parse one inbound message. A missing timestamp becomes `received_at`.
    pub fn decode_inbound(&self, text: &str, received_at: DateTime<Utc>) -> Result<ControlEvent> {
        let mut event = ControlEvent::parse(text)?;
        ensure_identity(&mut event, received_at);
        Ok(event)
    }

    /// The lesson event on the first channel open; `None` afterwards.
    pub fn on_channel_open(&mut self) -> Option<ControlEvent> {
        if self.lesson_sent {
            return None;
        }
        self.lesson_sent = true;
        Some(self.lesson.to_event())
    }

    pub fn lesson_sent(&self) -> bool {
        self.lesson_sent
    }
}

fn ensure_identity(event: &mut ControlEvent, at: DateTime<Utc>) {
    if event.event_id.as_deref().is_none_or(str::is_empty) {
        event.event_id = Some(Uuid::new_v4().to_string());
    }
    if event.timestamp.is_none() {
        event.timestamp = Some(format_timestamp(at));
    }
}
