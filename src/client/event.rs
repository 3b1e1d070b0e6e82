//! Events surfaced to the application
//!
//! Connection-level status goes to the receiver returned by
//! [`RtmpConnection::connect`](super::RtmpConnection::connect); everything
//! about one stream goes to that stream's own receiver.

use crate::amf::{AmfObject, AmfValue};
use crate::media::MediaFrame;
use crate::protocol::message::{Command, DataMessage};

/// A status notification: `NetConnection.*` or `NetStream.*`
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    /// "status", "warning" or "error"
    pub level: String,
    /// Status code, e.g. `NetStream.Publish.Start`
    pub code: String,
    pub description: String,
    /// The whole info object as the server sent it (empty for local events)
    pub info: AmfObject,
}

impl StatusEvent {
    /// Event raised by the client itself
    pub fn local(level: &str, code: &str, description: impl Into<String>) -> Self {
        Self {
            level: level.to_string(),
            code: code.to_string(),
            description: description.into(),
            info: AmfObject::new(),
        }
    }

    /// Event built from an `onStatus`/`_result`/`_error` info object
    pub fn from_command(cmd: &Command) -> Self {
        let text = |key: &str| {
            cmd.info()
                .and_then(|info| info.get(key))
                .and_then(AmfValue::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Self {
            level: text("level"),
            code: text("code"),
            description: text("description"),
            info: cmd.info().cloned().unwrap_or_default(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == "error"
    }
}

/// Something that happened on one stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// `onStatus` from the server, or a local record/close notification
    Status(StatusEvent),

    /// Audio or video frame received while playing
    Media(MediaFrame),

    /// Data message (onMetaData, cue points) received while playing
    Data(DataMessage),

    /// The server has no more data for this stream
    Eof,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_command() {
        let info = AmfObject::from([
            ("level", "error"),
            ("code", "NetStream.Publish.BadName"),
            ("description", "name in use"),
        ]);
        let cmd = Command::new("onStatus", 0, vec![AmfValue::Object(info.clone())]);

        let event = StatusEvent::from_command(&cmd);
        assert_eq!(event.code, "NetStream.Publish.BadName");
        assert_eq!(event.description, "name in use");
        assert!(event.is_error());
        assert_eq!(event.info, info);
    }

    #[test]
    fn test_missing_fields() {
        let cmd = Command::new("onStatus", 0, vec![]);
        let event = StatusEvent::from_command(&cmd);
        assert!(event.code.is_empty());
        assert!(!event.is_error());

        let event = StatusEvent::local("status", "NetStream.Record.Start", "out.flv");
        assert_eq!(event.description, "out.flv");
        assert!(event.info.is_empty());
    }
}
