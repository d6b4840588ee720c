//! Outbound signaling seam.

use crate::error::Result;
use crate::message::ServerMessage;

/// Ordered, at-most-once delivery of server messages to one client.
///
/// Implementations must preserve submission order per connection; that
/// ordering is what lets the rest of the relay treat "registered before
/// offer before candidates" as a guarantee rather than a race. A send
/// failure means the client is gone (or hopelessly backlogged) and is
/// never fatal to the caller.
#[cfg_attr(test, mockall::automock)]
pub trait MessageSender: Send + Sync {
    fn send(&self, message: ServerMessage) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::message::ClientRole;

    #[test]
    fn test_mock_sender_reports_closed_channel() {
        let mut mock = MockMessageSender::new();
        mock.expect_send().times(1).returning(|_| Err(Error::ChannelClosed));

        let result = mock.send(ServerMessage::Registered {
            role: ClientRole::Viewer,
            viewer_id: Some("v1".to_string()),
            viewer_count: None,
        });
        assert!(matches!(result, Err(Error::ChannelClosed)));
    }
}
