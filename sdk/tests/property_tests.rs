use proptest::prelude::*;
use sdk::errors::{EngineError, EnvoyErrorExt};
use sdk::types::{ClientMessage, MessageStatus};

// Hints are static: whatever detail an error carries never leaks into
// the text pushed to a client.
proptest! {
    #[test]
    fn test_error_user_hint_completeness(detail in "zq[0-9/_.]{6,38}") {
        let errs = vec![
            EngineError::Config(detail.clone()),
            EngineError::Database(detail.clone()),
            EngineError::Persistence(detail.clone()),
            EngineError::LLMProvider(detail.clone()),
            EngineError::ClassificationParse(detail.clone()),
            EngineError::ToolHandler { node: "company".to_string(), message: detail.clone() },
            EngineError::TransportDelivery(detail.clone()),
            EngineError::Network(detail.clone()),
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            prop_assert!(!hint.contains(&detail));
        }
    }
}

proptest! {
    #[test]
    fn test_client_message_parses_back(
        conversation_id in "[a-f0-9-]{1,36}",
        text in "\\PC{0,64}",
        status_idx in 0usize..6,
    ) {
        let statuses = [
            MessageStatus::Started,
            MessageStatus::Streaming,
            MessageStatus::Processing,
            MessageStatus::Completed,
            MessageStatus::Tool,
            MessageStatus::Error,
        ];
        let msg = ClientMessage::new(conversation_id, statuses[status_idx], text);

        let parsed: ClientMessage = serde_json::from_str(&msg.to_json()).unwrap();
        prop_assert_eq!(parsed, msg);
    }
}
