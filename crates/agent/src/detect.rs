use courier_core::types::ChatMessage;
use tracing::{debug, warn};

use crate::adapter::{is_sub_multiset, mentions, parse_execute_list};
use crate::brain::Brain;

/// Two-phase action detection for the micro-agent.
///
/// Phase one collects every whole-identifier mention of an available
/// capability in the intention. When there is more than one, phase two asks
/// the cerebellum backend which of them the intention actually wants run.
/// Its answer is kept only if it uses each name no more often than it was
/// mentioned and every name is available; otherwise the mentions stand.
pub struct ActionDetector {
    backend: Brain,
}

impl ActionDetector {
    pub fn new(backend: Brain) -> Self {
        Self { backend }
    }

    fn confirmation_prompt(intention: &str, mentioned: &[String]) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(
                "You decide which capabilities an agent's plan wants executed now, in order. \
                 Reply with one JSON object: {\"execute\": [names...]}. A name may repeat \
                 if the plan runs it more than once. Use only the candidate names.",
            ),
            ChatMessage::user(&format!(
                "Plan:\n{}\n\nCandidates in order of mention: {}",
                intention,
                mentioned.join(", ")
            )),
        ]
    }

    pub async fn detect(&self, intention: &str, available: &[String]) -> Vec<String> {
        let mentioned = mentions(intention, available);
        if mentioned.len() <= 1 {
            return mentioned;
        }

        let reply = match self
            .backend
            .think(&Self::confirmation_prompt(intention, &mentioned))
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Action confirmation failed, using mentions");
                return mentioned;
            }
        };

        match parse_execute_list(&reply.content) {
            Some(confirmed)
                if is_sub_multiset(&confirmed, &mentioned)
                    && confirmed.iter().all(|n| available.contains(n)) =>
            {
                debug!(?mentioned, ?confirmed, "Actions confirmed");
                confirmed
            }
            _ => {
                debug!(?mentioned, reply = %reply.content, "Rejected confirmation, using mentions");
                mentioned
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::testing::scripted;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_single_mention_skips_confirmation() {
        let (backend, log) = scripted("cerebellum", &[]);
        let found = ActionDetector::new(backend)
            .detect("now all_finished", &names(&["all_finished", "write"]))
            .await;
        assert_eq!(found, names(&["all_finished"]));
        assert!(log.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_confirmation_can_narrow() {
        let (backend, _) = scripted("cerebellum", &[r#"{"execute": ["write"]}"#]);
        let found = ActionDetector::new(backend)
            .detect("write it, do not send_email yet", &names(&["write", "send_email"]))
            .await;
        assert_eq!(found, names(&["write"]));
    }

    #[tokio::test]
    async fn test_confirmation_cannot_invent() {
        let (backend, _) = scripted(
            "cerebellum",
            &[r#"{"execute": ["write", "write", "write", "delete"]}"#],
        );
        let found = ActionDetector::new(backend)
            .detect("write then send_email then write", &names(&["write", "send_email", "delete"]))
            .await;
        assert_eq!(found, names(&["write", "send_email", "write"]));
    }
}
