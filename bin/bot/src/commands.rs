//! Built-in bot commands.

use async_trait::async_trait;
use palaver_conversation::{OutgoingMessage, Scope, ScopeStore};
use palaver_core::CommandId;
use palaver_dispatch::{CommandHandler, HandlerError, RegistryError, SessionProcessor, handler_fn};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};

/// Text that ends an `/echo` session.
pub const ECHO_DONE: &str = "/done";

/// Questions asked by `/survey`, in order.
pub const SURVEY_QUESTIONS: [&str; 3] = [
    "What is your name?",
    "What is your favourite colour?",
    "What brings you here today?",
];

/// A built-in command as listed by `/help`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltIn {
    /// Name shown to users.
    pub name: &'static str,
    /// Routing pattern.
    pub pattern: &'static str,
    /// One-line description.
    pub summary: &'static str,
}

/// Built-in commands in registration order.
pub const BUILT_INS: [BuiltIn; 4] = [
    BuiltIn {
        name: "/ping",
        pattern: r"^/ping\s*$",
        summary: "check that the bot is alive",
    },
    BuiltIn {
        name: "/echo",
        pattern: r"^/echo\b",
        summary: "repeat everything you say until /done",
    },
    BuiltIn {
        name: "/survey",
        pattern: r"^/survey\b",
        summary: "answer three short questions",
    },
    BuiltIn {
        name: "/help",
        pattern: r"^/help\b",
        summary: "list the available commands",
    },
];

/// Replies `Pong!` and finishes.
pub fn ping() -> impl CommandHandler {
    handler_fn(|scope| {
        let _ = scope.reply("Pong!");
        scope.finish();
        Ok(())
    })
}

/// Repeats each message back until the sender says `/done`.
#[derive(Debug, Default)]
pub struct Echo;

#[async_trait]
impl CommandHandler for Echo {
    async fn handle(&self, scope: &mut Scope) -> Result<(), HandlerError> {
        if scope.is_first_turn() {
            let _ = scope.reply(format!(
                "Echoing everything you send. Say {ECHO_DONE} to stop."
            ));
            return Ok(());
        }

        match scope.current_text() {
            Some(ECHO_DONE) => {
                let _ = scope.reply("Bye!");
                scope.finish();
            }
            Some(text) => {
                let _ = scope.reply(text.to_string());
            }
            None => {
                let _ = scope.reply("I can only echo text.");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SurveyAnswers {
    answers: Vec<String>,
}

/// Asks [`SURVEY_QUESTIONS`] one per turn, then summarises the answers.
#[derive(Debug, Default)]
pub struct Survey;

#[async_trait]
impl CommandHandler for Survey {
    async fn handle(&self, scope: &mut Scope) -> Result<(), HandlerError> {
        let mut state: SurveyAnswers = scope.data_as()?.unwrap_or_default();

        if !scope.is_first_turn() {
            let Some(answer) = scope.current_text().map(|text| text.trim().to_string()) else {
                let question = SURVEY_QUESTIONS
                    .get(state.answers.len())
                    .copied()
                    .unwrap_or_default();
                let _ = scope.reply(format!("Please answer in text. {question}"));
                return Ok(());
            };
            state.answers.push(answer);
        }

        match SURVEY_QUESTIONS.get(state.answers.len()) {
            Some(question) => {
                let _ = scope.reply(*question);
                scope.set_data(&state)?;
            }
            None => {
                let summary = SURVEY_QUESTIONS
                    .iter()
                    .zip(&state.answers)
                    .map(|(question, answer)| format!("{question} {answer}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                let _ = scope.reply(format!("Thanks! You said:\n{summary}"));
                scope.finish();
            }
        }
        Ok(())
    }
}

/// Lists the commands it was built with.
#[derive(Debug, Clone)]
pub struct Help {
    text: String,
}

impl Help {
    /// Creates a help command listing `commands`.
    #[must_use]
    pub fn new(commands: &[BuiltIn]) -> Self {
        let lines = commands
            .iter()
            .map(|command| format!("{} - {}", command.name, command.summary))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            text: format!("Available commands:\n{lines}"),
        }
    }

    /// Returns the rendered help text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

#[async_trait]
impl CommandHandler for Help {
    async fn handle(&self, scope: &mut Scope) -> Result<(), HandlerError> {
        let _ = scope.send(OutgoingMessage::text(self.text.clone()));
        scope.finish();
        Ok(())
    }
}

/// Registers every built-in command, in [`BUILT_INS`] order.
///
/// # Errors
///
/// Returns [`RegistryError::InvalidPattern`] if a pattern fails to compile.
pub async fn register_built_ins<S: ScopeStore>(
    processor: &SessionProcessor<S>,
) -> Result<Vec<CommandId>, Report<RegistryError>> {
    let [ping_cmd, echo_cmd, survey_cmd, help_cmd] = BUILT_INS;
    Ok(vec![
        processor.register(ping_cmd.pattern, ping()).await?,
        processor.register(echo_cmd.pattern, Echo).await?,
        processor.register(survey_cmd.pattern, Survey).await?,
        processor
            .register(help_cmd.pattern, Help::new(&BUILT_INS))
            .await?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use palaver_conversation::{
        ChatEvent, DeliveryReceipt, EventBody, MemoryScopeStore, MessagePayload, MessageSender,
        SendError,
    };
    use palaver_core::{ConversationId, ScopeKey};
    use palaver_dispatch::Outcome;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct ChannelSender {
        tx: mpsc::UnboundedSender<OutgoingMessage>,
    }

    #[async_trait]
    impl MessageSender for ChannelSender {
        async fn deliver(
            &self,
            conversation_id: &ConversationId,
            message: OutgoingMessage,
        ) -> Result<DeliveryReceipt, Report<SendError>> {
            let _ = self.tx.send(message);
            Ok(DeliveryReceipt {
                conversation_id: conversation_id.clone(),
                sequence: None,
                accepted_at: Utc::now(),
            })
        }
    }

    struct Bot {
        processor: SessionProcessor<MemoryScopeStore>,
        outbox: mpsc::UnboundedReceiver<OutgoingMessage>,
    }

    impl Bot {
        async fn new() -> Self {
            let (tx, outbox) = mpsc::unbounded_channel();
            let processor =
                SessionProcessor::new(MemoryScopeStore::new(), Arc::new(ChannelSender { tx }));
            register_built_ins(&processor).await.expect("register");
            Self { processor, outbox }
        }

        async fn say(&mut self, text: &str) -> Outcome {
            self.processor
                .process(&"c1".into(), ChatEvent::text("c1", "alice", text))
                .await
                .expect("process")
        }

        async fn next_reply(&mut self) -> String {
            let message = self.outbox.recv().await.expect("reply sent");
            message.payload.as_text().expect("text reply").to_string()
        }

        async fn has_scope(&self) -> bool {
            let key = ScopeKey::new("c1".into(), "alice".into());
            self.processor
                .store()
                .get(&key)
                .await
                .expect("get")
                .is_some()
        }
    }

    #[tokio::test]
    async fn ping_replies_pong() {
        let mut bot = Bot::new().await;

        assert!(matches!(bot.say("/ping").await, Outcome::Completed { .. }));
        assert_eq!(bot.next_reply().await, "Pong!");
        assert!(!bot.has_scope().await);
    }

    #[tokio::test]
    async fn ping_pattern_is_exact() {
        let mut bot = Bot::new().await;
        assert_eq!(bot.say("/pingpong").await, Outcome::Dropped);
    }

    #[tokio::test]
    async fn echo_repeats_until_done() {
        let mut bot = Bot::new().await;

        assert!(matches!(bot.say("/echo").await, Outcome::Started { .. }));
        assert!(bot.next_reply().await.contains(ECHO_DONE));

        assert!(matches!(bot.say("hello").await, Outcome::Continued { .. }));
        assert_eq!(bot.next_reply().await, "hello");

        // Continuations route by the opening message, so other commands do not interrupt.
        assert!(matches!(bot.say("/ping").await, Outcome::Continued { .. }));
        assert_eq!(bot.next_reply().await, "/ping");

        assert!(matches!(bot.say(ECHO_DONE).await, Outcome::Completed { .. }));
        assert_eq!(bot.next_reply().await, "Bye!");
        assert!(!bot.has_scope().await);
    }

    #[tokio::test]
    async fn survey_collects_three_answers() {
        let mut bot = Bot::new().await;

        bot.say("/survey").await;
        assert_eq!(bot.next_reply().await, SURVEY_QUESTIONS[0]);

        bot.say("Alice").await;
        assert_eq!(bot.next_reply().await, SURVEY_QUESTIONS[1]);

        bot.say("  blue ").await;
        assert_eq!(bot.next_reply().await, SURVEY_QUESTIONS[2]);
        assert!(bot.has_scope().await);

        assert!(matches!(bot.say("curiosity").await, Outcome::Completed { .. }));
        let summary = bot.next_reply().await;
        assert!(summary.contains("What is your name? Alice"));
        assert!(summary.contains("What is your favourite colour? blue"));
        assert!(summary.contains("curiosity"));
        assert!(!bot.has_scope().await);
    }

    #[tokio::test]
    async fn survey_keeps_answers_in_scope_data() {
        let mut bot = Bot::new().await;
        bot.say("/survey").await;
        bot.say("Alice").await;

        let key = ScopeKey::new("c1".into(), "alice".into());
        let scope = bot
            .processor
            .store()
            .get(&key)
            .await
            .expect("get")
            .expect("scope");
        assert_eq!(scope.data()["answers"], serde_json::json!(["Alice"]));
    }

    #[tokio::test]
    async fn survey_asks_again_after_non_text_answer() {
        let mut bot = Bot::new().await;
        bot.say("/survey").await;
        assert_eq!(bot.next_reply().await, SURVEY_QUESTIONS[0]);

        let picture = ChatEvent::new(
            "c1".into(),
            "alice".into(),
            EventBody::Message {
                to: None,
                payload: MessagePayload::Data {
                    content_type: "image/png".to_string(),
                    content: serde_json::json!({"size": 10}),
                },
            },
        );
        let outcome = bot
            .processor
            .process(&"c1".into(), picture)
            .await
            .expect("process");
        assert!(matches!(outcome, Outcome::Continued { .. }));
        assert_eq!(
            bot.next_reply().await,
            format!("Please answer in text. {}", SURVEY_QUESTIONS[0])
        );

        let key = ScopeKey::new("c1".into(), "alice".into());
        let scope = bot
            .processor
            .store()
            .get(&key)
            .await
            .expect("get")
            .expect("scope");
        let state: SurveyAnswers = scope.data_as().expect("decode").expect("answers");
        assert!(state.answers.is_empty());

        bot.say("Alice").await;
        assert_eq!(bot.next_reply().await, SURVEY_QUESTIONS[1]);
    }

    #[tokio::test]
    async fn help_lists_every_built_in() {
        let mut bot = Bot::new().await;

        assert!(matches!(bot.say("/help").await, Outcome::Completed { .. }));
        let help = bot.next_reply().await;
        for command in BUILT_INS {
            assert!(help.contains(command.name), "{} missing", command.name);
        }
    }

    #[test]
    fn built_in_patterns_compile() {
        let mut registry = palaver_dispatch::CommandRegistry::new();
        for command in BUILT_INS {
            registry
                .register(command.pattern, ping())
                .expect("pattern compiles");
        }
        assert_eq!(registry.len(), BUILT_INS.len());
    }
}
