//! Minimal example plugin: greetings, streaming, and a passthrough conversation.

use anyhow::Result;
use gassist_plugin_sdk::config::PluginConfig;
use gassist_plugin_sdk::telemetry::init_tracing;
use gassist_plugin_sdk::utf8_safe::ellipsize;
use gassist_plugin_sdk::{CommandContext, Plugin};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;
use std::thread;
use std::time::Duration;
use tracing::info;

const PLUGIN_NAME: &str = "hello-world";
const DESCRIPTION: &str = "A simple Hello World plugin demonstrating the G-Assist SDK";

const MAX_COUNT: u64 = 20;
const DEFAULT_COUNT: u64 = 5;
const DEFAULT_DELAY_MS: u64 = 300;
const SUMMARY_MESSAGES: usize = 5;
const SUMMARY_PREVIEW_CHARS: usize = 50;
const EXIT_WORDS: &[&str] = &["exit", "quit", "bye", "done"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    User,
    Assistant,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<(Role, String)>,
}

impl Conversation {
    fn reset(&mut self) {
        self.messages.clear();
    }

    fn push(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push((role, content.into()));
    }

    fn summary(&self) -> Option<String> {
        if self.messages.is_empty() {
            return None;
        }
        let start = self.messages.len().saturating_sub(SUMMARY_MESSAGES);
        let lines: Vec<String> = self.messages[start..]
            .iter()
            .map(|(role, content)| {
                format!(
                    "- **{}**: {}",
                    role.label(),
                    ellipsize(content, SUMMARY_PREVIEW_CHARS)
                )
            })
            .collect();
        Some(lines.join("\n"))
    }
}

fn main() -> Result<()> {
    let config = PluginConfig::parse_args()?;
    init_tracing(&config.log_settings(PLUGIN_NAME));
    info!("starting {PLUGIN_NAME} plugin");

    let mut plugin = Plugin::new(PLUGIN_NAME, env!("CARGO_PKG_VERSION"), DESCRIPTION);
    register_commands(&mut plugin);
    let reason = plugin.run();
    info!(?reason, "{PLUGIN_NAME} plugin exiting");
    Ok(())
}

fn register_commands<R: Read, W: Write>(plugin: &mut Plugin<R, W>) {
    let conversation = Rc::new(RefCell::new(Conversation::default()));

    plugin.command_with_description(
        "say_hello",
        "Greet the user with a personalized message",
        |ctx: &mut CommandContext<'_>, args: Value| {
            let name = args
                .get("name")
                .and_then(Value::as_str)
                .filter(|name| !name.trim().is_empty())
                .unwrap_or("World");
            info!(name, context_turns = ctx.context().len(), "greeting");
            Ok(json!(format!("Hello, {name}! Welcome to G-Assist plugins.")))
        },
    );

    plugin.command_with_description(
        "count_with_streaming",
        "Count from 1 to N, streaming each number",
        |ctx: &mut CommandContext<'_>, args: Value| {
            let count_to = args
                .get("count_to")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_COUNT)
                .clamp(1, MAX_COUNT);
            let delay = Duration::from_millis(
                args.get("delay_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_DELAY_MS),
            );
            info!(count_to, "counting");

            ctx.stream(format!("Counting to {count_to}...\n\n"));
            for n in 1..=count_to {
                ctx.stream(format!("{n}\n"));
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            ctx.stream(format!("\nDone counting to {count_to}!"));
            // Everything was streamed.
            Ok(json!(""))
        },
    );

    let state = Rc::clone(&conversation);
    plugin.command_with_description(
        "start_conversation",
        "Start an interactive conversation",
        move |ctx: &mut CommandContext<'_>, args: Value| {
            let topic = args
                .get("topic")
                .and_then(Value::as_str)
                .unwrap_or("anything");
            info!(topic, "starting conversation");

            let mut conversation = state.borrow_mut();
            conversation.reset();
            conversation.push(Role::User, format!("Let's talk about {topic}"));
            ctx.set_keep_session(true);

            Ok(json!(format!(
                "Starting a conversation about: {topic}\n\n\
                 I'm now in conversation mode! You can:\n\
                 - Send messages and I'll echo them back\n\
                 - Type \"summary\" to see our conversation so far\n\
                 - Type \"exit\" to end the conversation\n\n\
                 What would you like to say?"
            )))
        },
    );

    let state = Rc::clone(&conversation);
    plugin.command_with_description(
        gassist_plugin_sdk::ipc::protocol::ON_INPUT_COMMAND,
        "Handle follow-up messages in conversation mode",
        move |ctx: &mut CommandContext<'_>, args: Value| {
            let content = args
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            let lowered = content.to_lowercase();
            let mut conversation = state.borrow_mut();

            if EXIT_WORDS.contains(&lowered.as_str()) {
                conversation.reset();
                ctx.set_keep_session(false);
                return Ok(json!("Goodbye! Conversation ended."));
            }

            ctx.set_keep_session(true);
            if lowered == "summary" {
                let reply = match conversation.summary() {
                    Some(summary) => format!(
                        "**Conversation Summary** (last {SUMMARY_MESSAGES} messages):\n\n{summary}\n\n\
                         Continue chatting or type 'exit' to end."
                    ),
                    None => "No conversation yet! Say something first.".to_string(),
                };
                return Ok(json!(reply));
            }

            conversation.push(Role::User, content.clone());
            let reply = format!(
                "You said: \"{content}\"\n\n(Message #{} in our conversation)",
                conversation.messages.len()
            );
            conversation.push(Role::Assistant, reply.clone());
            Ok(json!(reply))
        },
    );
}
