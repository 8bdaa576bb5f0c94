//! Tool injection: tell the engine which tools exist.
//!
//! Engines with a native tool field get the definitions there. Others get a
//! system message holding the schemas and the markup format, identified by
//! a stable marker so it is never injected twice. In inline mode, tool-call
//! history is also rewritten as markup, since such engines have no tool role.

use parley_core::message::{Message, Role};
use parley_core::provider::{ProviderRequest, ToolDefinition};

use crate::context::token::TokenCounter;

/// Marks the injected schema block.
pub const TOOL_SCHEMA_MARKER: &str = "<!-- parley:tool-schemas -->";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionMode {
    /// Definitions go in the request's tool field.
    Native,
    /// Definitions go in a system message; calls are embedded as markup.
    Inline,
}

#[derive(Debug, Clone, Copy)]
pub struct ToolInjector {
    mode: InjectionMode,
}

impl ToolInjector {
    pub fn new(mode: InjectionMode) -> Self {
        Self { mode }
    }

    /// Native only if the engine supports it and configuration asks for it.
    pub fn for_engine(supports_native: bool, prefer_native: bool) -> Self {
        if supports_native && prefer_native {
            Self::new(InjectionMode::Native)
        } else {
            Self::new(InjectionMode::Inline)
        }
    }

    pub fn mode(&self) -> InjectionMode {
        self.mode
    }

    /// Attach `tools` to `request`. Applying it twice is the same as once.
    pub fn inject(&self, mut request: ProviderRequest, tools: &[ToolDefinition]) -> ProviderRequest {
        match self.mode {
            InjectionMode::Native => {
                request.tools = tools.to_vec();
            }
            InjectionMode::Inline => {
                request.tools.clear();
                inline_tool_history(&mut request.messages);
                let present = request
                    .messages
                    .iter()
                    .any(|m| m.role == Role::System && m.content.contains(TOOL_SCHEMA_MARKER));
                if !tools.is_empty() && !present {
                    let at = request
                        .messages
                        .iter()
                        .take_while(|m| m.role == Role::System)
                        .count();
                    request
                        .messages
                        .insert(at, Message::system(render_schema_block(tools)));
                }
            }
        }
        request
    }

    /// Tokens the injected tools will cost.
    pub fn overhead(&self, tools: &[ToolDefinition], counter: &dyn TokenCounter) -> usize {
        if tools.is_empty() {
            return 0;
        }
        match self.mode {
            InjectionMode::Native => counter.count_tools(tools),
            InjectionMode::Inline => {
                counter.count_message(&Message::system(render_schema_block(tools)))
            }
        }
    }
}

/// The system message text describing the tools and the call format.
pub fn render_schema_block(tools: &[ToolDefinition]) -> String {
    let schemas = serde_json::to_string_pretty(tools).unwrap_or_default();
    format!(
        "{TOOL_SCHEMA_MARKER}\n\
         You can call the tools below. To call one, reply with a block like\n\
         <tool_call>{{\"name\": \"<tool name>\", \"arguments\": {{...}}}}</tool_call>\n\
         Use one block per call, then stop and wait for the results.\n\n\
         Available tools:\n{schemas}"
    )
}

fn inline_tool_history(messages: &mut [Message]) {
    for message in messages.iter_mut() {
        inline_message(message);
    }
}

/// Rewrite one message the way inline mode sends it: assistant tool calls
/// become markup and tool results become user messages.
pub fn inline_message(message: &mut Message) {
    match message.role {
        Role::Assistant if message.has_tool_calls() => {
            for call in std::mem::take(&mut message.tool_calls) {
                let arguments: serde_json::Value =
                    serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::String(call.arguments));
                let block = serde_json::json!({ "name": call.name, "arguments": arguments });
                if !message.content.is_empty() {
                    message.content.push('\n');
                }
                message.content.push_str(&format!("<tool_call>{block}</tool_call>"));
            }
        }
        Role::Tool => {
            let name = message.name.take().unwrap_or_default();
            let id = message.tool_call_id.take().unwrap_or_default();
            message.role = Role::User;
            message.content = format!(
                "<tool_result name=\"{name}\" id=\"{id}\">\n{}\n</tool_result>",
                message.content
            );
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::token::CharHeuristic;
    use parley_core::message::MessageToolCall;

    fn tools() -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "text_stats".into(),
            description: "Count words".into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }]
    }

    fn request(messages: Vec<Message>) -> ProviderRequest {
        ProviderRequest {
            model: "m".into(),
            messages,
            temperature: 0.7,
            max_tokens: None,
            tools: vec![],
            stream: false,
            stop: vec![],
        }
    }

    #[test]
    fn native_mode_uses_the_tool_field() {
        let injector = ToolInjector::new(InjectionMode::Native);
        let out = injector.inject(request(vec![Message::user("hi")]), &tools());
        assert_eq!(out.tools.len(), 1);
        assert_eq!(out.messages.len(), 1);
    }

    #[test]
    fn inline_mode_adds_one_marked_block_after_system_messages() {
        let injector = ToolInjector::new(InjectionMode::Inline);
        let out = injector.inject(
            request(vec![Message::system("sys"), Message::user("hi")]),
            &tools(),
        );
        assert!(out.tools.is_empty());
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[0].content, "sys");
        assert!(out.messages[1].content.starts_with(TOOL_SCHEMA_MARKER));
        assert!(out.messages[1].content.contains("text_stats"));
    }

    #[test]
    fn injection_is_idempotent() {
        let history = vec![
            Message::system("sys"),
            Message::user("go"),
            Message::assistant_with_calls(
                "checking",
                vec![MessageToolCall {
                    id: "c1".into(),
                    name: "text_stats".into(),
                    arguments: r#"{"text":"hi"}"#.into(),
                }],
            ),
            Message::tool_result("c1", "text_stats", "2 words"),
        ];
        for mode in [InjectionMode::Native, InjectionMode::Inline] {
            let injector = ToolInjector::new(mode);
            let once = injector.inject(request(history.clone()), &tools());
            let twice = injector.inject(once.clone(), &tools());
            assert_eq!(once, twice, "{mode:?}");
        }
    }

    #[test]
    fn inline_mode_rewrites_tool_history_as_markup() {
        let injector = ToolInjector::new(InjectionMode::Inline);
        let out = injector.inject(
            request(vec![
                Message::user("go"),
                Message::assistant_with_calls(
                    "",
                    vec![MessageToolCall {
                        id: "c1".into(),
                        name: "text_stats".into(),
                        arguments: r#"{"text":"hi"}"#.into(),
                    }],
                ),
                Message::tool_result("c1", "text_stats", "2 words"),
            ]),
            &tools(),
        );
        assert!(out.messages.iter().all(|m| m.role != Role::Tool));
        assert!(out.messages.iter().all(|m| !m.has_tool_calls()));
        assert!(out.messages[2].content.contains("<tool_call>"));
        assert!(out.messages[3].content.contains("2 words"));
    }

    #[test]
    fn no_tools_means_no_block() {
        let injector = ToolInjector::new(InjectionMode::Inline);
        let out = injector.inject(request(vec![Message::user("hi")]), &[]);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(injector.overhead(&[], &CharHeuristic::default()), 0);
    }

    #[test]
    fn overhead_matches_what_is_injected() {
        let counter = CharHeuristic::default();
        let inline = ToolInjector::new(InjectionMode::Inline);
        let block = Message::system(render_schema_block(&tools()));
        assert_eq!(inline.overhead(&tools(), &counter), counter.count_message(&block));
        let native = ToolInjector::new(InjectionMode::Native);
        assert_eq!(native.overhead(&tools(), &counter), counter.count_tools(&tools()));
    }
}
