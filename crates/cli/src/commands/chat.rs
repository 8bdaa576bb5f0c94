//! `parley chat`: Interactive or single-message chat mode.

use std::io::Write;
use std::sync::Arc;

use parley_agent::{ChatService, Orchestrator, OrchestratorSettings, TurnEvent, TurnHandle, TurnResult};
use parley_config::AppConfig;
use parley_core::session::SessionId;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::debug;

type Input = Lines<BufReader<Stdin>>;

pub async fn run(config: &AppConfig, message: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let provider = parley_providers::build_from_config(&config.engine)
        .map_err(|e| format!("Failed to set up the engine: {e}"))?;
    let tools = Arc::new(parley_tools::default_registry(&config.tools.output_dir)?);
    let settings = OrchestratorSettings::from_config(config);
    let orchestrator =
        Orchestrator::connect(provider, tools, settings, config.engine.context_window).await;
    let chat = ChatService::in_memory(orchestrator);
    let session = SessionId::new();
    debug!(session_id = %session, "Chat session started");
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    if let Some(msg) = message {
        return converse(&chat, &session, msg, &mut input).await;
    }

    println!();
    println!("  Parley: Interactive Mode");
    println!();
    println!("  Engine:    {}", config.engine.provider);
    println!("  Model:     {}", config.engine.model);
    println!("  Window:    {} tokens", chat.orchestrator().context_window());
    println!("  Tools:     {}", chat.orchestrator().tools().names().join(", "));
    println!();
    println!("  Type your message and press Enter. Ctrl+C stops a reply.");
    println!("  Type '/reset' to start over, 'exit' to quit.");
    println!();

    loop {
        prompt("  You > ")?;
        let Some(line) = input.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "exit" | "quit" => break,
            "/reset" => {
                chat.reset(&session).await?;
                println!("  (conversation cleared)");
                continue;
            }
            _ => {}
        }
        converse(&chat, &session, line.to_string(), &mut input).await?;
        println!();
    }

    println!();
    println!("  Goodbye!");
    Ok(())
}

/// Run one user turn, answering pending tool requests until it settles.
async fn converse(
    chat: &ChatService,
    session: &SessionId,
    text: String,
    input: &mut Input,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut handle = chat.submit_turn_stream(session, text);
    loop {
        let result = render(&mut handle).await?;
        let TurnResult::PendingTool { tool_call, request } = result else {
            report(&result);
            return Ok(());
        };

        println!();
        println!("  [{}] {}", tool_call.name, describe_request(&request));
        prompt("  Result > ")?;
        let Some(line) = input.next_line().await? else {
            return Ok(());
        };
        handle = chat.resume_turn_stream(session, tool_call.id, parse_payload(&line));
    }
}

/// Print events as they arrive. Ctrl+C cancels the turn.
async fn render(handle: &mut TurnHandle) -> Result<TurnResult, Box<dyn std::error::Error>> {
    let mut started = false;
    loop {
        let event = tokio::select! {
            event = handle.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                handle.cancel();
                continue;
            }
        };
        let Some(event) = event else {
            return Err("turn ended without a result".into());
        };
        match event {
            TurnEvent::TextDelta { content } => {
                if !started {
                    print!("  Assistant > ");
                    started = true;
                }
                print!("{content}");
                std::io::stdout().flush()?;
            }
            TurnEvent::ToolCall { name, arguments, .. } => {
                end_line(&mut started);
                eprintln!("  [tool] {name} {arguments}");
            }
            TurnEvent::ToolResult {
                name,
                success,
                output,
                ..
            } => {
                let status = if success { "ok" } else { "failed" };
                eprintln!("  [tool] {name} {status}: {}", truncate(&output, 200));
            }
            TurnEvent::Discarded { reason } => {
                end_line(&mut started);
                eprintln!("  (discarded: {reason})");
            }
            TurnEvent::Done { result } => {
                end_line(&mut started);
                return Ok(result);
            }
        }
    }
}

fn report(result: &TurnResult) {
    if let TurnResult::Error { detail } = result {
        if let Some(partial) = &detail.partial_answer {
            println!("  Assistant > {partial}");
        }
        eprintln!("  [{}] {}", detail.kind, detail.message);
    }
}

fn end_line(started: &mut bool) {
    if *started {
        println!();
        *started = false;
    }
}

fn prompt(text: &str) -> std::io::Result<()> {
    print!("{text}");
    std::io::stdout().flush()
}

fn describe_request(request: &Value) -> String {
    match request.get("prompt").and_then(Value::as_str) {
        Some(prompt) => {
            let media = request.get("media").and_then(Value::as_str).unwrap_or("input");
            format!("{prompt} ({media})")
        }
        None => request.to_string(),
    }
}

/// A line of JSON is passed through; anything else is sent as text.
pub fn parse_payload(line: &str) -> Value {
    let line = line.trim();
    serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
