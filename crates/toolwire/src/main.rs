//! Run a tool-calling conversation against OpenAI or Gemini and print the
//! answer.
//!
//! Reads the API key from `OPENAI_API_KEY` or `GEMINI_API_KEY`.
//!
//! # Examples
//!
//! ```sh
//! # Plain question
//! toolwire --user "Summarize the Rust 2024 edition changes"
//!
//! # Gemini, piped input, with a system prompt
//! cat notes.md | toolwire --provider gemini --system "Be terse." --stdin
//!
//! # Local shell tools, run in parallel, answer streamed as it arrives
//! toolwire --user "How much disk is free?" --tools tools.json --parallel --stream
//!
//! # Answer tool calls by hand: one JSON value per line on stdin
//! toolwire --user "Pick a number" --tools tools.json --tool-mode pause
//!
//! # Structured answer matching a JSON Schema
//! toolwire --user "Rate this release" --response-schema verdict.json --json
//! ```
//!
//! The tools file is a JSON array of function declarations, each with an
//! `execute` shell template:
//!
//! ```json
//! [{
//!   "type": "function",
//!   "function": {
//!     "name": "disk_free",
//!     "description": "Free space for a path",
//!     "parameters": {"type": "object", "properties": {"path": {"type": "string"}}}
//!   },
//!   "execute": "df -h {{path}}"
//! }]
//! ```

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use serde_json::{Value, json};
use std::io::{self, Read, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use toolwire::prelude::*;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Run a tool-calling conversation and print the model's answer.
///
/// Reads the API key from OPENAI_API_KEY or GEMINI_API_KEY.
#[derive(Parser, Debug)]
#[command(name = "toolwire", version)]
struct Cli {
    // ── Message content ────────────────────────────────────────
    /// System prompt to set the assistant's behavior
    #[arg(long)]
    system: Option<String>,

    /// User message to send
    #[arg(long)]
    user: Option<String>,

    /// Read user content from stdin
    #[arg(long)]
    stdin: bool,

    // ── Provider ───────────────────────────────────────────────
    /// Which API to talk to
    #[arg(long, value_enum, default_value_t = ProviderArg::Openai)]
    provider: ProviderArg,

    /// Model name (defaults per provider)
    #[arg(long)]
    model: Option<String>,

    /// Override the provider's base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Maximum tokens in each response
    #[arg(long)]
    max_tokens: Option<u32>,

    // ── Tool use ───────────────────────────────────────────────
    /// Path to a JSON file defining shell-command tools
    #[arg(long)]
    tools: Option<String>,

    /// Maximum model rounds
    #[arg(long, default_value_t = toolwire::agent::config::DEFAULT_MAX_ROUNDS)]
    max_rounds: u32,

    /// Run each round's tool calls concurrently
    #[arg(long)]
    parallel: bool,

    /// Send failed tool calls back to the model instead of aborting
    #[arg(long)]
    keep_going: bool,

    /// Cache tool results for this many seconds. 0 means entries never
    /// expire and leave the cache only when --cache-size evicts them
    #[arg(long)]
    cache_ttl_secs: Option<u64>,

    /// Maximum cached tool results
    #[arg(long)]
    cache_size: Option<usize>,

    /// Attempts per tool call, including the first
    #[arg(long)]
    retry_attempts: Option<u32>,

    /// Kill a tool call after this many seconds
    #[arg(long)]
    tool_timeout_secs: Option<u64>,

    // ── Output ─────────────────────────────────────────────────
    /// Print the answer as it streams in
    #[arg(long)]
    stream: bool,

    /// How a streaming session runs tool calls
    #[arg(long, value_enum, default_value_t = ToolModeArg::Auto)]
    tool_mode: ToolModeArg,

    /// Print a JSON summary instead of plain text
    #[arg(long)]
    json: bool,

    /// Path to a JSON Schema file; the final answer is requested as JSON
    /// matching it
    #[arg(long)]
    response_schema: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderArg {
    Openai,
    Gemini,
}

impl ProviderArg {
    fn key_var(self) -> &'static str {
        match self {
            Self::Openai => "OPENAI_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            Self::Openai => "gpt-4o-mini",
            Self::Gemini => "gemini-2.0-flash",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ToolModeArg {
    Auto,
    Parallel,
    Pause,
}

impl From<ToolModeArg> for ToolExecutionMode {
    fn from(mode: ToolModeArg) -> Self {
        match mode {
            ToolModeArg::Auto => ToolExecutionMode::Auto,
            ToolModeArg::Parallel => ToolExecutionMode::Parallel,
            ToolModeArg::Pause => ToolExecutionMode::Pause,
        }
    }
}

// ── Tool file types ────────────────────────────────────────────────

#[derive(Deserialize)]
struct ToolFileEntry {
    #[serde(rename = "type", default)]
    #[allow(dead_code)]
    tool_type: Option<String>,
    function: FunctionEntry,
    /// Shell command template. Use {{param_name}} for argument substitution.
    execute: String,
}

#[derive(Deserialize)]
struct FunctionEntry {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "empty_object_schema")]
    parameters: Value,
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// A tool from the tools file, run through `sh -c`.
struct ShellCommandTool {
    name: String,
    template: String,
}

impl ToolHandler for ShellCommandTool {
    fn call(&self, cancel: CancellationToken, arguments: Arguments) -> toolwire::tools::HandlerFuture<'_> {
        Box::pin(async move {
            let cmd = render_command(&self.template, &arguments);
            eprintln!("  [tool] {}: {cmd}", self.name);

            let child = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&cmd)
                .kill_on_drop(true)
                .output();
            let output = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ToolError::Cancelled),
                out = child => out.map_err(|e| {
                    ToolError::failed(format!("failed to run tool '{}': {e}", self.name))
                })?,
            };

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if !output.status.success() {
                return Err(ToolError::with_code(
                    "exit_status",
                    format!(
                        "tool '{}' exited with {}.\nstdout:\n{stdout}\nstderr:\n{stderr}",
                        self.name, output.status
                    ),
                ));
            }
            Ok(Value::String(if stderr.is_empty() {
                stdout
            } else {
                format!("{stdout}\n\n[stderr]\n{stderr}")
            }))
        })
    }
}

/// Load shell-command tools from a JSON file.
fn load_tools(path: &str) -> Result<ToolSet, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read tools file '{path}': {e}"))?;
    let entries: Vec<ToolFileEntry> = serde_json::from_str(&content)
        .map_err(|e| format!("failed to parse tools file '{path}': {e}"))?;

    let mut set = ToolSet::new();
    for entry in entries {
        let FunctionEntry {
            name,
            description,
            parameters,
        } = entry.function;
        set.register(
            ToolSpec::new(name.clone(), description, parameters),
            ShellCommandTool {
                name,
                template: entry.execute,
            },
        );
    }
    Ok(set)
}

/// Substitute {{param}} placeholders in a command template. Placeholders
/// with no matching argument are removed.
fn render_command(template: &str, args: &Arguments) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some((before, after)) = rest.split_once("{{") {
        let Some((key, tail)) = after.split_once("}}") else {
            break;
        };
        out.push_str(before);
        match args.get(key.trim()) {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = tail;
    }
    out.push_str(rest);

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Helpers ────────────────────────────────────────────────────────

fn read_stdin_content() -> Result<String, String> {
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| format!("failed to read stdin: {e}"))?;
    Ok(buf)
}

fn combine_user_content(user: Option<&str>, piped: Option<String>) -> Result<String, String> {
    match (user, piped) {
        (Some(msg), Some(piped)) => Ok(format!("{msg}\n\n{piped}")),
        (Some(msg), None) => Ok(msg.to_string()),
        (None, Some(piped)) => Ok(piped),
        (None, None) => Err("provide --user, --stdin, or both".to_string()),
    }
}

fn build_executor_config(cli: &Cli) -> ExecutorConfig {
    let mut config = ExecutorConfig::default()
        .with_parallel(cli.parallel)
        .with_stop_on_error(!cli.keep_going);
    if cli.cache_ttl_secs.is_some() || cli.cache_size.is_some() {
        let mut cache = CacheConfig::default();
        if let Some(secs) = cli.cache_ttl_secs {
            cache = cache.with_ttl(Duration::from_secs(secs));
        }
        if let Some(size) = cli.cache_size {
            cache = cache.with_max_entries(size);
        }
        config = config.with_cache(cache);
    }
    if let Some(attempts) = cli.retry_attempts {
        config = config.with_retry(RetryConfig::with_attempts(attempts));
    }
    if let Some(secs) = cli.tool_timeout_secs {
        config = config.with_timeout(Duration::from_secs(secs));
    }
    config
}

/// Load a response schema. Only object schemas are accepted.
fn load_schema(path: &str) -> Result<Value, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read schema file '{path}': {e}"))?;
    let schema: Value = serde_json::from_str(&content)
        .map_err(|e| format!("failed to parse schema file '{path}': {e}"))?;
    if !schema.is_object() {
        return Err(format!("schema file '{path}' must contain a JSON object"));
    }
    Ok(schema)
}

fn build_loop_config(cli: &Cli) -> Result<LoopConfig, String> {
    let model = cli
        .model
        .clone()
        .unwrap_or_else(|| cli.provider.default_model().to_string());
    let mut config = LoopConfig::new(model)
        .with_max_rounds(cli.max_rounds)
        .with_streaming(cli.stream)
        .with_executor(build_executor_config(cli));
    if let Some(t) = cli.temperature {
        config = config.with_temperature(t);
    }
    if let Some(n) = cli.max_tokens {
        config = config.with_max_output_tokens(n);
    }
    if let Some(path) = &cli.response_schema {
        config = config.with_response_schema(load_schema(path)?);
    }
    Ok(config)
}

/// Interpret one line typed in pause mode. `{"error": "..."}` reports a
/// failure; any other JSON value is the result; anything that is not JSON
/// is taken as a plain string.
fn parse_submitted(line: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(line.trim()) {
        Ok(Value::Object(obj)) if obj.len() == 1 && obj.contains_key("error") => {
            Err(match &obj["error"] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        }
        Ok(v) => Ok(v),
        Err(_) => Ok(Value::String(line.trim().to_string())),
    }
}

/// Prints round and tool activity to stderr.
struct CliEventHandler {
    echo_text: bool,
}

impl EventHandler for CliEventHandler {
    fn on_event(&self, event: &LoopEvent<'_>) {
        match event {
            LoopEvent::RoundStart { round, max_rounds } => {
                eprintln!("  [round {round}/{max_rounds}]");
            }
            LoopEvent::ToolResult(result) if !result.is_ok() => {
                eprintln!("  [tool_error] {}: {}", result.name, result.content_string());
            }
            LoopEvent::TextDelta(text) if self.echo_text => {
                print!("{text}");
                let _ = io::stdout().flush();
            }
            _ => {}
        }
    }
}

// ── Runs ───────────────────────────────────────────────────────────

async fn run_loop<P: Provider>(
    cli: &Cli,
    provider: &P,
    tools: &ToolSet,
    prompt: Prompt,
) -> Result<String, String> {
    let config = build_loop_config(cli)?;
    let executor = ToolExecutor::new(tools, config.executor.clone());
    let handler = CliEventHandler {
        echo_text: cli.stream && !cli.json,
    };

    let result = ToolLoop::new(provider, &executor, config)
        .with_event_handler(&handler)
        .run(prompt)
        .await
        .map_err(|e| e.to_string())?;

    if cli.json {
        let summary = json!({
            "trace_id": result.trace_id,
            "text": result.text,
            "answer_json": result.json(),
            "structured": result.structured,
            "usage": result.usage,
            "rounds_used": result.rounds_used,
            "tool_calls": result.tool_results.len(),
            "metrics": executor.metrics(),
        });
        return serde_json::to_string_pretty(&summary)
            .map_err(|e| format!("failed to format summary: {e}"));
    }
    if cli.stream {
        Ok("\n".to_string())
    } else {
        Ok(result.text)
    }
}

async fn run_session<P: Provider + 'static>(
    cli: &Cli,
    provider: P,
    tools: &ToolSet,
    prompt: Prompt,
) -> Result<String, String> {
    let config = build_loop_config(cli)?;
    let executor = Arc::new(ToolExecutor::new(tools, config.executor.clone()));
    let options = StreamOptions::default().with_tool_execution_mode(cli.tool_mode.into());
    let mut handle = ToolStream::new(Arc::new(provider), executor, config)
        .with_options(options)
        .start(prompt);

    let mut answers = BufReader::new(tokio::io::stdin()).lines();
    let mut text = String::new();
    let mut usage = Usage::default();
    let mut model = String::new();

    while let Some(event) = handle.next().await {
        match event.kind {
            StreamEventKind::Chunk(chunk) => {
                if !cli.json {
                    print!("{chunk}");
                    let _ = io::stdout().flush();
                }
                text.push_str(&chunk);
            }
            StreamEventKind::ToolCallRequest(call) => {
                eprintln!("  [tool_call] {}({}) id={}", call.name, call.raw_arguments, call.id);
                if cli.tool_mode != ToolModeArg::Pause {
                    continue;
                }
                eprint!("  result for {}> ", call.id);
                let line = answers
                    .next_line()
                    .await
                    .map_err(|e| format!("failed to read tool result: {e}"))?;
                let submitted = match line {
                    Some(line) => match parse_submitted(&line) {
                        Ok(v) => handle.submit_tool_result(&call.id, v),
                        Err(msg) => handle.submit_tool_error(&call.id, msg),
                    },
                    None => handle.submit_tool_error(&call.id, "no result provided"),
                };
                submitted.map_err(|e| e.to_string())?;
            }
            StreamEventKind::ToolCallResult(result) if !result.is_ok() => {
                eprintln!("  [tool_error] {}: {}", result.name, result.content_string());
            }
            StreamEventKind::ToolCallResult(_) => {}
            StreamEventKind::Usage(u) => usage.add(&u),
            StreamEventKind::Done { model: m } => model = m,
            StreamEventKind::Error(e) => return Err(e.to_string()),
        }
    }

    if cli.json {
        let structured = cli
            .response_schema
            .as_ref()
            .and_then(|_| serde_json::from_str::<Value>(text.trim()).ok());
        let summary = json!({
            "model": model,
            "provider": cli.provider_kind(),
            "text": text,
            "structured": structured,
            "usage": usage,
        });
        return serde_json::to_string_pretty(&summary)
            .map_err(|e| format!("failed to format summary: {e}"));
    }
    Ok("\n".to_string())
}

impl Cli {
    fn provider_kind(&self) -> ProviderKind {
        match self.provider {
            ProviderArg::Openai => ProviderKind::OpenAi,
            ProviderArg::Gemini => ProviderKind::Gemini,
        }
    }

    /// Tool modes other than the default need a streaming session.
    fn wants_session(&self) -> bool {
        self.tool_mode != ToolModeArg::Auto || (self.stream && self.tools.is_some())
    }
}

async fn dispatch<P: Provider + 'static>(
    cli: &Cli,
    provider: P,
    tools: &ToolSet,
    prompt: Prompt,
) -> Result<String, String> {
    if cli.wants_session() {
        run_session(cli, provider, tools, prompt).await
    } else {
        run_loop(cli, &provider, tools, prompt).await
    }
}

async fn run(cli: &Cli) -> Result<String, String> {
    if cli.stdin && cli.tool_mode == ToolModeArg::Pause {
        return Err("--stdin cannot be combined with --tool-mode pause".to_string());
    }
    let api_key = std::env::var(cli.provider.key_var())
        .map_err(|_| format!("{} environment variable is not set", cli.provider.key_var()))?;

    let piped = if cli.stdin {
        Some(read_stdin_content()?)
    } else {
        None
    };
    let mut prompt = Prompt::new(combine_user_content(cli.user.as_deref(), piped)?);
    if let Some(system) = &cli.system {
        prompt = prompt.with_system(system.clone());
    }

    let tools = match &cli.tools {
        Some(path) => {
            let set = load_tools(path)?;
            eprintln!("  Loaded {} tool(s) from {path}", set.len());
            set
        }
        None => ToolSet::new(),
    };

    match cli.provider {
        ProviderArg::Openai => {
            let mut provider = OpenAiProvider::new(api_key).map_err(|e| e.to_string())?;
            if let Some(url) = &cli.base_url {
                provider = provider.with_base_url(url.clone());
            }
            dispatch(cli, provider, &tools, prompt).await
        }
        ProviderArg::Gemini => {
            let mut provider = GeminiProvider::new(api_key).map_err(|e| e.to_string())?;
            if let Some(url) = &cli.base_url {
                provider = provider.with_base_url(url.clone());
            }
            dispatch(cli, provider, &tools, prompt).await
        }
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    match run(&cli).await {
        Ok(response) => print!("{response}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
