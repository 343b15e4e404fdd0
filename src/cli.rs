//! Command-line interface of the demo binary.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use ai_connect::config::AppConfig;
use ai_connect::{AiClient, StreamOutcome};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

/// Talk to OpenAI, Gemini, Claude and DeepSeek through one client
#[derive(Parser, Debug)]
#[command(name = "ai-connect")]
#[command(version, about = "Talk to OpenAI, Gemini, Claude and DeepSeek through one client")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Platform: openai, openai-compatible, gemini, claude or deepseek
    #[arg(long, global = true)]
    pub platform: Option<String>,

    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Send requests here instead of the platform's default URL
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// System prompt
    #[arg(long, global = true)]
    pub system: Option<String>,

    /// Sampling temperature, clamped to 0..=2
    #[arg(long, global = true)]
    pub temperature: Option<f64>,

    #[arg(long, global = true)]
    pub max_tokens: Option<u32>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one message and print the reply
    Chat { message: String },

    /// Print the reply as it is generated
    Stream { message: String },

    /// Tool-calling conversation; tool results are read from stdin
    Tools(ToolsArgs),
}

#[derive(Args, Debug)]
pub struct ToolsArgs {
    /// JSON file holding an array of tool definitions
    #[arg(long)]
    pub tools: PathBuf,

    pub message: String,
}

impl Cli {
    /// Command-line flags win over the config file.
    pub fn apply_to_config(&self, config: &mut AppConfig) {
        if let Some(platform) = &self.platform {
            config.ai.platform = platform.clone();
        }
        if let Some(model) = &self.model {
            config.ai.model = model.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.ai.endpoint = Some(endpoint.clone());
        }
        if let Some(system) = &self.system {
            config.ai.system_role = Some(system.clone());
        }
    }

    /// Apply generation settings to all three kinds of exchange.
    pub fn apply_to_client(&self, client: &mut AiClient, system_role: Option<&str>) {
        if let Some(system) = system_role {
            client.set_chat_system_role(system);
            client.set_stream_chat_system_role(system);
            client.set_tc_chat_system_role(system);
        }
        if let Some(temperature) = self.temperature {
            client.set_chat_temperature(temperature);
            client.set_stream_chat_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            client.set_chat_max_tokens(max_tokens);
            client.set_stream_chat_max_tokens(max_tokens);
            client.set_tc_chat_max_tokens(max_tokens);
            client.set_tc_reply_max_tokens(max_tokens);
        }
    }
}

pub fn run_chat(client: &mut AiClient, message: &str) -> Result<()> {
    let reply = client.chat(message)?;
    println!("{}", reply);
    report_usage(client);
    Ok(())
}

pub fn run_stream(client: &mut AiClient, message: &str) -> Result<()> {
    let mut stdout = io::stdout().lock();
    // A closed stdout cancels the stream.
    let outcome = client.stream_chat(message, |chunk| {
        write!(stdout, "{}", chunk.content)
            .and_then(|_| stdout.flush())
            .is_ok()
    })?;
    println!();
    if outcome == StreamOutcome::Cancelled {
        eprintln!("[Stream] Cancelled after {} chunks", client.stream_chunk_count());
    }
    report_usage(client);
    Ok(())
}

pub fn run_tools(client: &mut AiClient, args: &ToolsArgs) -> Result<()> {
    let tools = load_tools(&args.tools)?;
    client.set_tc_tools(tools.as_slice())?;

    let mut reply = client.tc_chat(&args.message)?;
    let stdin = io::stdin();
    while client.has_pending_tool_calls() {
        println!("{}", reply);
        eprintln!("[Tools] Enter the tool results as a JSON array on one line:");
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            bail!("stdin closed while tool results were pending");
        }
        reply = client.tc_reply(line.trim())?;
    }
    println!("{}", reply);
    report_usage(client);
    Ok(())
}

/// Read a tool file into one JSON text per definition.
pub fn load_tools(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tool file: {}", path.display()))?;
    parse_tools(&raw).with_context(|| format!("Invalid tool file: {}", path.display()))
}

fn parse_tools(raw: &str) -> Result<Vec<String>> {
    let definitions: Vec<serde_json::Value> =
        serde_json::from_str(raw).context("Expected a JSON array of tool definitions")?;
    if definitions.is_empty() {
        bail!("The tool file defines no tools");
    }
    Ok(definitions.iter().map(|d| d.to_string()).collect())
}

fn report_usage(client: &AiClient) {
    if let Some(tokens) = client.total_tokens() {
        eprintln!(
            "[Usage] {} tokens, finish reason: {}",
            tokens,
            client.finish_reason().unwrap_or("unknown")
        );
    }
}
