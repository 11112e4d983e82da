#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps,
    dead_code
)]

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use agora::config::Config;
use agora::gateway;
use agora::orchestrator::{Orchestrator, QueryRequest, Reply};
use agora::providers;

/// `Agora` - route chat queries to specialised agents.
#[derive(Parser, Debug)]
#[command(name = "agora")]
#[command(version)]
#[command(about = "Multi-agent chat gateway with per-agent session memory.", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket gateway
    #[command(long_about = "\
Start the HTTP/WebSocket gateway.

Serves POST /chat, GET /chat/ws, GET /agents and GET /health. Bind \
address defaults to the values in your config file (gateway.host / \
gateway.port).

Examples:
  agora gateway                  # use config defaults
  agora gateway -p 8080          # listen on port 8080
  agora gateway --host 0.0.0.0   # bind to all interfaces")]
    Gateway {
        /// Port to listen on; defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,
    },

    /// List the agents that load with the current config
    Agents,

    /// Send one query through the router and print the reply
    #[command(long_about = "\
Send one query and print the reply.

The query is routed exactly as the gateway would route it: an explicit \
--agent wins, then a leading slash command, then keyword matching, then \
the default agent.

Examples:
  agora chat -m \"find me a cheap laptop\"
  agora chat -m \"/paper_writer outline a survey on RAG\"
  agora chat -m \"and the intro?\" --session my-thread --stream")]
    Chat {
        /// The query text
        #[arg(short, long)]
        message: String,

        /// Agent to use, bypassing routing
        #[arg(short, long)]
        agent: Option<String>,

        /// Session to continue; a new one is created when omitted
        #[arg(short, long)]
        session: Option<String>,

        /// Print fragments as they arrive
        #[arg(long)]
        stream: bool,
    },

    /// Inspect or clear stored conversations
    #[command(long_about = "\
Inspect and manage per-agent session memory.

Examples:
  agora memory show --agent shopper --session abc
  agora memory clear --agent shopper --session abc
  agora memory prune --agent paper_writer --session abc --keep 20")]
    Memory {
        #[command(subcommand)]
        memory_command: MemoryCommands,
    },

    /// Manage configuration
    #[command(long_about = "\
Manage Agora configuration.

Examples:
  agora config schema              # print JSON Schema to stdout
  agora config schema > schema.json")]
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}

#[derive(Subcommand, Debug)]
enum MemoryCommands {
    /// Print the most recent messages of a session
    Show {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        session: String,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Delete every message of a session
    Clear {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        session: String,
    },
    /// Keep only the newest messages of a session
    Prune {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        session: String,
        #[arg(long, default_value = "20")]
        keep: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("AGORA_CONFIG_DIR", config_dir);
    }

    // Schema output must stay clean JSON on stdout.
    if let Commands::Config {
        config_command: ConfigCommands::Schema,
    } = &cli.command
    {
        let schema = schemars::schema_for!(Config);
        println!(
            "{}",
            serde_json::to_string_pretty(&schema).context("failed to serialize JSON Schema")?
        );
        return Ok(());
    }

    // Respects RUST_LOG, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    // Env overrides and validation are applied while loading.
    let mut config = Config::load_or_init().await?;

    match cli.command {
        Commands::Config { .. } => Ok(()),

        Commands::Gateway { port, host } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(host) = host {
                config.gateway.host = host;
            }
            let orchestrator = Arc::new(build_orchestrator(&config)?);
            info!(
                "Starting Agora gateway on {}:{}",
                config.gateway.host, config.gateway.port
            );
            gateway::run_gateway(&config.gateway, orchestrator).await
        }

        Commands::Agents => {
            let orchestrator = build_orchestrator(&config)?;
            let agents = orchestrator.list_available_agents().await;
            println!("Available agents ({} total):\n", agents.len());
            for agent in &agents {
                let marker = if agent.name == config.agents.default_agent {
                    " (default)"
                } else {
                    ""
                };
                println!(
                    "  {:<16} {:<16} {}{}",
                    agent.name, agent.model, agent.description, marker
                );
            }
            Ok(())
        }

        Commands::Chat {
            message,
            agent,
            session,
            stream,
        } => {
            let orchestrator = build_orchestrator(&config)?;
            let session_id = session
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let outcome = orchestrator
                .handle_query(QueryRequest {
                    query: message,
                    session_id,
                    agent_name: agent,
                    stream,
                })
                .await?;
            eprintln!(
                "[{} via {}] session {}",
                outcome.agent, outcome.matched_by, outcome.session_id
            );

            match outcome.reply {
                Reply::Complete(text) => println!("{text}"),
                Reply::Stream(mut fragments) => {
                    let mut stdout = std::io::stdout().lock();
                    while let Some(fragment) = fragments.next().await {
                        stdout.write_all(fragment.as_bytes())?;
                        stdout.flush()?;
                    }
                    writeln!(stdout)?;
                }
            }
            Ok(())
        }

        Commands::Memory { memory_command } => {
            let orchestrator = build_orchestrator(&config)?;
            handle_memory_command(&orchestrator, memory_command).await
        }
    }
}

fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let provider = providers::create_provider(
        config.default_provider.as_deref().unwrap_or("openai"),
        config.api_key.as_deref(),
        config.api_url.as_deref(),
    )?;
    Orchestrator::from_config(config, Arc::from(provider))
}

async fn handle_memory_command(orchestrator: &Orchestrator, command: MemoryCommands) -> Result<()> {
    match command {
        MemoryCommands::Show {
            agent,
            session,
            limit,
        } => {
            let messages = orchestrator.history(&agent, &session, limit).await?;
            if messages.is_empty() {
                println!("No messages for {agent}/{session}.");
                return Ok(());
            }
            for message in &messages {
                println!(
                    "[{}] {:<9} {}",
                    message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    message.role,
                    message.content
                );
            }
            Ok(())
        }
        MemoryCommands::Clear { agent, session } => {
            orchestrator.clear_session(&agent, &session).await?;
            println!("Cleared {agent}/{session}.");
            Ok(())
        }
        MemoryCommands::Prune {
            agent,
            session,
            keep,
        } => {
            let removed = orchestrator.prune_session(&agent, &session, keep).await?;
            println!("Removed {removed} message(s) from {agent}/{session}.");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, Parser};

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn chat_cli_parses_routing_flags() {
        let cli = Cli::try_parse_from([
            "agora", "chat", "-m", "buy socks", "--agent", "shopper", "--stream",
        ])
        .expect("chat invocation should parse");
        match cli.command {
            Commands::Chat {
                message,
                agent,
                session,
                stream,
            } => {
                assert_eq!(message, "buy socks");
                assert_eq!(agent.as_deref(), Some("shopper"));
                assert!(session.is_none());
                assert!(stream);
            }
            other => panic!("expected chat command, got {other:?}"),
        }
    }

    #[test]
    fn memory_prune_defaults_keep() {
        let cli = Cli::try_parse_from([
            "agora", "memory", "prune", "--agent", "shopper", "--session", "s1",
        ])
        .expect("prune invocation should parse");
        match cli.command {
            Commands::Memory {
                memory_command: MemoryCommands::Prune { keep, .. },
            } => assert_eq!(keep, 20),
            other => panic!("expected memory prune, got {other:?}"),
        }
    }

    #[test]
    fn config_dir_is_global() {
        let cli = Cli::try_parse_from(["agora", "agents", "--config-dir", "/tmp/agora"])
            .expect("global flag should parse after subcommand");
        assert_eq!(cli.config_dir.as_deref(), Some("/tmp/agora"));
    }
}
