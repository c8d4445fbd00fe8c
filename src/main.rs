//! Parley CLI entry point

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use parley::adapters::cli::ChatRepl;
use parley::adapters::ApiResponse;
use parley::chat::{
    AgentService, ChatOptions, ConversationService, LlmClient, MessageService, UsageService,
};
use parley::config::Config;
use parley::store::{AgentPatch, NewAgent, Store};
use parley::ui;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley - chat with configurable agents over an OpenAI-compatible API")]
#[command(version)]
struct Cli {
    /// Print results as a JSON envelope
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive configuration setup
    Onboard,

    /// Show configuration and store status
    Status,

    /// Delete configuration and stored data
    Reset,

    /// Manage agents
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },

    /// Manage conversations
    Conversation {
        #[command(subcommand)]
        command: ConversationCommand,
    },

    /// Send one message and print the reply
    Send {
        conversation_id: i64,
        message: String,
    },

    /// Print the messages of a conversation
    History { conversation_id: i64 },

    /// Show the token usage recorded for a conversation
    Usage { conversation_id: i64 },

    /// Chat interactively in a conversation
    Chat { conversation_id: i64 },
}

#[derive(Subcommand)]
enum AgentCommand {
    Create {
        name: String,
        /// System prompt (defaults to a generic assistant)
        #[arg(short, long)]
        prompt: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
    },
    List,
    Show {
        id: i64,
    },
    Update {
        id: i64,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        prompt: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
    },
    Delete {
        id: i64,
    },
    /// Token usage summed over the agent's conversations
    Usage {
        id: i64,
    },
}

#[derive(Subcommand)]
enum ConversationCommand {
    Start {
        agent_id: i64,
        #[arg(short, long)]
        title: Option<String>,
    },
    List {
        agent_id: i64,
    },
    Delete {
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize logging (stderr keeps --json output clean)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Onboard => {
            parley::config::onboard()?;
            println!("\nNext steps:");
            println!("  1. parley agent create \"Helper\" -p \"You are a helpful assistant.\"");
            println!("  2. parley conversation start <agent-id>");
            println!("  3. parley chat <conversation-id>");
            Ok(ExitCode::SUCCESS)
        }

        Commands::Reset => {
            parley::config::reset()?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Status => {
            let config = parley::config::load()?;
            print_status(&config);
            Ok(ExitCode::SUCCESS)
        }

        command => {
            let config = parley::config::load()?;
            let store = Store::open(&config.store_path).await?;
            run(command, &config, store, cli.json).await
        }
    }
}

async fn run(command: Commands, config: &Config, store: Store, json: bool) -> Result<ExitCode> {
    let agents = AgentService::new(store.clone());
    let conversations = ConversationService::new(store.clone());
    let usage = UsageService::new(store.clone());

    let code = match command {
        Commands::Agent { command } => match command {
            AgentCommand::Create {
                name,
                prompt,
                description,
            } => {
                let input = NewAgent {
                    name,
                    system_prompt: prompt,
                    description,
                };
                emit(json, agents.create(input).await, |agent| {
                    ui::print_success(&format!("Created agent {} ({})", agent.id, agent.name));
                })
            }
            AgentCommand::List => emit(json, agents.list().await, |list| {
                if list.is_empty() {
                    ui::print_step("No agents yet.");
                }
                for agent in list {
                    println!("  {:>4}  {}", agent.id.to_string().cyan(), agent.name.bold());
                }
            }),
            AgentCommand::Show { id } => emit(json, agents.get(id).await, |agent| {
                println!("{} {}", agent.name.bold(), format!("#{}", agent.id).black().bold());
                if let Some(description) = &agent.description {
                    println!("{}", description);
                }
                println!("\n{}", agent.system_prompt.italic());
            }),
            AgentCommand::Update {
                id,
                name,
                prompt,
                description,
            } => {
                let patch = AgentPatch {
                    name,
                    system_prompt: prompt,
                    description,
                };
                emit(json, agents.update(id, patch).await, |agent| {
                    ui::print_success(&format!("Updated agent {}", agent.id));
                })
            }
            AgentCommand::Delete { id } => emit(json, agents.delete(id).await, |_| {
                ui::print_success(&format!("Deleted agent {id}"));
            }),
            AgentCommand::Usage { id } => emit(json, usage.total_for_agent(id).await, |totals| {
                println!(
                    "{} requests, {} tokens ({} prompt, {} completion)",
                    totals.requests,
                    totals.total_tokens.to_string().bold(),
                    totals.prompt_tokens,
                    totals.completion_tokens
                );
            }),
        },

        Commands::Conversation { command } => match command {
            ConversationCommand::Start { agent_id, title } => {
                let result = conversations.start(agent_id, title.as_deref()).await;
                emit(json, result, |conversation| {
                    ui::print_success(&format!("Started conversation {}", conversation.id));
                })
            }
            ConversationCommand::List { agent_id } => {
                emit(json, conversations.list_for_agent(agent_id).await, |list| {
                    if list.is_empty() {
                        ui::print_step("No conversations yet.");
                    }
                    for summary in list {
                        let c = &summary.conversation;
                        println!(
                            "  {:>4}  {}  {}",
                            c.id.to_string().cyan(),
                            c.title.as_deref().unwrap_or("(untitled)").bold(),
                            format!("{} messages", summary.message_count).black().bold()
                        );
                    }
                })
            }
            ConversationCommand::Delete { id } => emit(json, conversations.delete(id).await, |_| {
                ui::print_success(&format!("Deleted conversation {id}"));
            }),
        },

        Commands::Send {
            conversation_id,
            message,
        } => {
            let messages = message_service(config, store)?;
            let result = messages.send_message(conversation_id, &message).await;
            emit(json, result, |exchange| {
                println!("{}", exchange.assistant.content);
            })
        }

        Commands::History { conversation_id } => {
            let messages = message_service(config, store)?;
            emit(json, messages.list_messages(conversation_id).await, |history| {
                if history.is_empty() {
                    ui::print_step("No messages yet.");
                }
                history.iter().for_each(ui::print_message);
            })
        }

        Commands::Usage { conversation_id } => {
            emit(json, usage.for_conversation(conversation_id).await, |report| {
                for record in &report.records {
                    println!(
                        "  {}  {:<20} {:>6} prompt {:>6} completion {:>7} total",
                        record.created_at.format("%Y-%m-%d %H:%M:%S"),
                        record.model,
                        record.prompt_tokens,
                        record.completion_tokens,
                        record.total_tokens
                    );
                }
                println!(
                    "{} messages, {} requests, {} tokens",
                    report.message_count,
                    report.totals.requests,
                    report.totals.total_tokens.to_string().bold()
                );
            })
        }

        Commands::Chat { conversation_id } => {
            let conversation = match conversations.get(conversation_id).await {
                Ok(conversation) => conversation,
                Err(e) => return Ok(emit(json, Err::<(), _>(e), |_| {})),
            };
            let messages = Arc::new(message_service(config, store)?);

            install_interrupt_handler();
            ui::print_header(&config.model, &config.api_base_url);
            if let Some(title) = &conversation.title {
                println!("  {}", title.bold());
            }
            println!("  Type 'exit' to leave, '/history' to replay the conversation.");

            ChatRepl::new(messages, conversation.id)
                .run_interactive()
                .await?;
            ExitCode::SUCCESS
        }

        Commands::Onboard | Commands::Status | Commands::Reset => ExitCode::SUCCESS,
    };

    Ok(code)
}

fn message_service(config: &Config, store: Store) -> Result<MessageService> {
    let llm = LlmClient::http(config.llm()?)?;
    let options = ChatOptions {
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    };
    Ok(MessageService::new(store, Arc::new(llm)).with_options(options))
}

/// Print a result either as the JSON envelope or through `render`.
fn emit<T: Serialize>(json: bool, result: parley::Result<T>, render: impl FnOnce(&T)) -> ExitCode {
    let code = match &result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) if e.category().is_client_error() => ExitCode::from(2),
        Err(_) => ExitCode::FAILURE,
    };

    if json {
        match ApiResponse::from(result).to_json() {
            Ok(body) => println!("{body}"),
            Err(e) => ui::print_error(&e.to_string()),
        }
    } else {
        match &result {
            Ok(data) => render(data),
            Err(e) => ui::print_error(&e.to_string()),
        }
    }

    code
}

fn print_status(config: &Config) {
    ui::print_header(&config.model, &config.api_base_url);
    println!("Config: {:?}", parley::config::config_path());
    println!("Store: {:?}", config.store_path);
    println!(
        "API key: {}",
        match config.api_key.as_deref() {
            Some(key) if !key.is_empty() => "✓".green(),
            _ => "not set".yellow(),
        }
    );
    println!(
        "Timeout: {}s, retries: {}",
        config.timeout_secs, config.max_retries
    );
    if let Err(e) = config.llm() {
        ui::print_warning(&e.to_string());
    }
}

/// First Ctrl+C warns, a second within three seconds exits.
fn install_interrupt_handler() {
    let armed = Arc::new(AtomicBool::new(false));
    let flag = armed.clone();

    ctrlc::set_handler(move || {
        if flag.load(Ordering::SeqCst) {
            println!("\n👋 Bye!");
            std::process::exit(0);
        }

        println!("\n⚠️  Press Ctrl+C again to exit");
        flag.store(true, Ordering::SeqCst);

        let reset = flag.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_secs(3));
            reset.store(false, Ordering::SeqCst);
        });
    })
    .ok();
}
