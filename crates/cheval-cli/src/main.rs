//! `cheval`: unified model-invoke entry point.
//!
//! I/O contract:
//! - stdout: model response content only (raw text or JSON)
//! - stderr: all diagnostics, as redacted JSON error objects
//! - exit codes: 0 success, 1 API error, 2 invalid input/config,
//!   3 timeout, 4 missing API key, 5 invalid response, 6 budget
//!   exceeded, 7 context too large, 8 async interaction pending

mod persona;

use std::io::{IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use cheval_config::{load_config, CliOverrides, HounfourConfig, LoadedConfig};
use cheval_core::redaction::redact_str;
use cheval_core::{ChevalError, ChevalResult, CompletionRequest, ErrorKind, Message};
use cheval_metering::BudgetEnforcer;
use cheval_providers::{get_adapter, DispatchOptions, NoopBudgetHook};
use cheval_routing::{resolve_execution, validate_bindings};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Unified model API entry point.
#[derive(Debug, Parser)]
#[command(name = "cheval", version, about = "Hounfour model-invoke: unified model API entry point")]
struct Cli {
    /// Agent name (e.g. reviewing-code).
    #[arg(long)]
    agent: Option<String>,

    /// Inline prompt text (mutually exclusive with --input).
    #[arg(long)]
    prompt: Option<String>,

    /// Path to an input file.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Path to a system prompt file (merged with persona.md).
    #[arg(long)]
    system: Option<PathBuf>,

    /// Model override (alias or provider:model-id).
    #[arg(long)]
    model: Option<String>,

    /// Maximum output tokens.
    #[arg(long, default_value_t = 4096)]
    max_tokens: u32,

    /// Output format.
    #[arg(long, value_parser = ["text", "json"], default_value = "text")]
    output_format: String,

    /// Include thinking traces in JSON output.
    #[arg(long)]
    include_thinking: bool,

    /// Request timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Start a long-running interaction without blocking; prints the
    /// interaction id.
    #[arg(long = "async")]
    async_mode: bool,

    /// Poll a long-running interaction by id.
    #[arg(long = "poll", value_name = "INTERACTION_ID")]
    poll_id: Option<String>,

    /// Cancel a long-running interaction by id.
    #[arg(long = "cancel", value_name = "INTERACTION_ID")]
    cancel_id: Option<String>,

    /// Resolve and print the target model without calling any API.
    #[arg(long)]
    dry_run: bool,

    /// Print the merged config with source annotations.
    #[arg(long)]
    print_effective_config: bool,

    /// Validate all agent bindings and routing chains.
    #[arg(long)]
    validate_bindings: bool,

    /// Check known credentials (format-only unless --live).
    #[arg(long)]
    check_credentials: bool,

    /// With --check-credentials: issue one minimal live request per
    /// credential instead of format validation.
    #[arg(long)]
    live: bool,
}

fn emit_error(err: &ChevalError) -> i32 {
    let mut payload = err.to_json();
    if let Some(message) = payload.get_mut("message") {
        if let Some(text) = message.as_str() {
            *message = serde_json::Value::String(redact_str(text));
        }
    }
    eprintln!("{payload}");
    err.kind.exit_code()
}

fn load(cli: &Cli) -> ChevalResult<LoadedConfig> {
    load_config(
        None,
        &CliOverrides {
            model: cli.model.clone(),
            timeout: cli.timeout,
        },
    )
}

fn project_root() -> PathBuf {
    std::env::current_dir()
        .map(|cwd| cheval_config::find_project_root(&cwd))
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn dispatch_options(root: &Path, config: &HounfourConfig) -> DispatchOptions {
    DispatchOptions {
        run_dir: root.join(".run"),
        ledger_path: root.join(&config.metering.ledger_path),
        permissions_path: root.join(".claude/data/model-permissions.yaml"),
    }
}

/// Model override precedence: CLI flag, then `LOA_MODEL`.
fn model_override(config: &HounfourConfig) -> Option<String> {
    config
        .cli_model_override
        .clone()
        .or_else(|| config.env_model_override.clone())
}

fn read_input(cli: &Cli) -> ChevalResult<String> {
    if cli.prompt.is_some() && cli.input.is_some() {
        return Err(ChevalError::invalid_input(
            "--prompt and --input are mutually exclusive",
        ));
    }

    if let Some(prompt) = &cli.prompt {
        return Ok(prompt.clone());
    }
    if let Some(path) = &cli.input {
        return std::fs::read_to_string(path).map_err(|_| {
            ChevalError::invalid_input(format!("input file not found: {}", path.display()))
        });
    }

    let mut stdin = std::io::stdin();
    if !stdin.is_terminal() {
        let mut buffer = String::new();
        stdin
            .read_to_string(&mut buffer)
            .map_err(|e| ChevalError::invalid_input(format!("cannot read stdin: {e}")))?;
        if !buffer.is_empty() {
            return Ok(buffer);
        }
    }

    Err(ChevalError::invalid_input(
        "no input provided. Use --prompt, --input <file>, or pipe to stdin",
    ))
}

fn require_agent(cli: &Cli) -> ChevalResult<&str> {
    cli.agent
        .as_deref()
        .ok_or_else(|| ChevalError::invalid_input("missing --agent argument"))
}

fn cmd_print_config(cli: &Cli) -> ChevalResult<()> {
    let loaded = load(cli)?;
    println!("{}", cheval_config::effective_config_display(&loaded));
    Ok(())
}

fn cmd_validate_bindings(cli: &Cli) -> ChevalResult<()> {
    let loaded = load(cli)?;
    let errors = validate_bindings(&loaded.config);
    if !errors.is_empty() {
        let payload = serde_json::json!({ "valid": false, "errors": errors });
        eprintln!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default());
        return Err(ChevalError::invalid_config(format!(
            "{} binding error(s)",
            errors.len()
        )));
    }

    let agents: Vec<&String> = loaded.config.agents.keys().collect();
    println!("{}", serde_json::json!({ "valid": true, "agents": agents }));
    Ok(())
}

async fn cmd_check_credentials(cli: &Cli) -> ChevalResult<i32> {
    use cheval_credentials::{check_all_format, check_all_live, default_chain, HealthStatus};

    let root = project_root();
    let chain = default_chain(&root);
    let reports = if cli.live {
        check_all_live(&chain, Duration::from_secs(10)).await
    } else {
        check_all_format(&chain)
    };

    for report in &reports {
        println!(
            "{}",
            serde_json::json!({
                "credential": report.credential_id,
                "status": report.status.label(),
                "message": report.message,
            })
        );
    }

    if reports.iter().any(|r| {
        matches!(
            r.status,
            HealthStatus::Invalid | HealthStatus::Forbidden | HealthStatus::Error
        )
    }) {
        return Err(ChevalError::invalid_config("one or more credentials failed"));
    }
    if reports.iter().all(|r| r.status == HealthStatus::Missing) {
        return Err(ChevalError::new(
            ErrorKind::MissingApiKey,
            "no known credential found in any chain provider",
        ));
    }
    Ok(0)
}

async fn cmd_poll(cli: &Cli, interaction_id: &str) -> ChevalResult<i32> {
    let agent = require_agent(cli)?;
    let loaded = load(cli)?;
    let config = &loaded.config;
    let root = project_root();

    let (_, resolved) = resolve_execution(agent, config, model_override(config).as_deref())?;
    let provider_config = config.providers.get(&resolved.provider).ok_or_else(|| {
        ChevalError::invalid_config(format!("provider '{}' not configured", resolved.provider))
    })?;
    let adapter = get_adapter(&resolved.provider, provider_config, &root.join(".run"))?;
    let Some(interactions) = adapter.interactions() else {
        return Err(ChevalError::invalid_input(format!(
            "provider '{}' does not support --poll",
            resolved.provider
        )));
    };

    match interactions
        .poll_interaction(
            interaction_id,
            Duration::from_secs(5),
            Duration::from_secs(30),
        )
        .await
    {
        Ok(result) => {
            println!(
                "{}",
                serde_json::json!({
                    "status": "completed",
                    "interaction_id": interaction_id,
                    "result": result,
                })
            );
            Ok(0)
        },
        Err(e) if e.kind == ErrorKind::Timeout => {
            println!(
                "{}",
                serde_json::json!({ "status": "pending", "interaction_id": interaction_id })
            );
            Ok(ErrorKind::InteractionPending.exit_code())
        },
        Err(e) => Err(e),
    }
}

async fn cmd_cancel(cli: &Cli, interaction_id: &str) -> ChevalResult<()> {
    let agent = require_agent(cli)?;
    let loaded = load(cli)?;
    let config = &loaded.config;
    let root = project_root();

    let (_, resolved) = resolve_execution(agent, config, model_override(config).as_deref())?;
    let provider_config = config.providers.get(&resolved.provider).ok_or_else(|| {
        ChevalError::invalid_config(format!("provider '{}' not configured", resolved.provider))
    })?;
    let adapter = get_adapter(&resolved.provider, provider_config, &root.join(".run"))?;
    let Some(interactions) = adapter.interactions() else {
        return Err(ChevalError::invalid_input(format!(
            "provider '{}' does not support --cancel",
            resolved.provider
        )));
    };

    let cancelled = interactions.cancel_interaction(interaction_id).await?;
    println!(
        "{}",
        serde_json::json!({ "cancelled": cancelled, "interaction_id": interaction_id })
    );
    Ok(())
}

async fn cmd_invoke(cli: &Cli) -> ChevalResult<i32> {
    let agent = require_agent(cli)?;
    let loaded = load(cli)?;
    let config = &loaded.config;
    let root = project_root();

    let (binding, resolved) =
        resolve_execution(agent, config, model_override(config).as_deref())?;

    if resolved.is_native() {
        return Err(ChevalError::invalid_config(format!(
            "agent '{agent}' is bound to the native runtime; use its skill directly, \
             not model-invoke"
        )));
    }

    if cli.dry_run {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "agent": agent,
                "resolved_provider": resolved.provider,
                "resolved_model": resolved.model_id,
                "temperature": binding.temperature,
            }))
            .unwrap_or_default()
        );
        return Ok(0);
    }

    let input_text = read_input(cli)?;

    let mut messages = Vec::new();
    if let Some(system) =
        persona::load_system_prompt(&root, agent, cli.system.as_deref())
    {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(input_text));

    let mut request = CompletionRequest::new(messages, resolved.model_id.clone());
    request.temperature = binding.temperature.unwrap_or(0.7);
    request.max_tokens = cli.max_tokens;
    request.metadata = Some(
        [("agent".to_owned(), agent.to_owned())]
            .into_iter()
            .collect(),
    );

    let options = dispatch_options(&root, config);

    // Non-blocking async start: create the interaction and report it.
    if cli.async_mode {
        let provider_config = config.providers.get(&resolved.provider).ok_or_else(|| {
            ChevalError::invalid_config(format!(
                "provider '{}' not configured",
                resolved.provider
            ))
        })?;
        let adapter = get_adapter(&resolved.provider, provider_config, &options.run_dir)?;
        let Some(interactions) = adapter.interactions() else {
            return Err(ChevalError::invalid_input(format!(
                "provider '{}' does not support --async",
                resolved.provider
            )));
        };
        let model_config = config
            .model_config(&resolved.provider, &resolved.model_id)
            .cloned()
            .unwrap_or_default();
        let store = model_config
            .extra
            .as_ref()
            .and_then(|e| e.store)
            .unwrap_or(false);

        let interaction_id = interactions
            .create_interaction(&request, &model_config, store)
            .await?;
        println!(
            "{}",
            serde_json::json!({
                "interaction_id": interaction_id,
                "model": resolved.model_id,
                "provider": resolved.provider,
                "status": "pending",
            })
        );
        return Ok(ErrorKind::InteractionPending.exit_code());
    }

    // Budget hook: real enforcer when metering is on, no-op otherwise.
    let mut enforcer;
    let mut noop = NoopBudgetHook;
    let budget_hook: &mut dyn cheval_providers::BudgetHook =
        if config.feature_flags.metering && config.metering.enabled {
            tracing::info!(ledger = %options.ledger_path.display(), "budget enforcement active");
            enforcer = BudgetEnforcer::new(
                config,
                &options.ledger_path,
                &format!("tr-{agent}-{}", std::process::id()),
                agent,
            );
            &mut enforcer
        } else {
            &mut noop
        };

    let result =
        cheval_providers::invoke(config, &binding, resolved, request, &options, budget_hook)
            .await?;

    if cli.output_format == "json" {
        let mut payload = serde_json::json!({
            "content": result.content,
            "model": result.model,
            "provider": result.provider,
            "usage": {
                "input_tokens": result.usage.input_tokens,
                "output_tokens": result.usage.output_tokens,
            },
            "latency_ms": result.latency_ms,
        });
        if cli.include_thinking {
            if let Some(thinking) = &result.thinking {
                payload["thinking"] = serde_json::json!(thinking);
            }
        }
        if let Some(tool_calls) = &result.tool_calls {
            payload["tool_calls"] = serde_json::json!(tool_calls);
        }
        println!("{payload}");
    } else {
        // Text mode: thinking is never printed.
        println!("{}", result.content);
    }

    Ok(0)
}

async fn run(cli: Cli) -> i32 {
    let outcome: ChevalResult<i32> = if cli.print_effective_config {
        cmd_print_config(&cli).map(|()| 0)
    } else if cli.validate_bindings {
        cmd_validate_bindings(&cli).map(|()| 0)
    } else if cli.check_credentials {
        cmd_check_credentials(&cli).await
    } else if let Some(poll_id) = cli.poll_id.clone() {
        cmd_poll(&cli, &poll_id).await
    } else if let Some(cancel_id) = cli.cancel_id.clone() {
        cmd_cancel(&cli, &cancel_id).await.map(|()| 0)
    } else {
        cmd_invoke(&cli).await
    };

    match outcome {
        Ok(code) => code,
        Err(err) => emit_error(&err),
    }
}

#[tokio::main]
async fn main() {
    // Diagnostics go to stderr only; stdout is the response channel.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}
