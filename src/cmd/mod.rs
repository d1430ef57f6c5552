//! CLI command implementations.

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use console::style;
use tokio::sync::mpsc;

use specwright::config::{FileConfig, GatewaySettings, WorkflowConfig};
use specwright::gateway::{ModelGateway, http::HttpGateway};
use specwright::machine::WorkflowPhase;
use specwright::orchestrator::{Orchestrator, WorkflowEvent};
use specwright::signals::WriterReply;
use specwright::state::WorkflowState;
use specwright::store::SessionStore;
use specwright::transcript::Transcript;
use specwright::ui::WorkflowUI;

use crate::Cli;

pub async fn cmd_run(cli: &Cli, idea: &str) -> Result<()> {
    let (workflow, gateway_settings) = resolve_config(cli)?;
    let gateway = build_gateway(&gateway_settings, cli.base_url.as_deref())?;
    let store = SessionStore::open(&cli.session_dir)?;
    if store.load_state()?.is_some() {
        bail!(
            "session directory {} already holds a session; use resume, or reset --force to wipe it",
            cli.session_dir.display()
        );
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let mut orch = Orchestrator::new(gateway, workflow, store, idea)?.with_event_channel(tx);
    let ui_task = spawn_ui(rx, cli.verbose);
    install_ctrl_c(&orch);

    let reply = orch.start().await?;
    if !clarify_loop(&mut orch, reply).await? {
        println!("Stopped. Resume later with `specwright resume`.");
        return Ok(());
    }

    let final_ref = orch.advance().await?;
    print_final_path(&orch, &final_ref);
    drop(orch);
    ui_task.await.ok();
    Ok(())
}

pub async fn cmd_resume(cli: &Cli) -> Result<()> {
    let (workflow, gateway_settings) = resolve_config(cli)?;
    let gateway = build_gateway(&gateway_settings, cli.base_url.as_deref())?;
    let store = SessionStore::open(&cli.session_dir)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let mut orch = Orchestrator::resume(gateway, workflow, store)?.with_event_channel(tx);
    let ui_task = spawn_ui(rx, cli.verbose);
    install_ctrl_c(&orch);

    if orch.state().phase == WorkflowPhase::Completed {
        if let Some(final_ref) = orch.state().final_ref.clone() {
            print_final_path(&orch, &final_ref);
        }
        return Ok(());
    }

    if orch.state().phase == WorkflowPhase::Error {
        let phase = orch
            .state()
            .last_error
            .as_ref()
            .map(|e| e.phase)
            .unwrap_or(WorkflowPhase::Preflight);
        println!(
            "Retrying from {} after: {}",
            style(phase).yellow(),
            orch.state()
                .last_error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown failure")
        );
        orch.retry_from(phase)?;
    }

    if matches!(
        orch.state().phase,
        WorkflowPhase::Idle | WorkflowPhase::Preflight | WorkflowPhase::Clarifying
    ) {
        let reply = orch.start().await?;
        if !clarify_loop(&mut orch, reply).await? {
            println!("Stopped. Resume later with `specwright resume`.");
            return Ok(());
        }
    }

    let final_ref = orch.advance().await?;
    print_final_path(&orch, &final_ref);
    drop(orch);
    ui_task.await.ok();
    Ok(())
}

pub fn cmd_status(cli: &Cli) -> Result<()> {
    let store = SessionStore::open(&cli.session_dir)?;
    let Some(state) = store.load_state()? else {
        println!("No session in {}", cli.session_dir.display());
        return Ok(());
    };

    println!("{} {}", style("Session:").bold(), state.session_id);
    println!("{} {}", style("Idea:").bold(), state.idea);
    let phase = match state.phase {
        WorkflowPhase::Completed => style(state.phase).green(),
        WorkflowPhase::Error => style(state.phase).red(),
        _ => style(state.phase).yellow(),
    };
    println!("{} {}", style("Phase:").bold(), phase);
    println!(
        "{} {} (artifact version {})",
        style("Round:").bold(),
        state.current_round,
        state.latest_artifact_version
    );

    for (number, round) in &state.rounds {
        println!("  Round {number}:");
        for (model, slot) in &round.reviewers {
            let status = format!("{:?}", slot.status).to_lowercase();
            println!("    {} {}", style(model).cyan(), style(status).dim());
        }
    }

    if let Some(final_ref) = &state.final_ref {
        println!("{} {}", style("Final:").bold(), style(final_ref).green());
    }
    if let Some(err) = &state.last_error {
        println!(
            "{} {} (in {}{})",
            style("Last error:").bold().red(),
            err.message,
            err.phase,
            err.model_id
                .as_ref()
                .map(|m| format!(", model {m}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

pub fn cmd_reset(cli: &Cli, force: bool) -> Result<()> {
    if force {
        if cli.session_dir.exists() {
            std::fs::remove_dir_all(&cli.session_dir).with_context(|| {
                format!("failed to remove {}", cli.session_dir.display())
            })?;
        }
        println!("Removed {}", cli.session_dir.display());
        return Ok(());
    }

    let store = SessionStore::open(&cli.session_dir)?;
    let Some(state) = store.load_state()? else {
        bail!("no session in {}", cli.session_dir.display());
    };
    if state.phase != WorkflowPhase::Error {
        bail!(
            "only a failed session can be reset (current phase: {}); use --force to wipe",
            state.phase
        );
    }

    store.save_state(&WorkflowState::new(state.idea))?;
    store.save_transcript(&Transcript::new())?;
    println!("Session reset to {}", style("idle").yellow());
    Ok(())
}

/// Resolve the workflow config: file settings with CLI flags layered on top.
fn resolve_config(cli: &Cli) -> Result<(WorkflowConfig, GatewaySettings)> {
    let file = FileConfig::load(&cli.config)?;
    let mut workflow = file
        .workflow
        .unwrap_or_else(|| WorkflowConfig::new("", Vec::new()));

    if let Some(writer) = &cli.writer {
        workflow.writer_model = writer.clone();
    }
    if let Some(reviewers) = &cli.reviewers {
        workflow.reviewer_models = reviewers
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(rounds) = cli.rounds {
        workflow.review_rounds = rounds;
    }

    workflow.validate().context(
        "incomplete model configuration; set [workflow] in specwright.toml or pass --writer/--reviewers",
    )?;
    Ok((workflow, file.gateway))
}

fn build_gateway(
    settings: &GatewaySettings,
    base_url_override: Option<&str>,
) -> Result<Arc<dyn ModelGateway>> {
    let base_url = base_url_override.unwrap_or(&settings.base_url);
    let api_key = std::env::var(&settings.api_key_env).with_context(|| {
        format!(
            "API key environment variable {} is not set",
            settings.api_key_env
        )
    })?;
    Ok(Arc::new(HttpGateway::new(base_url, api_key)?))
}

fn spawn_ui(
    mut rx: mpsc::UnboundedReceiver<WorkflowEvent>,
    verbose: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ui = WorkflowUI::new(verbose);
        while let Some(event) = rx.recv().await {
            ui.handle_event(&event);
        }
    })
}

fn install_ctrl_c(orch: &Orchestrator) {
    let handle = orch.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.abort();
        }
    });
}

/// Interactive clarification. Returns `false` if the user quit; `true` once
/// the writer is ready or the user forced progression with `/go`.
async fn clarify_loop(orch: &mut Orchestrator, mut reply: WriterReply) -> Result<bool> {
    while !reply.ready {
        let Some(line) = read_line("> ")? else {
            return Ok(false);
        };
        if line.is_empty() {
            continue;
        }
        match line.as_str() {
            "/go" => break,
            "/quit" => return Ok(false),
            _ => reply = orch.clarify(line).await?,
        }
    }
    Ok(true)
}

/// Prompt on stdout and read one trimmed line; `None` on EOF.
fn read_line(prompt: &str) -> Result<Option<String>> {
    let mut out = std::io::stdout();
    write!(out, "{prompt}")?;
    out.flush()?;

    let mut line = String::new();
    let read = std::io::stdin().lock().read_line(&mut line)?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn print_final_path(orch: &Orchestrator, final_ref: &str) {
    let path = orch.store().root().join("artifacts").join(final_ref);
    println!(
        "\n{} {}",
        style("Final specification:").bold().green(),
        path.display()
    );
}
