//! `weft run`: execute a workflow once and print the report.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Map, Value};
use uuid::Uuid;
use weft_core::workflow::{RunError, WorkflowEngine, WorkflowExecutor};
use weft_infra::config::load_engine_config;
use weft_infra::http::registry_from_settings;
use weft_infra::loader::load_workflow;
use weft_types::result::{NodeStatus, RunReport};
use weft_types::workflow::Workflow;

pub async fn handle_run(
    file: &Path,
    input: Option<&str>,
    context: &[String],
    config_path: &Path,
    json: bool,
) -> Result<()> {
    let workflow = load_workflow(file)
        .await
        .with_context(|| format!("failed to load workflow {}", file.display()))?;
    let config = load_engine_config(config_path).await;
    let http = registry_from_settings(&config.http).context("failed to configure http clients")?;
    let engine = WorkflowEngine::builder(config).http(http).build();

    let input = input.map(parse_value).unwrap_or(Value::Null);
    let context = parse_context(context)?;
    let run_id = Uuid::now_v7();
    tracing::debug!(%run_id, workflow_id = workflow.id.as_str(), "starting run");

    let run = engine.run_with_id(run_id, &workflow, input, context);
    tokio::pin!(run);
    let outcome = tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(%run_id, "interrupt received, cancelling run");
            engine.cancel(run_id);
            run.await
        }
    };

    match outcome {
        Ok(report) if json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Ok(report) => {
            print_report(&workflow, &report)?;
            Ok(())
        }
        Err(err) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&error_json(run_id, &err))?);
            } else {
                print_error(run_id, &err);
            }
            Err(err).with_context(|| format!("workflow '{}' failed", workflow.id))
        }
    }
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_context(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut context = Map::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --context '{pair}': expected KEY=VALUE");
        };
        if key.is_empty() {
            bail!("invalid --context '{pair}': empty key");
        }
        context.insert(key.to_string(), parse_value(value));
    }
    Ok(context)
}

fn error_json(run_id: Uuid, err: &RunError) -> Value {
    let mut error = serde_json::json!({
        "run_id": run_id,
        "kind": err.kind(),
        "message": err.to_string(),
    });
    if let RunError::NodeFailed {
        node_id,
        expression,
        ..
    } = err
    {
        error["node_id"] = Value::from(node_id.as_str());
        if let Some(expression) = expression {
            error["expression"] = Value::from(expression.as_str());
        }
    }
    serde_json::json!({ "error": error })
}

fn print_error(run_id: Uuid, err: &RunError) {
    println!();
    println!(
        "  {} Run {} failed",
        style("✗").red().bold(),
        style(short_id(run_id)).cyan()
    );
    match err {
        RunError::NodeFailed {
            node_id,
            kind,
            message,
            expression,
        } => {
            println!("    node:       {}", style(node_id).bold());
            println!("    kind:       {kind}");
            println!("    message:    {message}");
            if let Some(expression) = expression {
                println!("    expression: {}", style(expression).dim());
            }
        }
        other => println!("    {other}"),
    }
    println!();
}

fn print_report(workflow: &Workflow, report: &RunReport) -> Result<()> {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Duration"),
            Cell::new("Note"),
        ]);

    for node in &workflow.nodes {
        let status = report.state(&node.id).unwrap_or(NodeStatus::Pending);
        let result = report.result(&node.id);
        let attempts = result.map_or_else(|| "-".to_string(), |r| r.attempts.to_string());
        let duration = result.map_or_else(|| "-".to_string(), |r| format!("{}ms", r.duration_ms));
        let note = result
            .and_then(|r| {
                r.error
                    .as_ref()
                    .map(|e| e.message.chars().take(40).collect::<String>())
                    .or_else(|| r.selected_path().map(|p| format!("path: {p}")))
            })
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(&node.id),
            Cell::new(node.type_name()),
            status_cell(status),
            Cell::new(attempts),
            Cell::new(duration),
            Cell::new(note),
        ]);
    }

    println!();
    println!(
        "  {} Run {} of '{}' completed in {}ms",
        style("✓").green().bold(),
        style(short_id(report.run_id)).cyan(),
        workflow.name.as_deref().unwrap_or(&workflow.id),
        report.duration_ms()
    );
    println!();
    println!("{table}");
    println!();
    println!("  {}", style("Output").bold());
    println!("{}", serde_json::to_string_pretty(&report.output)?);
    println!();
    Ok(())
}

fn status_cell(status: NodeStatus) -> Cell {
    let (label, color) = match status {
        NodeStatus::Completed => ("completed", Color::Green),
        NodeStatus::Skipped => ("skipped", Color::DarkGrey),
        NodeStatus::Failed => ("failed", Color::Red),
        NodeStatus::Cancelled => ("cancelled", Color::Yellow),
        NodeStatus::Running => ("running", Color::Blue),
        NodeStatus::Pending => ("pending", Color::DarkGrey),
    };
    Cell::new(label).fg(color)
}

fn short_id(run_id: Uuid) -> String {
    run_id.to_string().chars().take(8).collect()
}
