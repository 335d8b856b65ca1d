//! `weft validate` and `weft inspect`: static checks on a workflow file.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Value, json};
use weft_core::workflow::ExecutionPlan;
use weft_infra::loader::load_workflow;

pub async fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let workflow = load_workflow(file)
        .await
        .with_context(|| format!("workflow {} is invalid", file.display()))?;

    if json {
        let summary = json!({
            "valid": true,
            "id": workflow.id,
            "nodes": workflow.nodes.len(),
            "edges": workflow.edges.len(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "  {} {} is valid ({} nodes, {} edges)",
        style("✓").green().bold(),
        style(&workflow.id).cyan(),
        workflow.nodes.len(),
        workflow.edges.len()
    );
    Ok(())
}

pub async fn handle_inspect(file: &Path, json: bool) -> Result<()> {
    let workflow = load_workflow(file)
        .await
        .with_context(|| format!("failed to load workflow {}", file.display()))?;
    let plan = ExecutionPlan::build(&workflow)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan_json(&plan))?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Scope"),
            Cell::new("Sink"),
        ]);

    for (position, &idx) in plan.order().iter().enumerate() {
        let scope = plan
            .owner(idx)
            .map_or_else(|| "-".to_string(), |s| plan.id(s).to_string());
        let sink = if plan.sinks().contains(&idx) { "yes" } else { "" };
        table.add_row(vec![
            Cell::new(position + 1),
            Cell::new(plan.id(idx)),
            Cell::new(plan.node(idx).type_name()),
            Cell::new(scope),
            Cell::new(sink).fg(Color::Green),
        ]);
    }

    println!();
    println!(
        "  {} {}",
        style("Workflow").bold(),
        style(&workflow.id).cyan()
    );
    println!();
    println!("{table}");

    let scoped: Vec<usize> = plan
        .order()
        .iter()
        .copied()
        .filter(|&idx| plan.body(idx).is_some())
        .collect();
    if !scoped.is_empty() {
        println!();
        println!("  {}", style("Bodies").bold());
        for idx in scoped {
            if let Some(body) = plan.body(idx) {
                println!(
                    "    {} [{}]: {} (terminals: {})",
                    style(plan.id(idx)).cyan(),
                    plan.node(idx).type_name(),
                    ids(&plan, &body.members),
                    ids(&plan, &body.terminals)
                );
            }
        }
    }

    println!();
    println!("  {} {}", style("Sinks:").bold(), ids(&plan, plan.sinks()));
    println!();
    Ok(())
}

fn ids(plan: &ExecutionPlan, nodes: &[usize]) -> String {
    if nodes.is_empty() {
        return "-".to_string();
    }
    nodes
        .iter()
        .map(|&idx| plan.id(idx))
        .collect::<Vec<_>>()
        .join(", ")
}

fn plan_json(plan: &ExecutionPlan) -> Value {
    let order: Vec<Value> = plan
        .order()
        .iter()
        .map(|&idx| {
            json!({
                "id": plan.id(idx),
                "type": plan.node(idx).type_name(),
                "scope": plan.owner(idx).map(|s| plan.id(s)),
                "sink": plan.sinks().contains(&idx),
            })
        })
        .collect();
    let bodies: serde_json::Map<String, Value> = plan
        .order()
        .iter()
        .filter_map(|&idx| {
            plan.body(idx).map(|body| {
                let members: Vec<&str> = body.members.iter().map(|&m| plan.id(m)).collect();
                let terminals: Vec<&str> = body.terminals.iter().map(|&t| plan.id(t)).collect();
                (
                    plan.id(idx).to_string(),
                    json!({ "members": members, "terminals": terminals }),
                )
            })
        })
        .collect();
    let sinks: Vec<&str> = plan.sinks().iter().map(|&s| plan.id(s)).collect();

    json!({
        "id": plan.workflow().id,
        "order": order,
        "bodies": bodies,
        "sinks": sinks,
    })
}
