use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use serde_json::json;

use nudge_cron::{HandoffQueue, ReminderEngine, recurrence};
use nudge_types::{
    AgentType, CreateReminderRequest, ListRemindersQuery, MAX_LIST_LIMIT, ReminderPayload,
    ReminderStatus, UpdateReminderRequest,
};

use crate::serve::open_engine;
use crate::{GlobalArgs, ReminderArgs};

/// Engine for one-shot commands. New firings are handed to `nudge serve`.
fn engine(global: &GlobalArgs) -> Result<ReminderEngine> {
    open_engine(global, |_| Arc::new(HandoffQueue))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Build a payload from flags, filling gaps from `current` when updating.
fn payload_from_args(
    args: &ReminderArgs,
    current: Option<&ReminderPayload>,
) -> Option<ReminderPayload> {
    if let Some(instructions) = &args.instructions {
        return Some(ReminderPayload::AiAgent {
            instructions: instructions.clone(),
        });
    }
    if args.title.is_none() && args.body.is_none() {
        return None;
    }
    let (current_title, current_body) = match current {
        Some(ReminderPayload::Static { title, body }) => (title.as_str(), body.as_str()),
        _ => ("", ""),
    };
    Some(ReminderPayload::Static {
        title: args.title.as_deref().unwrap_or(current_title).to_string(),
        body: args.body.as_deref().unwrap_or(current_body).to_string(),
    })
}

pub async fn run_create(global: &GlobalArgs, args: ReminderArgs) -> Result<()> {
    let Some(payload) = payload_from_args(&args, None) else {
        bail!("Provide --title/--body for a static reminder or --instructions for an agent reminder");
    };
    let request = CreateReminderRequest {
        agent_type: payload.agent_type(),
        repeat: args.repeat,
        scheduled_at: args.at,
        max_occurrences: args.max_occurrences,
        stop_after: args.stop_after,
        payload,
    };

    let engine = engine(global)?;
    let id = engine.scheduler().create(&global.owner, request).await?;
    print_json(&engine.scheduler().get(&id, &global.owner).await?)
}

pub async fn run_list(
    global: &GlobalArgs,
    status: Option<ReminderStatus>,
    agent_type: Option<AgentType>,
    limit: u32,
    skip: u32,
) -> Result<()> {
    let query = ListRemindersQuery {
        status,
        agent_type,
        limit: limit.min(MAX_LIST_LIMIT),
        skip,
        ..ListRemindersQuery::for_owner(global.owner.clone())
    };
    let reminders = engine(global)?.scheduler().list(&query).await?;
    print_json(&reminders)
}

pub async fn run_get(global: &GlobalArgs, id: &str) -> Result<()> {
    let reminder = engine(global)?.scheduler().get(id, &global.owner).await?;
    print_json(&reminder)
}

pub async fn run_update(global: &GlobalArgs, id: &str, args: ReminderArgs) -> Result<()> {
    let engine = engine(global)?;
    let scheduler = engine.scheduler();
    let current = scheduler.get(id, &global.owner).await?;

    let request = UpdateReminderRequest {
        payload: payload_from_args(&args, Some(&current.payload)),
        repeat: args.repeat,
        scheduled_at: args.at,
        max_occurrences: args.max_occurrences,
        stop_after: args.stop_after,
        status: None,
    };
    if request.is_empty() {
        bail!("Nothing to update");
    }

    let updated = scheduler.update(id, &global.owner, request).await?;
    if !updated {
        bail!("Reminder {id} was not updated (status: {})", current.status);
    }
    print_json(&scheduler.get(id, &global.owner).await?)
}

#[derive(Debug, Clone, Copy)]
pub enum Transition {
    Cancel,
    Pause,
    Resume,
}

pub async fn run_transition(global: &GlobalArgs, id: &str, transition: Transition) -> Result<()> {
    let engine = engine(global)?;
    let scheduler = engine.scheduler();
    let applied = match transition {
        Transition::Cancel => scheduler.cancel(id, &global.owner).await?,
        Transition::Pause => scheduler.pause(id, &global.owner).await?,
        Transition::Resume => scheduler.resume(id, &global.owner).await?,
    };
    let reminder = scheduler.get(id, &global.owner).await.ok();
    print_json(&json!({
        "id": id,
        "applied": applied,
        "status": reminder.map(|r| r.status),
    }))
}

pub fn run_preview(expr: &str, n: usize) -> Result<()> {
    let times = recurrence::next_n_fire_times(expr, Utc::now(), n)?;
    print_json(&times)
}

pub async fn run_reconcile(global: &GlobalArgs) -> Result<()> {
    let report = engine(global)?.scheduler().reconcile().await?;
    print_json(&report)
}
