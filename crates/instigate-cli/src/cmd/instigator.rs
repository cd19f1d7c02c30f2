use crate::cmd::WorkspaceArgs;
use crate::home;
use crate::output::{print_json, print_table};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use instigate_core::definition::{InstigatorDefinition, InstigatorId};
use instigate_core::due::{next_tick_at, preview_context};
use instigate_core::instance::Instance;
use instigate_core::state::{InstigatorState, InstigatorStatus};
use instigate_core::tick::Tick;
use instigate_core::workspace::{DefinitionSource, LocationLoad};

#[derive(Subcommand, Debug)]
pub enum InstigatorSubcommand {
    /// List schedules and sensors with their state
    List,
    /// Show one instigator and its latest ticks
    Show { id: String },
    /// Set an instigator RUNNING
    Start { id: String },
    /// Set an instigator STOPPED
    Stop { id: String },
    /// Tick history, newest first
    Ticks {
        id: String,
        #[arg(long, default_value_t = 25)]
        limit: usize,
    },
    /// Overwrite the cursor; omit the value to clear it
    SetCursor { id: String, cursor: Option<String> },
    /// Evaluate once and print the result. Nothing is stored or launched.
    Preview {
        id: String,
        /// Evaluate against this cursor instead of the stored one
        #[arg(long)]
        cursor: Option<String>,
    },
}

pub fn run(workspace: &WorkspaceArgs, subcmd: InstigatorSubcommand, json: bool) -> Result<()> {
    let instance = home::open_persistent_instance()?;
    let timeout = instance.config().coordinator.evaluation_timeout();
    let source = workspace.open(instance.home(), Some(timeout))?;
    let catalog = Catalog::load(&source);
    let ctx = Ctx {
        instance,
        catalog,
        json,
    };

    match subcmd {
        InstigatorSubcommand::List => ctx.list(),
        InstigatorSubcommand::Show { id } => ctx.show(&parse(&id)?),
        InstigatorSubcommand::Start { id } => {
            ctx.set_status(&parse(&id)?, InstigatorStatus::Running)
        }
        InstigatorSubcommand::Stop { id } => {
            ctx.set_status(&parse(&id)?, InstigatorStatus::Stopped)
        }
        InstigatorSubcommand::Ticks { id, limit } => ctx.ticks(&parse(&id)?, limit),
        InstigatorSubcommand::SetCursor { id, cursor } => {
            ctx.set_cursor(&parse(&id)?, cursor.as_deref())
        }
        InstigatorSubcommand::Preview { id, cursor } => ctx.preview(&parse(&id)?, cursor),
    }
}

fn parse(id: &str) -> Result<InstigatorId> {
    InstigatorId::parse(id).with_context(|| format!("expected location/repository/name, got '{id}'"))
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

struct Catalog {
    definitions: Vec<InstigatorDefinition>,
    errors: Vec<(String, String)>,
}

impl Catalog {
    fn load(source: &dyn DefinitionSource) -> Self {
        let mut definitions = Vec::new();
        let mut errors = Vec::new();
        for load in source.load() {
            match load {
                LocationLoad::Loaded(l) => definitions.extend(l.definitions),
                LocationLoad::Failed { location, error } => {
                    eprintln!("warning: location '{location}' failed to load: {error}");
                    errors.push((location, error));
                }
            }
        }
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            definitions,
            errors,
        }
    }

    fn require(&self, id: &InstigatorId) -> Result<&InstigatorDefinition> {
        if let Some(def) = self.definitions.iter().find(|d| &d.id == id) {
            return Ok(def);
        }
        if let Some((_, error)) = self.errors.iter().find(|(l, _)| l == &id.location) {
            bail!("location '{}' failed to load: {error}", id.location);
        }
        bail!("instigator not found: {id}")
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

struct Ctx {
    instance: Instance,
    catalog: Catalog,
    json: bool,
}

impl Ctx {
    fn state_of(&self, def: &InstigatorDefinition, now: DateTime<Utc>) -> Result<InstigatorState> {
        Ok(self
            .instance
            .storage()
            .get_state(&def.id)?
            .unwrap_or_else(|| InstigatorState::new(def.id.clone(), def.default_status, now)))
    }

    fn summary(&self, def: &InstigatorDefinition, now: DateTime<Utc>) -> Result<serde_json::Value> {
        let state = self.state_of(def, now)?;
        let next = if state.is_running() {
            next_tick_at(def, &state, now)?
        } else {
            None
        };
        let latest = self.instance.storage().ticks(&def.id, 1)?.into_iter().next();
        Ok(serde_json::json!({
            "id": def.id.key(),
            "type": def.instigator_type(),
            "job_name": def.job_name,
            "status": state.status.as_str(),
            "cursor": state.cursor,
            "last_evaluated_at": state.last_evaluated_at,
            "next_tick_at": next,
            "latest_tick": latest,
        }))
    }

    fn list(&self) -> Result<()> {
        let now = Utc::now();
        let summaries = self
            .catalog
            .definitions
            .iter()
            .map(|d| self.summary(d, now))
            .collect::<Result<Vec<_>>>()?;
        if self.json {
            return print_json(&summaries);
        }
        if summaries.is_empty() {
            println!("No instigators defined.");
            return Ok(());
        }
        let rows: Vec<Vec<String>> = summaries
            .iter()
            .map(|s| {
                vec![
                    text(&s["id"]),
                    text(&s["type"]),
                    text(&s["status"]),
                    text(&s["cursor"]),
                    text(&s["next_tick_at"]),
                    text(&s["latest_tick"]["status"]),
                ]
            })
            .collect();
        print_table(
            &["ID", "TYPE", "STATUS", "CURSOR", "NEXT TICK", "LAST TICK"],
            &rows,
        );
        Ok(())
    }

    fn show(&self, id: &InstigatorId) -> Result<()> {
        let def = self.catalog.require(id)?;
        let mut summary = self.summary(def, Utc::now())?;
        let recent = self.instance.storage().ticks(id, 5)?;
        summary["kind"] = serde_json::to_value(&def.kind)?;
        summary["recent_ticks"] = serde_json::to_value(&recent)?;
        if self.json {
            return print_json(&summary);
        }
        println!("{}  ({} -> {})", def.id, def.instigator_type(), def.job_name);
        println!("status:     {}", text(&summary["status"]));
        println!("cursor:     {}", text(&summary["cursor"]));
        println!("next tick:  {}", text(&summary["next_tick_at"]));
        if !recent.is_empty() {
            println!();
            print_ticks(&recent);
        }
        Ok(())
    }

    fn set_status(&self, id: &InstigatorId, status: InstigatorStatus) -> Result<()> {
        let def = self.catalog.require(id)?;
        let now = Utc::now();
        let storage = self.instance.storage();
        storage.ensure_state(id, def.default_status, now)?;
        let state = storage.set_status(id, status, now)?;
        if self.json {
            return print_json(&state);
        }
        println!("{id} is {}", state.status);
        Ok(())
    }

    fn ticks(&self, id: &InstigatorId, limit: usize) -> Result<()> {
        let ticks = self.instance.storage().ticks(id, limit.max(1))?;
        if self.json {
            return print_json(&ticks);
        }
        if ticks.is_empty() {
            println!("No ticks for {id}.");
            return Ok(());
        }
        print_ticks(&ticks);
        Ok(())
    }

    fn set_cursor(&self, id: &InstigatorId, cursor: Option<&str>) -> Result<()> {
        let def = self.catalog.require(id)?;
        let storage = self.instance.storage();
        storage.ensure_state(id, def.default_status, Utc::now())?;
        let state = storage.set_cursor(id, cursor)?;
        if self.json {
            return print_json(&state);
        }
        match &state.cursor {
            Some(c) => println!("{id} cursor set to {c}"),
            None => println!("{id} cursor cleared"),
        }
        Ok(())
    }

    fn preview(&self, id: &InstigatorId, cursor: Option<String>) -> Result<()> {
        let def = self.catalog.require(id)?;
        let now = Utc::now();
        let state = self.state_of(def, now)?;
        let mut ctx = preview_context(def, &state, now)?;
        if cursor.is_some() {
            ctx.cursor = cursor;
        }
        let result = def
            .evaluator
            .evaluate(&ctx)
            .with_context(|| format!("evaluation of {id} failed"))?;
        if self.json {
            return print_json(&result);
        }
        if let Some(reason) = &result.skip_reason {
            println!("skipped: {reason}");
        }
        for request in &result.run_requests {
            println!(
                "run request: key={} job={}",
                request.effective_run_key().unwrap_or("-"),
                request.job_name.as_deref().unwrap_or(&def.job_name)
            );
        }
        if let Some(c) = &result.cursor {
            println!("cursor: {c}");
        }
        Ok(())
    }
}

fn print_ticks(ticks: &[Tick]) {
    let rows: Vec<Vec<String>> = ticks
        .iter()
        .map(|t| {
            let detail = t
                .error
                .as_ref()
                .map(|e| e.to_string())
                .or_else(|| t.skip_reason.clone())
                .unwrap_or_else(|| t.run_keys.join(", "));
            vec![
                t.sequence.to_string(),
                t.status.to_string(),
                t.started_at.to_rfc3339(),
                t.run_ids.len().to_string(),
                detail,
            ]
        })
        .collect();
    print_table(&["TICK", "STATUS", "STARTED AT", "RUNS", "DETAIL"], &rows);
}

/// A JSON scalar as a table cell; null becomes `-`.
fn text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "-".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_renders_null_as_dash() {
        assert_eq!(text(&serde_json::Value::Null), "-");
        assert_eq!(text(&serde_json::json!("RUNNING")), "RUNNING");
        assert_eq!(text(&serde_json::json!(3)), "3");
    }

    #[test]
    fn ids_need_three_parts() {
        assert!(parse("etl/repo/hourly").is_ok());
        assert!(parse("hourly").is_err());
    }
}
