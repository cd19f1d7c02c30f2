use crate::cmd::{block_on, InstanceArgs, WorkspaceArgs};
use crate::home;
use crate::output::{print_json, print_table};
use anyhow::Result;
use chrono::Utc;
use clap::Subcommand;
use instigate_daemon::{listen_for_signals, reconcile_stale_ticks, shutdown_channel, Coordinator};
use std::sync::Arc;

#[derive(Subcommand, Debug)]
pub enum DaemonSubcommand {
    /// Run the coordinator until interrupted
    Run {
        #[command(flatten)]
        instance: InstanceArgs,

        #[command(flatten)]
        workspace: WorkspaceArgs,

        /// Scan once, wait for the evaluations it started, then exit
        #[arg(long)]
        once: bool,
    },
    /// Fail ticks a crashed daemon left STARTED
    Reconcile {
        #[command(flatten)]
        instance: InstanceArgs,
    },
}

pub fn run(subcmd: DaemonSubcommand, json: bool) -> Result<()> {
    match subcmd {
        DaemonSubcommand::Run {
            instance,
            workspace,
            once,
        } => run_coordinator(&instance, &workspace, once, json),
        DaemonSubcommand::Reconcile { instance } => reconcile(&instance, json),
    }
}

fn run_coordinator(
    instance_args: &InstanceArgs,
    workspace_args: &WorkspaceArgs,
    once: bool,
    json: bool,
) -> Result<()> {
    let instance = home::open_service_instance(instance_args.instance_ref.as_deref())?;
    let timeout = instance.config().coordinator.evaluation_timeout();
    let workspace = workspace_args.open(instance.home(), Some(timeout))?;
    let mut coordinator = Coordinator::from_instance(&instance, Arc::new(workspace));

    block_on(async move {
        if once {
            let report = coordinator.run_once(Utc::now()).await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "evaluated {}, not due {}, in flight {}, load errors {}",
                    report.evaluated,
                    report.skipped_not_due,
                    report.skipped_in_flight,
                    report.load_errors
                );
            }
            return Ok(());
        }
        let (trigger, shutdown) = shutdown_channel();
        let _signals = listen_for_signals(trigger);
        coordinator.run(shutdown).await?;
        Ok(())
    })
}

fn reconcile(instance_args: &InstanceArgs, json: bool) -> Result<()> {
    let instance = match instance_args.instance_ref.as_deref() {
        Some(r) => home::open_service_instance(Some(r))?,
        None => home::open_persistent_instance()?,
    };
    let grace = instance.config().coordinator.reconcile_grace();
    let storage = instance.storage();
    let recovered =
        block_on(async move { Ok(reconcile_stale_ticks(storage, grace, Utc::now()).await?) })?;

    if json {
        return print_json(&recovered);
    }
    if recovered.is_empty() {
        println!("No interrupted ticks.");
        return Ok(());
    }
    let rows: Vec<Vec<String>> = recovered
        .iter()
        .map(|t| {
            vec![
                t.instigator.key(),
                t.sequence.to_string(),
                t.started_at.to_rfc3339(),
            ]
        })
        .collect();
    print_table(&["INSTIGATOR", "TICK", "STARTED AT"], &rows);
    Ok(())
}
