use crate::cmd::{block_on, WorkspaceArgs};
use crate::home;
use anyhow::{Context, Result};
use clap::Args;
use instigate_core::workspace::WorkspaceTarget;
use instigate_daemon::{listen_for_signals, shutdown_channel, ProcessSpec, Supervisor};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const DEFAULT_API_PORT: u16 = 3070;

#[derive(Args, Debug)]
pub struct StartArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,

    /// Port for the API
    #[arg(long, default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Host for the API
    #[arg(long, default_value = "127.0.0.1")]
    pub api_host: String,
}

/// Open the instance, then run `instigate api` and `instigate daemon run`
/// as supervised siblings until interrupted or until one of them exits.
pub fn run(args: StartArgs) -> Result<()> {
    let instance = home::open_persistent_instance()?;
    let instance_ref = instance.get_ref().to_json()?;
    let timeout = instance.config().coordinator.evaluation_timeout();

    // Fail here rather than in both children.
    args.workspace.open(instance.home(), Some(timeout))?;
    let target = args.workspace.target(instance.home())?;

    let exe = std::env::current_exe().context("cannot locate the instigate executable")?;
    let specs = child_specs(&exe, &instance_ref, &target, &args);
    let supervisor = Supervisor::from_config(&instance.config().supervisor);

    tracing::info!(
        home = %instance.home().display(),
        api = %format!("http://{}:{}", args.api_host, args.api_port),
        "starting instigate"
    );

    block_on(async move {
        let (trigger, shutdown) = shutdown_channel();
        let _signals = listen_for_signals(trigger);
        let exit = supervisor.supervise(specs, shutdown).await?;
        if !exit.killed.is_empty() {
            tracing::warn!(killed = ?exit.killed, "some processes had to be killed");
        }
        tracing::info!(signal = %exit.signal, "instigate stopped");
        Ok(())
    })
}

fn child_specs(
    exe: &std::path::Path,
    instance_ref: &str,
    target: &WorkspaceTarget,
    args: &StartArgs,
) -> Vec<ProcessSpec> {
    let mut shared = vec!["--instance-ref".to_string(), instance_ref.to_string()];
    shared.extend(target.to_args());
    shared.push("--code-server-log-level".to_string());
    shared.push(args.workspace.code_server_log_level.clone());

    let mut api = vec![
        "api".to_string(),
        "--host".to_string(),
        args.api_host.clone(),
        "--port".to_string(),
        args.api_port.to_string(),
    ];
    api.extend(shared.iter().cloned());

    let mut daemon = vec!["daemon".to_string(), "run".to_string()];
    daemon.extend(shared);

    [("api", api), ("daemon", daemon)]
        .into_iter()
        .map(|(name, argv)| ProcessSpec {
            name: name.to_string(),
            program: PathBuf::from(exe),
            args: argv,
            env: BTreeMap::new(),
        })
        .collect()
}
