use crate::cmd::start::DEFAULT_API_PORT;
use crate::cmd::{block_on, InstanceArgs, WorkspaceArgs};
use crate::home;
use anyhow::Result;
use clap::Args;
use instigate_daemon::{listen_for_signals, shutdown_channel};
use instigate_server::AppState;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct ApiArgs {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on (0 = OS-assigned)
    #[arg(long, default_value_t = DEFAULT_API_PORT)]
    pub port: u16,

    #[command(flatten)]
    pub instance: InstanceArgs,

    #[command(flatten)]
    pub workspace: WorkspaceArgs,
}

pub fn run(args: ApiArgs) -> Result<()> {
    let instance = home::open_service_instance(args.instance.instance_ref.as_deref())?;
    let timeout = instance.config().coordinator.evaluation_timeout();
    let workspace = args.workspace.open(instance.home(), Some(timeout))?;
    let state = AppState::from_instance(&instance, Arc::new(workspace));

    block_on(async move {
        let (trigger, mut shutdown) = shutdown_channel();
        let _signals = listen_for_signals(trigger);
        instigate_server::serve(&args.host, args.port, state, async move {
            let signal = shutdown.wait().await;
            tracing::info!(signal = %signal, "API shutting down");
        })
        .await
    })
}
