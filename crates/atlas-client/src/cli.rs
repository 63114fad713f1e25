//! CLI surface (§6 Configuration). Grounded on `strata-agent::main`'s
//! `#[derive(Parser)] struct Cli` shape and `summit-ctl`'s subcommand
//! module layout.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "atlas-client", about = "Atlas Command mesh transport client")]
pub struct Cli {
    /// Path to the TOML config file. Falls back to the standard
    /// resolution chain documented on `AtlasConfig::load` when omitted.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,

    /// This node's id on the mesh.
    #[arg(long, default_value = "client")]
    pub node_id: String,

    /// The gateway node's id on the mesh.
    #[arg(long, default_value = "gateway")]
    pub gateway_node_id: String,

    /// Run against an in-memory simulated radio bus instead of hardware.
    /// Only useful paired with an `atlas-gateway` running in the same
    /// process; real deployments use the serial adapter.
    #[arg(long, default_value_t = false)]
    pub simulate: bool,

    /// Serial port path for the hardware radio adapter.
    #[arg(long)]
    pub radio_port: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one request envelope and wait for the response.
    Send {
        /// The Atlas Command to invoke.
        command: String,
        /// JSON payload for the request, e.g. '{"entity": "door_1"}'.
        #[arg(default_value = "{}")]
        data: String,
    },
}
