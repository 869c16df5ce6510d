// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::{Parser, Subcommand};
use volume_health_monitor::config::{AgentArgs, ControllerArgs};
use volume_health_monitor::{build, init_tracing, run_agent, run_controller};

#[derive(Parser)]
#[command(name = "volume-health-monitor")]
#[command(about = "CSI volume health monitor", long_about = None)]
#[command(version = build::CLAP_LONG_VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor volumes from the storage control plane
    Controller(ControllerArgs),

    /// Monitor the volumes mounted on one node
    Agent(AgentArgs),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Controller(args) => run_controller(args).await?,
        Commands::Agent(args) => run_agent(args).await?,
    }

    Ok(())
}
