// Copyright 2025 Lablup Inc. and Jeongkyu Shin
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

//! `muster-gateway`: remote end of the tree propagation channel.
//!
//! Spawned on gateway nodes by the parent task (typically over ssh), it
//! speaks the frame protocol on stdin/stdout and runs its own engine to
//! execute or relay the requested command. Diagnostics go to stderr so
//! the frame stream stays clean.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use muster::tree::gateway::run_gateway;

#[derive(Parser, Debug)]
#[command(
    name = "muster-gateway",
    about = "muster tree propagation gateway",
    version
)]
struct Args {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::new("muster=warn"),
        1 => EnvFilter::new("muster=info"),
        2 => EnvFilter::new("muster=debug"),
        _ => EnvFilter::new("muster=trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    rt.block_on(local.run_until(run_gateway()))
}
