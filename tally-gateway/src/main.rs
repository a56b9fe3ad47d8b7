// tally - a prometheus push and aggregation gateway
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use clap::Parser;
use log::{debug, info};
use tally_gateway::{Server, ServerOptions};

#[allow(clippy::needless_raw_string_hashes)]
pub mod built_info {
  include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Parser, Debug, Clone)]
struct Options {
  /// Address and port to listen on.
  #[arg(long = "web.listen-address", default_value = ":9091")]
  pub listen_address: String,

  /// Path under which to expose pushed metrics.
  #[arg(long = "web.metrics-path", default_value = "/metrics")]
  pub metrics_path: String,

  /// Skip the expensive consistency check on every push, dangerous but faster.
  #[arg(long = "push.skip-consistency-check")]
  pub skip_consistency_check: bool,

  /// Enable verbose/debug output.
  #[arg(long = "verbose")]
  pub verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let options = Options::parse();

  // We only support verbose or !verbose, there is no need for finer grained levels here. RUST_LOG
  // still wins when set.
  let default_filter = if options.verbose { "debug" } else { "info" };
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
    .init();

  info!("tally-gateway loading: {}", built_info::PKG_VERSION);
  debug!("listen address={}", options.listen_address);
  debug!("metrics path={}", options.metrics_path);

  let server = Server::bind(ServerOptions {
    listen_address: options.listen_address,
    metrics_path: options.metrics_path,
    skip_consistency_check: options.skip_consistency_check,
  })
  .await?;
  server.serve().await
}
