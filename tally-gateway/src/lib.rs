// tally - a prometheus push and aggregation gateway
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
mod test;

use anyhow::Context;
use axum::Router;
use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use tally_metrics::pipeline::WritePipeline;
use tally_metrics::storage::MetricStore;
use tally_metrics::web::make_router;
use tokio::net::TcpListener;

//
// ServerOptions
//

pub struct ServerOptions {
  pub listen_address: String,
  pub metrics_path: String,
  pub skip_consistency_check: bool,
}

//
// Server
//

// A bound but not yet serving gateway: store, write pipeline and router wired together with the
// listening socket. Splitting bind from serve lets tests bind port 0 and discover the real
// address before traffic starts.
pub struct Server {
  listener: TcpListener,
  router: Router,
}

// Bare ":9091" style addresses listen on every interface.
fn resolve_listen_address(address: &str) -> String {
  if address.starts_with(':') {
    format!("0.0.0.0{address}")
  } else {
    address.to_string()
  }
}

impl Server {
  pub async fn bind(options: ServerOptions) -> anyhow::Result<Self> {
    let store = Arc::new(MetricStore::default());
    let pipeline = Arc::new(WritePipeline::new(store));
    let router = make_router(
      pipeline,
      &options.metrics_path,
      options.skip_consistency_check,
    );

    let address = resolve_listen_address(&options.listen_address);
    let listener = TcpListener::bind(&address)
      .await
      .with_context(|| format!("can't listen on {address}"))?;
    Ok(Self { listener, router })
  }

  pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  pub async fn serve(self) -> anyhow::Result<()> {
    info!("gateway listening on {}", self.listener.local_addr()?);
    axum::serve(self.listener, self.router).await?;
    Ok(())
  }
}
