/*
Copyright 2022 The Kuasar Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::Arc;

use clap::Parser;
use log::info;
use podshim::{
    args::Args,
    client::Backend,
    config::Config,
    gc::{Kicker, Reconciler},
    server,
    service::ContainerService,
    sync::NamespaceImageSync,
    trace::setup_tracing,
    version,
};
use podshim_common::signal::{handle_signals, ExitSignal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.version {
        version::print_version_info();
        return Ok(());
    }

    let mut config = Config::load_config(&args.config).await?;
    // Update config with args if they are present.
    if let Some(listen) = args.listen {
        config.daemon.listen = listen;
    }
    if let Some(log_level) = args.log_level {
        config.daemon.log_level = log_level;
    }
    setup_tracing(&config.daemon.log_level)?;

    let exit = Arc::new(ExitSignal::default());
    tokio::spawn(handle_signals(exit.clone()));

    // Calls are answered with NotReady until the backend is attached.
    let service = Arc::new(ContainerService::new(exit.clone()));
    let listener = server::bind(&config.daemon.listen).await?;
    let server = tokio::spawn(server::serve(listener, service.clone(), exit.clone()));

    let backend = Backend::connect(
        &config.runtime.endpoint,
        config.runtime.image_endpoint(),
        &config.containerd.address,
    )
    .await?;
    let (kicker, kicks) = Kicker::new();
    service.init(backend.clone(), &config, kicker.clone())?;

    let reconciler = Reconciler::new(
        backend.runtime.clone(),
        kicker,
        kicks,
        config.gc.grace_period(),
        config.gc.retry_delay(),
        exit.clone(),
    );
    tokio::spawn(reconciler.run());

    let sync = NamespaceImageSync::new(
        backend.content.clone(),
        backend.image_store.clone(),
        backend.events.clone(),
        &config.containerd.private_namespace,
        &config.containerd.public_namespace,
        config.gc.retry_delay(),
        exit.clone(),
    );
    tokio::spawn(sync.run());
    info!("podshim started");

    server.await??;
    Ok(())
}
