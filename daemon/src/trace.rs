/*
Copyright 2024 The Kuasar Authors.

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

use anyhow::anyhow;
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Installs the global subscriber. `log` records are bridged into it.
pub fn setup_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = init_logger_filter(log_level)
        .map_err(|e| anyhow!("failed to init logger filter: {}", e))?;

    let layers = vec![tracing_subscriber::fmt::layer().boxed()];

    Registry::default()
        .with(env_filter)
        .with(layers)
        .try_init()?;
    Ok(())
}

fn init_logger_filter(log_level: &str) -> anyhow::Result<EnvFilter> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("podshim={}", log_level).parse()?)
        .add_directive(format!("podshim_common={}", log_level).parse()?);
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::init_logger_filter;

    #[test]
    fn test_logger_filter() {
        assert!(init_logger_filter("debug").is_ok());
        assert!(init_logger_filter("not a level!").is_err());
    }
}
