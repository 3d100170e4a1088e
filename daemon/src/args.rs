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

use clap::Parser;
use podshim_common::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
pub struct Args {
    /// Version info
    #[arg(short, long)]
    pub version: bool,

    /// Config file path, default is `/etc/podshim/config.toml`
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    // listen and log_level have no default here, the configuration file
    // provides them when they are not given on the command line.
    /// Unix socket the podshim API is served on
    #[arg(short, long, value_name = "FILE")]
    pub listen: Option<String>,

    /// Logging level [trace, debug, info, warn, error]
    #[arg(long, value_name = "STRING")]
    pub log_level: Option<String>,
}
