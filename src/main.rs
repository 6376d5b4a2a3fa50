// Copyright 2017 CoreOS, Inc.
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

mod cli;
mod ironic;
mod metadata;
mod resolver;
mod retry;
mod server;
mod util;

use slog::Drain;
use slog_scope::{debug, error, trace};

use crate::cli::LogFormat;

fn main() {
    let config = match cli::parse_args(std::env::args()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(2);
        }
    };

    // setup logging
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = match config.log_format {
        LogFormat::Full => {
            slog_async::Async::new(slog_term::FullFormat::new(decorator).build().fuse()).build()
        }
        LogFormat::Compact => {
            slog_async::Async::new(slog_term::CompactFormat::new(decorator).build().fuse()).build()
        }
    };
    let drain = slog::LevelFilter::new(drain, config.log_level.into()).fuse();
    let log = slog::Logger::root(drain, slog::o!());
    let guard = slog_scope::set_global_logger(log);

    debug!("logging initialized");
    trace!("cli configuration - {:?}", config);

    if let Err(e) = config.run() {
        error!("fatal error"; "error" => format!("{e:#}"));
        // let the async drain flush before exiting
        drop(guard);
        std::process::exit(1);
    }
}
