// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use chrono::Local;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::common::config;

static INIT: OnceLock<()> = OnceLock::new();

/// One event per line:
/// `<L><MMDD> <HH:MM:SS.micros> <thread> <file>:<line>] <fields>`
struct LogLineFormat;

fn level_tag(level: &Level) -> char {
    match *level {
        Level::ERROR => 'E',
        Level::WARN => 'W',
        Level::INFO => 'I',
        Level::DEBUG => 'D',
        Level::TRACE => 'T',
    }
}

/// Dense per-thread number, assigned the first time a thread logs.
fn thread_num() -> u64 {
    static NEXT_THREAD_NUM: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static THREAD_NUM: u64 = NEXT_THREAD_NUM.fetch_add(1, Ordering::Relaxed);
    }
    THREAD_NUM.with(|n| *n)
}

fn base_name(path: &str) -> &str {
    path.rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(path)
}

impl<S, N> FormatEvent<S, N> for LogLineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        write!(
            writer,
            "{}{} {} {}:{}] ",
            level_tag(meta.level()),
            Local::now().format("%m%d %H:%M:%S%.6f"),
            thread_num(),
            meta.file().map(base_name).unwrap_or("<unknown>"),
            meta.line().unwrap_or(0),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the subscriber once with the given `EnvFilter` expression;
/// later calls (of any init variant) are no-ops.
pub fn init_with_filter(filter: &str) {
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_writer(std::io::stderr)
            // ANSI sequences are garbage once stderr is redirected to a file.
            .with_ansi(atty::is(atty::Stream::Stderr))
            .event_format(LogLineFormat)
            .try_init();
    });
}

/// Filter taken from the loaded configuration (`log_filter` if set, else
/// `log_level`); "info" when no config file is present.
pub fn init_from_config() {
    let filter = config::config()
        .map(|cfg| cfg.effective_log_filter())
        .unwrap_or_else(|_| "info".to_string());
    init_with_filter(&filter);
}

pub fn init() {
    init_with_filter("info");
}

pub use tracing::{debug, error, info, trace, warn};
