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

//! Reader for the CRI container log format:
//! `<RFC3339Nano timestamp> <stdout|stderr> <P|F> <message>`.

use std::{collections::VecDeque, io::ErrorKind, path::PathBuf, sync::Arc, time::Duration};

use log::{debug, warn};
use podshim_common::{
    api::{
        cri::ContainerState,
        shim::{LogEntry, LogOptions},
    },
    error::{Error, Result},
    signal::ExitSignal,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc::Sender,
};

use crate::client::RuntimeService;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq)]
pub struct LogLine {
    pub timestamp: OffsetDateTime,
    raw_timestamp: String,
    pub stderr: bool,
    /// The line was split by the runtime and continues in the next one.
    pub partial: bool,
    pub content: String,
}

pub fn parse_line(line: &str) -> Result<LogLine> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let mut parts = line.splitn(4, ' ');
    let (ts, stream, tag) = match (parts.next(), parts.next(), parts.next()) {
        (Some(ts), Some(stream), Some(tag)) => (ts, stream, tag),
        _ => {
            return Err(Error::InvalidArgument(format!(
                "invalid log line {:?}",
                line
            )))
        }
    };
    let content = parts.next().unwrap_or_default();
    let timestamp = OffsetDateTime::parse(ts, &Rfc3339)
        .map_err(|e| Error::InvalidArgument(format!("invalid log timestamp {}: {}", ts, e)))?;
    let stderr = match stream {
        "stdout" => false,
        "stderr" => true,
        s => return Err(Error::InvalidArgument(format!("invalid log stream {}", s))),
    };
    let partial = match tag {
        "P" => true,
        "F" => false,
        t => return Err(Error::InvalidArgument(format!("invalid log tag {}", t))),
    };
    Ok(LogLine {
        timestamp,
        raw_timestamp: ts.to_string(),
        stderr,
        partial,
        content: content.to_string(),
    })
}

/// `LogOptions` resolved against the time the request was made.
#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    since: Option<OffsetDateTime>,
    tail: Option<usize>,
    limit_bytes: Option<usize>,
    timestamps: bool,
}

impl LogFilter {
    pub fn new(opts: &LogOptions, now: OffsetDateTime) -> Result<Self> {
        let since = match (&opts.since_time, opts.since_seconds) {
            (Some(t), _) => Some(OffsetDateTime::parse(t, &Rfc3339).map_err(|e| {
                Error::InvalidArgument(format!("invalid since time {}: {}", t, e))
            })?),
            (None, Some(s)) if s > 0 => Some(now - time::Duration::seconds(s)),
            _ => None,
        };
        Ok(Self {
            since,
            tail: opts.tail_lines.filter(|t| *t >= 0).map(|t| t as usize),
            limit_bytes: opts.limit_bytes.filter(|l| *l > 0).map(|l| l as usize),
            timestamps: opts.timestamps,
        })
    }

    fn accepts(&self, line: &LogLine) -> bool {
        self.since.map(|s| line.timestamp >= s).unwrap_or(true)
    }

    fn format(&self, line: &LogLine) -> String {
        let mut message = if self.timestamps {
            format!("{} {}", line.raw_timestamp, line.content)
        } else {
            line.content.clone()
        };
        if !line.partial {
            message.push('\n');
        }
        message
    }
}

/// Streams a container log file into a channel.
pub struct LogReader {
    path: PathBuf,
    container_id: String,
    filter: LogFilter,
    follow: bool,
    runtime: Arc<dyn RuntimeService>,
    exit: Arc<ExitSignal>,
    remaining: Option<usize>,
}

impl LogReader {
    pub fn new(
        path: PathBuf,
        container_id: &str,
        filter: LogFilter,
        follow: bool,
        runtime: Arc<dyn RuntimeService>,
        exit: Arc<ExitSignal>,
    ) -> Self {
        let remaining = filter.limit_bytes;
        Self {
            path,
            container_id: container_id.to_string(),
            filter,
            follow,
            runtime,
            exit,
            remaining,
        }
    }

    /// Sends entries until the file is drained, or with `follow` until the
    /// container stopped running and the file is drained. Returns early when
    /// the receiver is dropped.
    pub async fn run(mut self, tx: Sender<LogEntry>) -> Result<()> {
        let file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("log file {} does not exist", self.path.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut buf = String::new();

        // everything already in the file, so tail can be applied
        let mut backlog = VecDeque::new();
        loop {
            let n = reader.read_line(&mut buf).await?;
            if n == 0 || !buf.ends_with('\n') {
                break;
            }
            if let Some(line) = self.parse(&buf) {
                backlog.push_back(line);
                if let Some(tail) = self.filter.tail {
                    while backlog.len() > tail {
                        backlog.pop_front();
                    }
                }
            }
            buf.clear();
        }
        for line in backlog {
            if !self.send(&tx, &line).await {
                return Ok(());
            }
        }

        if !self.follow {
            if !buf.is_empty() {
                if let Some(line) = self.parse(&buf) {
                    self.send(&tx, &line).await;
                }
            }
            return Ok(());
        }

        let mut stopping = false;
        loop {
            let n = reader.read_line(&mut buf).await?;
            if n > 0 && buf.ends_with('\n') {
                stopping = false;
                if let Some(line) = self.parse(&buf) {
                    if !self.send(&tx, &line).await {
                        return Ok(());
                    }
                }
                buf.clear();
                continue;
            }
            if n > 0 {
                // half written line, wait for the rest
                continue;
            }
            if stopping || self.exit.is_signaled() {
                return Ok(());
            }
            if !self.running().await {
                // one more pass to pick up whatever was written before exit
                stopping = true;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = self.exit.wait() => return Ok(()),
                _ = tx.closed() => return Ok(()),
            }
        }
    }

    fn parse(&self, raw: &str) -> Option<LogLine> {
        match parse_line(raw) {
            Ok(line) if self.filter.accepts(&line) => Some(line),
            Ok(_) => None,
            Err(e) => {
                warn!("skipping log line of {}: {}", self.container_id, e);
                None
            }
        }
    }

    async fn send(&mut self, tx: &Sender<LogEntry>, line: &LogLine) -> bool {
        let mut message = self.filter.format(line);
        if let Some(remaining) = self.remaining {
            if remaining == 0 {
                return false;
            }
            if message.len() > remaining {
                let mut end = remaining;
                while !message.is_char_boundary(end) {
                    end -= 1;
                }
                message.truncate(end);
            }
            self.remaining = Some(remaining - message.len());
        }
        tx.send(LogEntry {
            stderr: line.stderr,
            message,
        })
        .await
        .is_ok()
            && self.remaining != Some(0)
    }

    async fn running(&self) -> bool {
        match self.runtime.container_status(&self.container_id, false).await {
            Ok(resp) => resp
                .status
                .map(|s| s.state() == ContainerState::ContainerRunning)
                .unwrap_or(false),
            Err(e) => {
                debug!("failed to get status of {}: {}", self.container_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use podshim_common::{
        api::shim::{LogEntry, LogOptions},
        signal::ExitSignal,
    };
    use temp_dir::TempDir;
    use time::{format_description::well_known::Rfc3339, OffsetDateTime};
    use tokio::sync::mpsc::channel;

    use super::{parse_line, LogFilter, LogReader};
    use crate::client::fake::Fakes;

    const LOG: &str = "2024-05-01T10:00:00.000000001Z stdout F first line
2024-05-01T10:00:01.5Z stderr F oops
2024-05-01T10:00:02Z stdout P part one
2024-05-01T10:00:02Z stdout F part two
garbage
2024-05-01T10:00:03Z stdout F last line
";

    #[test]
    fn test_parse_line() {
        let line = parse_line("2024-05-01T10:00:00.123456789Z stderr F hello world\n").unwrap();
        assert!(line.stderr);
        assert!(!line.partial);
        assert_eq!(line.content, "hello world");
        assert_eq!(line.timestamp.nanosecond(), 123456789);

        let line = parse_line("2024-05-01T10:00:00Z stdout P ").unwrap();
        assert!(line.partial);
        assert_eq!(line.content, "");

        assert!(parse_line("garbage").is_err());
        assert!(parse_line("yesterday stdout F x").is_err());
        assert!(parse_line("2024-05-01T10:00:00Z stdin F x").is_err());
        assert!(parse_line("2024-05-01T10:00:00Z stdout X x").is_err());
    }

    #[test]
    fn test_filter_options() {
        let now = OffsetDateTime::parse("2024-05-01T10:00:10Z", &Rfc3339).unwrap();
        let filter = LogFilter::new(
            &LogOptions {
                since_seconds: Some(8),
                ..Default::default()
            },
            now,
        )
        .unwrap();
        assert_eq!(
            filter.since,
            Some(OffsetDateTime::parse("2024-05-01T10:00:02Z", &Rfc3339).unwrap())
        );

        let filter = LogFilter::new(
            &LogOptions {
                since_seconds: Some(8),
                since_time: Some("2024-05-01T09:00:00Z".to_string()),
                ..Default::default()
            },
            now,
        )
        .unwrap();
        assert_eq!(
            filter.since,
            Some(OffsetDateTime::parse("2024-05-01T09:00:00Z", &Rfc3339).unwrap())
        );

        assert!(LogFilter::new(
            &LogOptions {
                since_time: Some("last week".to_string()),
                ..Default::default()
            },
            now
        )
        .is_err());
    }

    async fn read(opts: LogOptions, follow: bool) -> Vec<LogEntry> {
        let dir = TempDir::new().unwrap();
        let path = dir.child("0.log");
        std::fs::write(&path, LOG).unwrap();
        let now = OffsetDateTime::parse("2024-05-01T10:00:10Z", &Rfc3339).unwrap();
        let fakes = Fakes::default();
        let reader = LogReader::new(
            path,
            "ctr1",
            LogFilter::new(&opts, now).unwrap(),
            follow,
            fakes.backend().runtime,
            Arc::new(ExitSignal::default()),
        );
        let (tx, mut rx) = channel(100);
        reader.run(tx).await.unwrap();
        let mut entries = vec![];
        while let Some(e) = rx.recv().await {
            entries.push(e);
        }
        entries
    }

    #[tokio::test]
    async fn test_read_all() {
        let entries = read(LogOptions::default(), false).await;
        let messages = entries.iter().map(|e| e.message.as_str()).collect::<Vec<_>>();
        assert_eq!(
            messages,
            vec![
                "first line\n",
                "oops\n",
                "part one ",
                "part two\n",
                "last line\n"
            ]
        );
        assert!(entries[1].stderr);
        assert!(!entries[0].stderr);
    }

    #[tokio::test]
    async fn test_tail_since_timestamps() {
        let entries = read(
            LogOptions {
                tail_lines: Some(2),
                ..Default::default()
            },
            false,
        )
        .await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].message, "last line\n");

        let entries = read(
            LogOptions {
                since_time: Some("2024-05-01T10:00:02Z".to_string()),
                timestamps: true,
                ..Default::default()
            },
            false,
        )
        .await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "2024-05-01T10:00:02Z part one ");
    }

    #[tokio::test]
    async fn test_limit_bytes() {
        let entries = read(
            LogOptions {
                limit_bytes: Some(15),
                ..Default::default()
            },
            false,
        )
        .await;
        let messages = entries.iter().map(|e| e.message.as_str()).collect::<Vec<_>>();
        assert_eq!(messages, vec!["first line\n", "oops"]);
    }

    #[tokio::test]
    async fn test_follow_ends_when_not_running() {
        // the fake runtime does not know the container, so it is not running
        let entries = read(LogOptions::default(), true).await;
        assert_eq!(entries.len(), 5);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let fakes = Fakes::default();
        let reader = LogReader::new(
            "/nonexistent/podshim/0.log".into(),
            "ctr1",
            LogFilter::default(),
            true,
            fakes.backend().runtime,
            Arc::new(ExitSignal::default()),
        );
        let (tx, mut rx) = channel(1);
        reader.run(tx).await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
