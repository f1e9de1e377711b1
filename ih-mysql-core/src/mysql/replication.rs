//! Parsed `SHOW REPLICA STATUS\G` output

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

static STATUS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\w+):\s*(.*)$").expect("valid regex"));

/// Field map of one replica status row; empty on a master
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationStatus {
    fields: BTreeMap<String, String>,
}

impl ReplicationStatus {
    /// Parse vertical (`\G`) client output
    pub fn parse(output: &str) -> Self {
        let fields = output
            .lines()
            .filter_map(|line| STATUS_LINE.captures(line))
            .map(|caps| (caps[1].to_string(), caps[2].trim().to_string()))
            .collect();
        Self { fields }
    }

    /// No replication channel, i.e. the node is a master
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn io_running(&self) -> Option<bool> {
        self.thread_running("Replica_IO_Running")
    }

    pub fn sql_running(&self) -> Option<bool> {
        self.thread_running("Replica_SQL_Running")
    }

    /// Replication lag; `None` on a master or while MySQL reports `NULL`
    pub fn seconds_behind_source(&self) -> Option<u64> {
        if self.is_empty() {
            return None;
        }
        match self.get("Seconds_Behind_Source") {
            None | Some("NULL") => None,
            Some(raw) => match raw.parse() {
                Ok(lag) => Some(lag),
                Err(_) => {
                    warn!("Unparseable Seconds_Behind_Source value '{}'", raw);
                    None
                }
            },
        }
    }

    pub fn source_host(&self) -> Option<&str> {
        self.get("Source_Host")
    }

    fn thread_running(&self, field: &str) -> Option<bool> {
        if self.is_empty() {
            None
        } else {
            Some(self.get(field) == Some("Yes"))
        }
    }
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("not replicating");
        }
        write!(
            f,
            "io={} sql={} lag={}",
            yes_no(self.io_running()),
            yes_no(self.sql_running()),
            self.seconds_behind_source()
                .map_or_else(|| "NULL".to_string(), |lag| format!("{}s", lag))
        )
    }
}

pub(crate) fn yes_no(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "Yes",
        Some(false) => "No",
        None => "None",
    }
}
