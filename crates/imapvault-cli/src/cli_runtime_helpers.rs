use anyhow::Result;
use imapvault_sync::RunReport;
use serde_json::{Value as JsonValue, json};

use super::CLI_SCHEMA_VERSION;

/// How a finished command maps onto the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunStatus {
    Clean,
    PermanentFailures,
    Fatal,
}

impl RunStatus {
    pub(crate) fn code(self) -> u8 {
        match self {
            RunStatus::Clean => 0,
            RunStatus::Fatal => 1,
            RunStatus::PermanentFailures => 2,
        }
    }

    pub(crate) fn of_run(report: &RunReport) -> Self {
        if report.aborted.is_some() {
            RunStatus::Fatal
        } else if report.has_permanent_failures() {
            RunStatus::PermanentFailures
        } else {
            RunStatus::Clean
        }
    }
}

pub(crate) fn output_ok(value: JsonValue) -> Result<()> {
    println!("{}", serde_json::to_string(&ok_envelope(value))?);
    Ok(())
}

pub(crate) fn output_error(message: &str) -> Result<()> {
    println!("{}", serde_json::to_string(&error_envelope(message))?);
    Ok(())
}

fn ok_envelope(value: JsonValue) -> JsonValue {
    json!({
        "schema": CLI_SCHEMA_VERSION,
        "ok": true,
        "result": value
    })
}

fn error_envelope(message: &str) -> JsonValue {
    json!({
        "schema": CLI_SCHEMA_VERSION,
        "ok": false,
        "error": message
    })
}
