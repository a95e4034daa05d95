use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::DownloadedMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    From,
    To,
    Cc,
    Bcc,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::From, Role::To, Role::Cc, Role::Bcc];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::From => "from",
            Role::To => "to",
            Role::Cc => "cc",
            Role::Bcc => "bcc",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "from" => Ok(Role::From),
            "to" => Ok(Role::To),
            "cc" => Ok(Role::Cc),
            "bcc" => Ok(Role::Bcc),
            other => Err(anyhow!("unknown participant role '{}'", other)),
        }
    }
}

/// Recipients as they arrive: a stored delimited column or a parsed list.
#[derive(Debug, Clone, Copy)]
pub enum RecipientInput<'a> {
    Delimited(&'a str),
    List(&'a [String]),
}

pub fn normalize_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Canonical ordered address sequence: split on `,`/`;`, trimmed,
/// lowercased, empties and repeats dropped. First occurrence wins.
pub fn normalize_recipients(input: RecipientInput<'_>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push_split = |raw: &str| {
        for part in raw.split([',', ';']) {
            if let Some(addr) = normalize_address(part) {
                if !out.contains(&addr) {
                    out.push(addr);
                }
            }
        }
    };
    match input {
        RecipientInput::Delimited(raw) => push_split(raw),
        RecipientInput::List(items) => {
            for item in items {
                push_split(item);
            }
        }
    }
    out
}

/// Resolved participant set of one message, ready to be linked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageParticipants {
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

impl MessageParticipants {
    pub fn from_inputs(
        from: &str,
        to: RecipientInput<'_>,
        cc: RecipientInput<'_>,
        bcc: RecipientInput<'_>,
    ) -> Self {
        // A sender header occasionally carries several mailboxes; only the
        // first one becomes the `from` participant.
        let from = normalize_recipients(RecipientInput::Delimited(from))
            .into_iter()
            .next();
        Self {
            from,
            to: normalize_recipients(to),
            cc: normalize_recipients(cc),
            bcc: normalize_recipients(bcc),
        }
    }

    /// Rebuilds the participant set from the denormalized text columns.
    pub fn from_record(record: &DownloadedMessage) -> Self {
        Self::from_inputs(
            &record.sender,
            RecipientInput::Delimited(&record.recipients),
            RecipientInput::Delimited(&record.cc),
            RecipientInput::Delimited(&record.bcc),
        )
    }

    pub fn links(&self) -> Vec<(&str, Role)> {
        let mut out = Vec::new();
        if let Some(from) = &self.from {
            out.push((from.as_str(), Role::From));
        }
        for (list, role) in [(&self.to, Role::To), (&self.cc, Role::Cc), (&self.bcc, Role::Bcc)] {
            out.extend(list.iter().map(|addr| (addr.as_str(), role)));
        }
        out
    }
}
